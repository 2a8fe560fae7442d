//! Gateway-facing gRPC server on the device.

mod agent_svc;

#[cfg(test)]
mod agent_svc_tests;

pub use agent_svc::AgentServiceImpl;
