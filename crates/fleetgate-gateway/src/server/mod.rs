//! Device-facing gRPC server.

mod gateway_svc;

#[cfg(test)]
mod gateway_svc_tests;

pub use gateway_svc::GatewayServiceImpl;
