//! FleetGate Protocol Buffers
//!
//! Generated protobuf code for the FleetGate gRPC API.
//!
//! This crate contains:
//! - `GatewayService` for device registration, licensing, and check-ins
//! - `AgentService` for package and command pushes to devices
//! - `ControlService` for the gateway's persistent cloud channel

#![allow(clippy::derive_partial_eq_without_eq)]

/// FleetGate v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("fleetgate.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that need Timestamp conversion
pub use prost_types;
