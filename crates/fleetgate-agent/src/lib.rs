//! FleetGate agent library.
//!
//! The agent runs on each field device. It registers with the gateway,
//! keeps its license renewed, accepts signed update packages, installs
//! them under a post-install probation window, and rolls back when the
//! device's own logs show a failure signature.

pub mod checkin;
pub mod executor;
pub mod installer;
pub mod monitor;
pub mod server;
pub mod store;
