//! FleetGate gateway library.
//!
//! The gateway mediates between an untrusted local device network and the
//! cloud control plane: it tracks which devices exist, enforces licensing,
//! distributes signed update packages, and relays per-device outcomes
//! upstream over a single persistent control channel.

pub mod control;
pub mod distribution;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod storage;
