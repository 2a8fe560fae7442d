//! Persistent control channel to the cloud control plane.

mod config;
mod error;
mod worker;

pub use config::{ControlConfig, ReconnectPolicy};
pub use error::ControlError;
pub use worker::{ControlChannelWorker, GatewayReport};
