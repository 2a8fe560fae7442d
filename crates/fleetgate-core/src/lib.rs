//! FleetGate Core Library
//!
//! Shared functionality for FleetGate components:
//! - Update policy and channel configuration
//! - Common error types
//! - Tracing initialization
//! - SQLite pool helpers shared by gateway storage

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
