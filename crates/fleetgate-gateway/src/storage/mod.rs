//! SQLite-backed persistence for the gateway.

mod db;
mod models;
mod queries;


pub use db::GatewayDatabase;
pub use models::{DeviceRecord, RegistrationStatus};
