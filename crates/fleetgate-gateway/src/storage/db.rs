//! SQLite database for the FleetGate gateway.

pub use fleetgate_core::db::DatabaseError;

fleetgate_core::define_database!(GatewayDatabase, "Gateway database migrations complete");
