//! gpucell-api: REST API server for gpucell
//!
//! Exposes the cell scheduler over HTTP:
//! - Reservations and releases
//! - Free-cell inspection and inventory snapshots
//! - Node events for the topology listener

pub mod rest;

pub use rest::{create_router, AppState};
