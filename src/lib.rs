//! Live position registry for public-transport vehicles.
//!
//! Driver devices report positions; riders read the current fleet with a
//! walking ETA. Records expire when their devices go quiet.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod mirror;
pub mod models;
pub mod proximity;
pub mod registry;
pub mod service;
pub mod sweeper;

pub use error::{PersistenceError, RegistryError};
pub use models::{FleetEntry, ListFilter, PositionReport, TrackingState, VehicleRecord};
pub use registry::{Registry, RegistrySettings};
pub use service::FleetService;
