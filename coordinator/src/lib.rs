pub mod clock;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod heartbeat;
pub mod ingest;
mod locks;
pub mod metrics;
pub mod model;
pub mod publish;
pub mod rest;
pub mod store;
pub mod sweeper;
pub mod validate;

pub use coordinator::{Coordinator, DeviceIdentity, Operator};
pub use errors::{Error, ErrorKind, Result};
