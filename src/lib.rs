//! ONVIF camera discovery, registration and health monitoring.
//!
//! [`CameraManager`] is the entry point: it finds devices with WS-Discovery,
//! negotiates credentials, keeps the registered set in a persistent
//! directory and polls each camera to derive its online state.

pub mod config;
pub mod database;
pub mod directory;
pub mod discovery;
pub mod errors;
pub mod health;
pub mod manager;
pub mod models;
pub mod onvif;
pub mod registration;
pub mod soap;
pub mod ws_discovery;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ManagerConfig;
pub use errors::{CameraError, ProtocolError, ProtocolErrorKind, Result};
pub use manager::CameraManager;
pub use models::{
    AggregateStats, CameraOverview, CameraRecord, CameraState, CameraStatus, Credentials, DeviceInfo,
    DiscoveryCandidate,
};
