//! Error types for the battery reporting service.
//!
//! This module defines the crate-wide error type covering Bluetooth, D-Bus,
//! I/O, configuration, protocol and metadata store failures.

use bluer::Address;
use thiserror::Error;

use crate::{airpods::parser::ProtoError, store};

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum ServiceError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Invalid payload: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Metadata store error: {0}")]
   Store(#[from] store::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `ServiceError`.
pub type Result<T> = std::result::Result<T, ServiceError>;
