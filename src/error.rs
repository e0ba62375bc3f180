//! Error types for the BLE central session.
//!
//! This module defines all error types that can occur while scanning,
//! connecting and talking GATT to peripherals, plus configuration and
//! backend errors.

use thiserror::Error;

use crate::model::{AdapterState, ConnectionState, PeripheralId};

/// Main error type for the BLE central session.
#[derive(Error, Debug)]
pub enum BleError {
   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Cannot {op} {id} while {state}")]
   InvalidState {
      id: PeripheralId,
      state: ConnectionState,
      op: &'static str,
   },

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("A scan is already in progress")]
   AlreadyScanning,

   #[error("Peripheral not connected: {0}")]
   NotConnected(PeripheralId),

   #[error("Connection to {id} failed: {reason}")]
   ConnectionFailed { id: PeripheralId, reason: String },

   #[error("Connection to {0} lost")]
   ConnectionLost(PeripheralId),

   #[error("Read failed: {0}")]
   Read(String),

   #[error("Write failed: {0}")]
   Write(String),

   #[error("Notification setup failed: {0}")]
   Notification(String),

   #[error("Request timeout: {0}")]
   Timeout(&'static str),

   #[error("Too many operations pending on {0}")]
   OperationInProgress(PeripheralId),

   #[error("Adapter not available ({0})")]
   AdapterNotAvailable(AdapterState),

   #[error("Radio error: {0}")]
   Radio(String),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `BleError`.
pub type Result<T> = std::result::Result<T, BleError>;
