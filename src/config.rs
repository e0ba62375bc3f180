//! Configuration management for the BLE session.
//!
//! This module handles loading and saving configuration from disk,
//! including request bounds and queue limits.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{BleError, Result};

/// Main configuration structure for the session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Bound on GATT operations, state checks and retrievals.
   #[serde(default = "default_request_timeout")]
   pub request_timeout_ms: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_disconnect_timeout")]
   pub disconnect_timeout_ms: u64,

   /// Operations allowed to wait behind the in-flight one, per peripheral.
   #[serde(default = "default_gatt_queue_limit")]
   pub gatt_queue_limit: usize,

   #[serde(default = "default_channel_capacity")]
   pub channel_capacity: usize,

   /// Forget idle peripherals not seen for this long. Disabled if unset.
   #[serde(default)]
   pub prune_after_secs: Option<u64>,

   #[serde(default = "default_scan_secs")]
   pub default_scan_secs: f64,
}

const fn default_request_timeout() -> u64 {
   5_000
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_disconnect_timeout() -> u64 {
   5_000
}

const fn default_gatt_queue_limit() -> usize {
   16
}

const fn default_channel_capacity() -> usize {
   1000
}

const fn default_scan_secs() -> f64 {
   5.0
}

impl Default for Config {
   fn default() -> Self {
      Self {
         request_timeout_ms: default_request_timeout(),
         connect_timeout_ms: default_connect_timeout(),
         disconnect_timeout_ms: default_disconnect_timeout(),
         gatt_queue_limit: default_gatt_queue_limit(),
         channel_capacity: default_channel_capacity(),
         prune_after_secs: None,
         default_scan_secs: default_scan_secs(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing defaults there if it is missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLE_CENTRAL_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(BleError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("ble-central").join("config.toml"))
   }

   pub const fn request_timeout(&self) -> Duration {
      Duration::from_millis(self.request_timeout_ms)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn disconnect_timeout(&self) -> Duration {
      Duration::from_millis(self.disconnect_timeout_ms)
   }

   pub fn prune_after(&self) -> Option<Duration> {
      self
         .prune_after_secs
         .filter(|&s| s > 0)
         .map(Duration::from_secs)
   }
}
