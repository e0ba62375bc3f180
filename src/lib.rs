//! BLE central session manager.
//!
//! Scans for peripherals, drives per-peripheral connection state machines,
//! sequences GATT reads, writes and notification subscriptions, and fans
//! every state change out to registered listeners.
//!
//! The radio itself sits behind the [`radio::Radio`] trait. With the
//! `bluez` feature, [`radio::bluez::BluezRadio`] drives a local BlueZ
//! adapter.

pub mod central;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod radio;

pub use central::{BleManager, WeakBleManager};
pub use config::Config;
pub use error::{BleError, Result};
pub use event::{BleEvent, DisconnectCause, EventKind, ScanStopReason, StateUpdate, Subscription};
pub use model::{
   AdapterState, Advertisement, CharacteristicHandle, ConnectionState, Peripheral, PeripheralId,
};
