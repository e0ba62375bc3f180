//! The session core: registry, scanning, connection state machines and
//! GATT sequencing, composed behind [`BleManager`].

mod connection;
mod gatt;
mod manager;
mod registry;
mod requests;
mod scan;

pub use manager::{BleManager, WeakBleManager};
