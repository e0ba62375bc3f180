//! Data model shared by the session components.
//!
//! Peripherals, their connection and adapter states, characteristic
//! addressing, and Bluetooth UUID parsing.

use std::{
   borrow::Borrow,
   collections::BTreeSet,
   fmt,
   str::FromStr,
   time::{Duration, Instant},
};

use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::{BleError, Result};

/// The Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16-bit assigned number against the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
   uuid_from_u32(short as u32)
}

/// Expands a 32-bit assigned number against the Bluetooth base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
   Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Parses a UUID in full hyphenated form or as a 16/32-bit short form
/// such as `"180D"`.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
   let s = s.trim();
   let invalid = || BleError::InvalidArgument(format!("invalid UUID: {s:?}"));
   match s.len() {
      4 => u16::from_str_radix(s, 16)
         .map(uuid_from_u16)
         .map_err(|_| invalid()),
      8 => u32::from_str_radix(s, 16)
         .map(uuid_from_u32)
         .map_err(|_| invalid()),
      _ => Uuid::parse_str(s).map_err(|_| invalid()),
   }
}

/// Unique peripheral identifier (a MAC address on BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeripheralId(SmolStr);

impl PeripheralId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for PeripheralId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for PeripheralId {
   fn from(s: &str) -> Self {
      Self::new(s)
   }
}

impl From<String> for PeripheralId {
   fn from(s: String) -> Self {
      Self::new(s)
   }
}

impl Borrow<str> for PeripheralId {
   fn borrow(&self) -> &str {
      &self.0
   }
}

/// Connection lifecycle of a single peripheral.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::IntoStaticStr,
)]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

impl ConnectionState {
   /// Whether a link exists or is being set up or torn down.
   pub const fn is_active(self) -> bool {
      !matches!(self, Self::Disconnected)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Adapter-level radio state.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum AdapterState {
   #[default]
   Unknown,
   Resetting,
   Unsupported,
   Unauthorized,
   PoweredOff,
   PoweredOn,
}

impl AdapterState {
   /// Whether the radio is known to be unusable. `Unknown` is not, since
   /// the radio may simply not have reported yet.
   pub const fn is_unavailable(self) -> bool {
      matches!(
         self,
         Self::Resetting | Self::Unsupported | Self::Unauthorized | Self::PoweredOff
      )
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// A single advertisement or discovery report from the radio layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Advertisement {
   pub id: PeripheralId,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
   pub services: Vec<Uuid>,
}

impl Advertisement {
   pub fn new(id: impl Into<PeripheralId>) -> Self {
      Self {
         id: id.into(),
         ..Default::default()
      }
   }

   pub fn name(mut self, name: impl Into<SmolStr>) -> Self {
      self.name = Some(name.into());
      self
   }

   pub fn rssi(mut self, rssi: i16) -> Self {
      self.rssi = Some(rssi);
      self
   }

   pub fn service(mut self, uuid: Uuid) -> Self {
      self.services.push(uuid);
      self
   }
}

/// A known peripheral as tracked by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Peripheral {
   pub id: PeripheralId,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
   pub services: BTreeSet<Uuid>,
   pub state: ConnectionState,
   pub last_seen: Instant,
}

impl Peripheral {
   pub fn new(id: PeripheralId) -> Self {
      Self {
         id,
         name: None,
         rssi: None,
         services: BTreeSet::new(),
         state: ConnectionState::Disconnected,
         last_seen: Instant::now(),
      }
   }

   /// Merges a discovery report: fresh name and RSSI overwrite, services
   /// union. The connection state is left alone.
   pub fn merge(&mut self, adv: &Advertisement) {
      if let Some(name) = &adv.name {
         self.name = Some(name.clone());
      }
      if adv.rssi.is_some() {
         self.rssi = adv.rssi;
      }
      self.services.extend(adv.services.iter().copied());
      self.last_seen = Instant::now();
   }

   /// Whether the peripheral advertises any of `services`. An empty
   /// filter matches everything.
   pub fn matches_any(&self, services: &[Uuid]) -> bool {
      services.is_empty() || services.iter().any(|s| self.services.contains(s))
   }

   pub fn idle_for(&self, now: Instant) -> Duration {
      now.saturating_duration_since(self.last_seen)
   }

   /// Converts the peripheral to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let services: Vec<String> = self.services.iter().map(Uuid::to_string).collect();
      let mut info = json!({
          "id": self.id.as_str(),
          "state": self.state.to_str(),
          "services": services,
      });
      if let Some(name) = &self.name {
         info["name"] = json!(name.as_str());
      }
      if let Some(rssi) = self.rssi {
         info["rssi"] = json!(rssi);
      }
      info
   }
}

impl From<&Advertisement> for Peripheral {
   fn from(adv: &Advertisement) -> Self {
      let mut peripheral = Self::new(adv.id.clone());
      peripheral.merge(adv);
      peripheral
   }
}

/// Addresses one characteristic on one peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
   pub peripheral: PeripheralId,
   pub service: Uuid,
   pub characteristic: Uuid,
}

impl CharacteristicHandle {
   pub fn new(peripheral: impl Into<PeripheralId>, service: Uuid, characteristic: Uuid) -> Self {
      Self {
         peripheral: peripheral.into(),
         service,
         characteristic,
      }
   }

   /// Builds a handle from textual UUIDs, accepting short forms.
   pub fn parse(peripheral: impl Into<PeripheralId>, service: &str, characteristic: &str) -> Result<Self> {
      Ok(Self::new(
         peripheral,
         parse_uuid(service)?,
         parse_uuid(characteristic)?,
      ))
   }
}

impl fmt::Display for CharacteristicHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}/{}/{}", self.peripheral, self.service, self.characteristic)
   }
}

impl FromStr for PeripheralId {
   type Err = BleError;

   fn from_str(s: &str) -> Result<Self> {
      let s = s.trim();
      if s.is_empty() {
         return Err(BleError::InvalidArgument("empty peripheral id".into()));
      }
      Ok(Self::new(s))
   }
}
