//! Radio-layer interface consumed by the session.
//!
//! The radio accepts commands without blocking and reports completions and
//! unsolicited events out of band on a [`RadioEvent`] channel. Commands
//! that expect an answer carry a [`RequestId`] which the matching
//! completion echoes back.

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
   error::Result,
   model::{AdapterState, Advertisement, CharacteristicHandle, PeripheralId},
};

#[cfg(feature = "bluez")]
pub mod bluez;
#[cfg(test)]
pub(crate) mod fake;

/// Correlation token for a radio command and its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
   pub const fn new(raw: u64) -> Self {
      Self(raw)
   }

   pub const fn get(self) -> u64 {
      self.0
   }
}

impl fmt::Display for RequestId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Failure reported by the radio for a completed command.
pub type RadioResult<T> = std::result::Result<T, String>;

/// Events delivered by the radio layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
   /// Adapter state report; `request` is set when answering `check_state`.
   StateUpdated {
      request: Option<RequestId>,
      state: AdapterState,
   },
   PeripheralDiscovered(Advertisement),
   /// The radio stopped the scan started by `request` on its own. No such
   /// event is expected after `stop_scan`.
   ScanStopped {
      request: RequestId,
   },
   Connected {
      request: RequestId,
      id: PeripheralId,
   },
   ConnectFailed {
      request: RequestId,
      id: PeripheralId,
      reason: String,
   },
   /// Link to `id` is gone, either as confirmation of a disconnect command
   /// or unsolicited.
   Disconnected {
      id: PeripheralId,
   },
   ReadCompleted {
      request: RequestId,
      result: RadioResult<Vec<u8>>,
   },
   WriteCompleted {
      request: RequestId,
      result: RadioResult<()>,
   },
   NotificationStateChanged {
      request: RequestId,
      result: RadioResult<()>,
   },
   ValueChanged {
      handle: CharacteristicHandle,
      value: Vec<u8>,
   },
   ConnectedPeripheralsRetrieved {
      request: RequestId,
      result: RadioResult<Vec<Advertisement>>,
   },
}

pub type RadioEventSender = mpsc::Sender<RadioEvent>;
pub type RadioEventReceiver = mpsc::Receiver<RadioEvent>;

/// Creates the channel a radio uses to report events to the session.
pub fn channel(capacity: usize) -> (RadioEventSender, RadioEventReceiver) {
   mpsc::channel(capacity.max(1))
}

/// Primitive command interface of the radio layer.
///
/// Every method only submits the command. `Err` means the radio rejected
/// it outright, in which case no completion event follows.
pub trait Radio: Send + Sync {
   fn check_state(&self, request: RequestId) -> Result<()>;

   fn scan(&self, request: RequestId, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

   /// Ends the current scan. Completes silently.
   fn stop_scan(&self) -> Result<()>;

   fn connect(&self, request: RequestId, id: &PeripheralId) -> Result<()>;

   fn disconnect(&self, request: RequestId, id: &PeripheralId) -> Result<()>;

   fn read(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()>;

   /// Without response, no `WriteCompleted` is expected.
   fn write(
      &self,
      request: RequestId,
      handle: &CharacteristicHandle,
      data: &[u8],
      with_response: bool,
   ) -> Result<()>;

   fn start_notification(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()>;

   fn stop_notification(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()>;

   fn retrieve_connected(&self, request: RequestId, services: &[Uuid]) -> Result<()>;
}
