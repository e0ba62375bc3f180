//! Test double for the radio layer.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Radio, RequestId};
use crate::{
   error::{BleError, Result},
   model::{CharacteristicHandle, PeripheralId},
};

/// A command as seen by the radio.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RadioCommand {
   CheckState(RequestId),
   Scan {
      request: RequestId,
      services: Vec<Uuid>,
      allow_duplicates: bool,
   },
   StopScan,
   Connect(RequestId, PeripheralId),
   Disconnect(RequestId, PeripheralId),
   Read(RequestId, CharacteristicHandle),
   Write {
      request: RequestId,
      handle: CharacteristicHandle,
      data: Vec<u8>,
      with_response: bool,
   },
   StartNotification(RequestId, CharacteristicHandle),
   StopNotification(RequestId, CharacteristicHandle),
   RetrieveConnected(RequestId, Vec<Uuid>),
}

/// Records every command on a channel; optionally rejects them.
pub(crate) struct FakeRadio {
   commands: mpsc::UnboundedSender<RadioCommand>,
   reject: AtomicBool,
}

impl FakeRadio {
   pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RadioCommand>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (
         Arc::new(Self {
            commands: tx,
            reject: AtomicBool::new(false),
         }),
         rx,
      )
   }

   /// Makes subsequent commands fail synchronously.
   pub(crate) fn set_rejecting(&self, reject: bool) {
      self.reject.store(reject, Ordering::Relaxed);
   }

   fn record(&self, command: RadioCommand) -> Result<()> {
      if self.reject.load(Ordering::Relaxed) {
         return Err(BleError::Radio(format!("{command:?}")));
      }
      let _ = self.commands.send(command);
      Ok(())
   }
}

impl Radio for FakeRadio {
   fn check_state(&self, request: RequestId) -> Result<()> {
      self.record(RadioCommand::CheckState(request))
   }

   fn scan(&self, request: RequestId, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
      self.record(RadioCommand::Scan {
         request,
         services: services.to_vec(),
         allow_duplicates,
      })
   }

   fn stop_scan(&self) -> Result<()> {
      self.record(RadioCommand::StopScan)
   }

   fn connect(&self, request: RequestId, id: &PeripheralId) -> Result<()> {
      self.record(RadioCommand::Connect(request, id.clone()))
   }

   fn disconnect(&self, request: RequestId, id: &PeripheralId) -> Result<()> {
      self.record(RadioCommand::Disconnect(request, id.clone()))
   }

   fn read(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()> {
      self.record(RadioCommand::Read(request, handle.clone()))
   }

   fn write(
      &self,
      request: RequestId,
      handle: &CharacteristicHandle,
      data: &[u8],
      with_response: bool,
   ) -> Result<()> {
      self.record(RadioCommand::Write {
         request,
         handle: handle.clone(),
         data: data.to_vec(),
         with_response,
      })
   }

   fn start_notification(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()> {
      self.record(RadioCommand::StartNotification(request, handle.clone()))
   }

   fn stop_notification(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()> {
      self.record(RadioCommand::StopNotification(request, handle.clone()))
   }

   fn retrieve_connected(&self, request: RequestId, services: &[Uuid]) -> Result<()> {
      self.record(RadioCommand::RetrieveConnected(request, services.to_vec()))
   }
}
