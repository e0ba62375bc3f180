//! Per-peripheral GATT sequencing.
//!
//! The radio link carries one attribute transaction at a time, so each
//! peripheral has at most one operation in flight. Later submissions wait
//! in a bounded FIFO queue and are issued as the previous one settles.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::requests::{Pending, Reply};
use crate::{
   error::BleError,
   model::{CharacteristicHandle, PeripheralId},
   radio::RequestId,
};

/// One submitted attribute operation and the caller waiting on it.
#[derive(Debug)]
pub enum GattRequest {
   Read {
      handle: CharacteristicHandle,
      reply: Reply<Vec<u8>>,
   },
   Write {
      handle: CharacteristicHandle,
      data: Vec<u8>,
      with_response: bool,
      reply: Reply<()>,
   },
   Notify {
      handle: CharacteristicHandle,
      enable: bool,
      reply: Reply<()>,
   },
}

impl GattRequest {
   pub fn handle(&self) -> &CharacteristicHandle {
      match self {
         Self::Read { handle, .. } | Self::Write { handle, .. } | Self::Notify { handle, .. } => {
            handle
         },
      }
   }

   pub fn fail(self, err: BleError) {
      match self {
         Self::Read { reply, .. } => drop(reply.send(Err(err))),
         Self::Write { reply, .. } | Self::Notify { reply, .. } => drop(reply.send(Err(err))),
      }
   }

   /// Converts an issued request into its pending form. Writes without
   /// response settle on submission and have none.
   pub fn into_pending(self) -> std::result::Result<Pending, Reply<()>> {
      match self {
         Self::Read { handle, reply } => Ok(Pending::Read { handle, reply }),
         Self::Write {
            with_response: false,
            reply,
            ..
         } => Err(reply),
         Self::Write { handle, reply, .. } => Ok(Pending::Write { handle, reply }),
         Self::Notify {
            handle,
            enable,
            reply,
         } => Ok(Pending::Notify {
            handle,
            enable,
            reply,
         }),
      }
   }
}

#[derive(Debug, Default)]
struct GattSession {
   in_flight: Option<RequestId>,
   queue: VecDeque<GattRequest>,
   notifying: HashSet<CharacteristicHandle>,
}

#[derive(Debug)]
pub struct GattSessions {
   sessions: HashMap<PeripheralId, GattSession>,
   queue_limit: usize,
}

impl GattSessions {
   pub fn new(queue_limit: usize) -> Self {
      Self {
         sessions: HashMap::new(),
         queue_limit,
      }
   }

   /// Queues `request` behind any outstanding operation on its peripheral.
   /// Fails with `OperationInProgress` once the queue is full.
   pub fn submit(&mut self, request: GattRequest) -> std::result::Result<(), (GattRequest, BleError)> {
      let id = request.handle().peripheral.clone();
      let session = self.sessions.entry(id.clone()).or_default();
      let waiting = session.queue.len() + usize::from(session.in_flight.is_some());
      if session.in_flight.is_some() && session.queue.len() >= self.queue_limit {
         debug!("{id}: GATT queue full ({waiting} pending)");
         return Err((request, BleError::OperationInProgress(id)));
      }
      session.queue.push_back(request);
      Ok(())
   }

   /// Pops the next request to issue, if nothing is in flight.
   pub fn next_ready(&mut self, id: &PeripheralId) -> Option<GattRequest> {
      let session = self.sessions.get_mut(id)?;
      if session.in_flight.is_some() {
         return None;
      }
      session.queue.pop_front()
   }

   pub fn begin(&mut self, id: &PeripheralId, request: RequestId) {
      self.sessions.entry(id.clone()).or_default().in_flight = Some(request);
   }

   /// Releases the slot held by `request`. Returns whether it held it.
   pub fn finish(&mut self, id: &PeripheralId, request: RequestId) -> bool {
      match self.sessions.get_mut(id) {
         Some(session) if session.in_flight == Some(request) => {
            session.in_flight = None;
            true
         },
         _ => false,
      }
   }

   pub fn set_notifying(&mut self, handle: &CharacteristicHandle, enabled: bool) {
      let session = self.sessions.entry(handle.peripheral.clone()).or_default();
      if enabled {
         session.notifying.insert(handle.clone());
      } else {
         session.notifying.remove(handle);
      }
   }

   pub fn is_notifying(&self, handle: &CharacteristicHandle) -> bool {
      self
         .sessions
         .get(&handle.peripheral)
         .is_some_and(|s| s.notifying.contains(handle))
   }

   /// In-flight plus queued operations on `id`.
   pub fn pending(&self, id: &PeripheralId) -> usize {
      self.sessions.get(id).map_or(0, |s| {
         s.queue.len() + usize::from(s.in_flight.is_some())
      })
   }

   /// Tears down the session of a peripheral whose link is gone, returning
   /// the queued requests. Subscriptions are forgotten.
   pub fn close(&mut self, id: &PeripheralId) -> Vec<GattRequest> {
      self
         .sessions
         .remove(id)
         .map(|s| s.queue.into_iter().collect())
         .unwrap_or_default()
   }

   pub fn close_all(&mut self) -> Vec<GattRequest> {
      self
         .sessions
         .drain()
         .flat_map(|(_, s)| s.queue)
         .collect()
   }
}
