//! Correlation of radio commands with their completions.
//!
//! Every suspending call gets a [`RequestId`], a reply channel and an
//! expiry timer. A completion that finds no pending entry arrived after its
//! timeout and is dropped.

use std::collections::HashMap;

use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
   error::{BleError, Result},
   model::{AdapterState, CharacteristicHandle, Peripheral, PeripheralId},
   radio::RequestId,
};

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// A request awaiting its completion event.
#[derive(Debug)]
pub enum Pending {
   CheckState(Reply<AdapterState>),
   Connect {
      id: PeripheralId,
      reply: Reply<()>,
   },
   Disconnect {
      id: PeripheralId,
      reply: Reply<()>,
   },
   Read {
      handle: CharacteristicHandle,
      reply: Reply<Vec<u8>>,
   },
   Write {
      handle: CharacteristicHandle,
      reply: Reply<()>,
   },
   Notify {
      handle: CharacteristicHandle,
      enable: bool,
      reply: Reply<()>,
   },
   Retrieve(Reply<Vec<Peripheral>>),
}

impl Pending {
   pub fn peripheral(&self) -> Option<&PeripheralId> {
      match self {
         Self::Connect { id, .. } | Self::Disconnect { id, .. } => Some(id),
         Self::Read { handle, .. } | Self::Write { handle, .. } | Self::Notify { handle, .. } => {
            Some(&handle.peripheral)
         },
         Self::CheckState(_) | Self::Retrieve(_) => None,
      }
   }

   /// Whether this request occupies the peripheral's GATT slot.
   pub const fn is_gatt(&self) -> bool {
      matches!(self, Self::Read { .. } | Self::Write { .. } | Self::Notify { .. })
   }

   pub const fn label(&self) -> &'static str {
      match self {
         Self::CheckState(_) => "check state",
         Self::Connect { .. } => "connect",
         Self::Disconnect { .. } => "disconnect",
         Self::Read { .. } => "read",
         Self::Write { .. } => "write",
         Self::Notify { enable: true, .. } => "start notification",
         Self::Notify { enable: false, .. } => "stop notification",
         Self::Retrieve(_) => "retrieve connected peripherals",
      }
   }

   pub fn fail(self, err: BleError) {
      match self {
         Self::CheckState(reply) => drop(reply.send(Err(err))),
         Self::Retrieve(reply) => drop(reply.send(Err(err))),
         Self::Read { reply, .. } => drop(reply.send(Err(err))),
         Self::Connect { reply, .. }
         | Self::Disconnect { reply, .. }
         | Self::Write { reply, .. }
         | Self::Notify { reply, .. } => drop(reply.send(Err(err))),
      }
   }
}

struct Entry {
   pending: Pending,
   timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct PendingRequests {
   next: u64,
   entries: HashMap<RequestId, Entry>,
}

impl PendingRequests {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn next_id(&mut self) -> RequestId {
      self.next += 1;
      RequestId::new(self.next)
   }

   pub fn insert(&mut self, request: RequestId, pending: Pending) {
      self.entries.insert(
         request,
         Entry {
            pending,
            timer: None,
         },
      );
   }

   /// Attaches the expiry timer; aborted right away if the request already
   /// settled.
   pub fn arm(&mut self, request: RequestId, timer: JoinHandle<()>) {
      match self.entries.get_mut(&request) {
         Some(entry) => entry.timer = Some(timer),
         None => timer.abort(),
      }
   }

   /// Removes a settled request, cancelling its timer.
   pub fn take(&mut self, request: RequestId) -> Option<Pending> {
      let entry = self.entries.remove(&request)?;
      if let Some(timer) = entry.timer {
         timer.abort();
      }
      Some(entry.pending)
   }

   /// Removes an expired request. Its timer is the caller.
   pub fn expire(&mut self, request: RequestId) -> Option<Pending> {
      self.entries.remove(&request).map(|entry| entry.pending)
   }

   /// Removes `request` only if it is the kind of request `accept` expects.
   /// A completion of the wrong kind leaves the entry alone.
   pub fn take_if<F>(&mut self, request: RequestId, accept: F) -> Option<Pending>
   where
      F: FnOnce(&Pending) -> bool,
   {
      if accept(&self.entries.get(&request)?.pending) {
         self.take(request)
      } else {
         None
      }
   }

   /// Removes every request matching `pred`, oldest first.
   pub fn take_matching<F>(&mut self, pred: F) -> Vec<(RequestId, Pending)>
   where
      F: Fn(&Pending) -> bool,
   {
      let mut requests: Vec<RequestId> = self
         .entries
         .iter()
         .filter(|(_, e)| pred(&e.pending))
         .map(|(r, _)| *r)
         .collect();
      requests.sort();
      requests
         .into_iter()
         .filter_map(|r| self.take(r).map(|p| (r, p)))
         .collect()
   }

   /// Removes every request bound to `id`, oldest first.
   pub fn take_for(&mut self, id: &PeripheralId) -> Vec<(RequestId, Pending)> {
      self.take_matching(|p| p.peripheral() == Some(id))
   }

   /// Removes everything, e.g. on shutdown.
   pub fn drain(&mut self) -> Vec<Pending> {
      let mut requests: Vec<RequestId> = self.entries.keys().copied().collect();
      requests.sort();
      requests
         .into_iter()
         .filter_map(|r| self.take(r))
         .collect()
   }
}
