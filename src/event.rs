//! Event handling system for session-wide notifications.
//!
//! This module provides the typed events published by the session and the
//! dispatcher that fans them out to registered listeners.

use std::{
   collections::HashMap,
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use log::warn;
use parking_lot::RwLock;

use crate::model::{AdapterState, CharacteristicHandle, ConnectionState, Peripheral, PeripheralId};

/// The kinds of event a listener can register for.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
pub enum EventKind {
   StateUpdated,
   PeripheralDiscovered,
   ScanStopped,
   PeripheralDisconnected,
   CharacteristicValueUpdated,
}

/// A state transition, either of the adapter or of one peripheral.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
   Adapter {
      old: AdapterState,
      new: AdapterState,
   },
   Peripheral {
      id: PeripheralId,
      old: ConnectionState,
      new: ConnectionState,
   },
}

/// Why a scan session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ScanStopReason {
   Requested,
   Timeout,
   Radio,
   PoweredOff,
}

/// Why a peripheral ended up disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DisconnectCause {
   Requested,
   LinkLost,
   PoweredOff,
}

/// Events published by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
   StateUpdated(StateUpdate),
   PeripheralDiscovered(Peripheral),
   ScanStopped(ScanStopReason),
   PeripheralDisconnected {
      id: PeripheralId,
      cause: DisconnectCause,
   },
   CharacteristicValueUpdated {
      handle: CharacteristicHandle,
      value: Vec<u8>,
   },
}

impl BleEvent {
   pub const fn kind(&self) -> EventKind {
      match self {
         Self::StateUpdated(_) => EventKind::StateUpdated,
         Self::PeripheralDiscovered(_) => EventKind::PeripheralDiscovered,
         Self::ScanStopped(_) => EventKind::ScanStopped,
         Self::PeripheralDisconnected { .. } => EventKind::PeripheralDisconnected,
         Self::CharacteristicValueUpdated { .. } => EventKind::CharacteristicValueUpdated,
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BleEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Error a listener may return to signal it failed to handle an event.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type ListenerResult = std::result::Result<(), ListenerError>;

type Listener = Arc<dyn Fn(&BleEvent) -> ListenerResult + Send + Sync>;

type FailureSink = Arc<dyn Fn(&ListenerFailure) + Send + Sync>;

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
   kind: EventKind,
   id: u64,
}

impl Subscription {
   pub const fn kind(&self) -> EventKind {
      self.kind
   }
}

/// A listener that returned an error or panicked during delivery.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
   pub subscription: Subscription,
   pub message: String,
}

/// Synchronous publish/subscribe dispatcher.
///
/// Delivery happens on the publishing thread, in registration order. The
/// listener list is snapshotted before delivery, so listeners may
/// subscribe or unsubscribe from inside a callback.
#[derive(Default)]
pub struct EventDispatcher {
   listeners: RwLock<HashMap<EventKind, Vec<(u64, Listener)>>>,
   failure_sink: RwLock<Option<FailureSink>>,
   next_id: AtomicU64,
}

impl EventDispatcher {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Registers `listener` for events of `kind`.
   pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
   where
      F: Fn(&BleEvent) -> ListenerResult + Send + Sync + 'static,
   {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self
         .listeners
         .write()
         .entry(kind)
         .or_default()
         .push((id, Arc::new(listener)));
      Subscription { kind, id }
   }

   /// Removes a listener. Returns whether it was still registered.
   pub fn unsubscribe(&self, subscription: Subscription) -> bool {
      let mut listeners = self.listeners.write();
      let Some(list) = listeners.get_mut(&subscription.kind) else {
         return false;
      };
      let before = list.len();
      list.retain(|(id, _)| *id != subscription.id);
      before != list.len()
   }

   /// Drops every listener.
   pub fn clear(&self) {
      self.listeners.write().clear();
   }

   pub fn listener_count(&self, kind: EventKind) -> usize {
      self.listeners.read().get(&kind).map_or(0, Vec::len)
   }

   /// Installs a sink that receives every listener failure.
   pub fn on_listener_failure<F>(&self, sink: F)
   where
      F: Fn(&ListenerFailure) + Send + Sync + 'static,
   {
      *self.failure_sink.write() = Some(Arc::new(sink));
   }

   /// Delivers `event` to every listener of its kind. Returns the number of
   /// listeners that handled it successfully.
   pub fn publish(&self, event: &BleEvent) -> usize {
      let kind = event.kind();
      let snapshot: Vec<(u64, Listener)> = self
         .listeners
         .read()
         .get(&kind)
         .map(|list| list.to_vec())
         .unwrap_or_default();

      let mut delivered = 0;
      for (id, listener) in snapshot {
         let message = match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {
               delivered += 1;
               continue;
            },
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
         };
         self.report(ListenerFailure {
            subscription: Subscription { kind, id },
            message,
         });
      }
      delivered
   }

   fn report(&self, failure: ListenerFailure) {
      warn!(
         "{} listener #{} failed: {}",
         failure.subscription.kind, failure.subscription.id, failure.message
      );
      let sink = self.failure_sink.read().clone();
      if let Some(sink) = sink {
         sink(&failure);
      }
   }
}

impl EventBus for EventDispatcher {
   fn emit(&self, event: BleEvent) {
      self.publish(&event);
   }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
   if let Some(s) = payload.downcast_ref::<&str>() {
      format!("panicked: {s}")
   } else if let Some(s) = payload.downcast_ref::<String>() {
      format!("panicked: {s}")
   } else {
      "panicked".to_string()
   }
}
