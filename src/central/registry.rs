//! Registry of known peripherals.

use std::{
   collections::HashMap,
   time::{Duration, Instant},
};

use log::debug;

use crate::{
   event::{BleEvent, EventSender, StateUpdate},
   model::{Advertisement, ConnectionState, Peripheral, PeripheralId},
};

pub struct PeripheralRegistry {
   peripherals: HashMap<PeripheralId, Peripheral>,
   events: EventSender,
}

impl PeripheralRegistry {
   pub fn new(events: EventSender) -> Self {
      Self {
         peripherals: HashMap::new(),
         events,
      }
   }

   /// Inserts or merges a discovery report and returns the merged record.
   pub fn upsert(&mut self, adv: &Advertisement) -> Peripheral {
      let peripheral = self
         .peripherals
         .entry(adv.id.clone())
         .and_modify(|p| p.merge(adv))
         .or_insert_with(|| {
            debug!("New peripheral {}", adv.id);
            Peripheral::from(adv)
         });
      peripheral.clone()
   }

   /// Makes sure a record exists for `id`, e.g. before connecting to a
   /// peripheral that was never seen advertising.
   pub fn ensure(&mut self, id: &PeripheralId) {
      if !self.peripherals.contains_key(id) {
         self
            .peripherals
            .insert(id.clone(), Peripheral::new(id.clone()));
      }
   }

   pub fn get(&self, id: &PeripheralId) -> Option<Peripheral> {
      self.peripherals.get(id).cloned()
   }

   /// Records a new connection state, publishing `StateUpdated` if it
   /// changed. Returns the previous state.
   pub fn set_connection_state(&mut self, id: &PeripheralId, state: ConnectionState) -> ConnectionState {
      self.ensure(id);
      let Some(peripheral) = self.peripherals.get_mut(id) else {
         return ConnectionState::Disconnected;
      };
      let old = std::mem::replace(&mut peripheral.state, state);
      if old != state {
         debug!("{id}: {old} -> {state}");
         self.events.emit(BleEvent::StateUpdated(StateUpdate::Peripheral {
            id: id.clone(),
            old,
            new: state,
         }));
      }
      old
   }

   /// Snapshot of every known peripheral, ordered by id.
   pub fn list(&self) -> Vec<Peripheral> {
      let mut list: Vec<_> = self.peripherals.values().cloned().collect();
      list.sort_by(|a, b| a.id.cmp(&b.id));
      list
   }

   /// Forgets idle peripherals not seen for `max_age`. Peripherals with a
   /// link in any state are kept.
   pub fn prune(&mut self, max_age: Duration, now: Instant) -> usize {
      let before = self.peripherals.len();
      self
         .peripherals
         .retain(|_, p| p.state.is_active() || p.idle_for(now) < max_age);
      let pruned = before - self.peripherals.len();
      if pruned > 0 {
         debug!("Pruned {pruned} stale peripherals");
      }
      pruned
   }
}
