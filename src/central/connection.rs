//! Per-peripheral connection state machines.

use std::{collections::HashMap, time::Instant};

use log::info;

use super::registry::PeripheralRegistry;
use crate::{
   error::{BleError, Result},
   model::{ConnectionState, PeripheralId},
};

/// Inputs that drive a connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionInput {
   Connect,
   ConnectSucceeded,
   ConnectFailed,
   Disconnect,
   DisconnectConfirmed,
   LinkLost,
}

impl ConnectionState {
   /// The transition table. `None` means the input is illegal here.
   pub const fn next(self, input: ConnectionInput) -> Option<Self> {
      use ConnectionInput as I;
      use ConnectionState as S;
      match (self, input) {
         (S::Disconnected, I::Connect) => Some(S::Connecting),
         (S::Connecting, I::ConnectSucceeded) => Some(S::Connected),
         (S::Connecting, I::ConnectFailed) => Some(S::Disconnected),
         (S::Connecting | S::Connected, I::Disconnect) => Some(S::Disconnecting),
         (S::Disconnecting, I::DisconnectConfirmed) => Some(S::Disconnected),
         (S::Connecting | S::Connected | S::Disconnecting, I::LinkLost) => Some(S::Disconnected),
         _ => None,
      }
   }
}

#[derive(Debug, Default)]
struct ConnectionMachine {
   state: ConnectionState,
   connected_at: Option<Instant>,
}

/// One state machine per peripheral id. Every transition is mirrored into
/// the registry, which publishes it.
#[derive(Debug, Default)]
pub struct ConnectionMachines {
   machines: HashMap<PeripheralId, ConnectionMachine>,
}

impl ConnectionMachines {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn state(&self, id: &PeripheralId) -> ConnectionState {
      self
         .machines
         .get(id)
         .map_or(ConnectionState::Disconnected, |m| m.state)
   }

   /// Checks that `input` is legal for `id` without applying it.
   pub fn check(&self, id: &PeripheralId, input: ConnectionInput) -> Result<ConnectionState> {
      let state = self.state(id);
      state.next(input).ok_or_else(|| BleError::InvalidState {
         id: id.clone(),
         state,
         op: input.into(),
      })
   }

   /// Applies `input`, returning the state it left.
   pub fn apply(
      &mut self,
      id: &PeripheralId,
      input: ConnectionInput,
      registry: &mut PeripheralRegistry,
   ) -> Result<ConnectionState> {
      let next = self.check(id, input)?;
      let machine = self.machines.entry(id.clone()).or_default();
      let old = std::mem::replace(&mut machine.state, next);

      match next {
         ConnectionState::Connected => {
            machine.connected_at = Some(Instant::now());
            info!("{id}: connected");
         },
         ConnectionState::Disconnected => {
            if let Some(since) = machine.connected_at.take() {
               info!("{id}: disconnected after {:?} ({input})", since.elapsed());
            } else {
               info!("{id}: disconnected ({input})");
            }
         },
         _ => {},
      }

      registry.set_connection_state(id, next);
      Ok(old)
   }

   /// Ids whose machine is not `Disconnected`.
   pub fn active(&self) -> Vec<PeripheralId> {
      let mut ids: Vec<_> = self
         .machines
         .iter()
         .filter(|(_, m)| m.state.is_active())
         .map(|(id, _)| id.clone())
         .collect();
      ids.sort();
      ids
   }
}
