//! The BLE central session.
//!
//! [`BleManager`] is a cheap, cloneable handle. All session state (the
//! peripheral registry, the scan session, connection machines, GATT queues
//! and correlated requests) lives in a single actor task fed by three
//! sources: radio events, its own timers and caller commands. Radio events
//! are drained first so every command observes the latest radio state.

use std::{
   sync::{Arc, Weak},
   time::{Duration, Instant},
};

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Interval, MissedTickBehavior},
};
use uuid::Uuid;

use super::{
   connection::{ConnectionInput, ConnectionMachines},
   gatt::{GattRequest, GattSessions},
   registry::PeripheralRegistry,
   requests::{Pending, PendingRequests, Reply},
   scan::{self, ScanController, ScanId, ScanWaiter},
};
use crate::{
   config::Config,
   error::{BleError, Result},
   event::{
      BleEvent, DisconnectCause, EventDispatcher, EventKind, EventSender, ListenerResult,
      ScanStopReason, StateUpdate, Subscription,
   },
   model::{
      AdapterState, Advertisement, CharacteristicHandle, ConnectionState, Peripheral, PeripheralId,
   },
   radio::{Radio, RadioEvent, RadioEventReceiver, RadioResult, RequestId},
};

/// Upper bound between two registry pruning passes.
const PRUNE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   CheckState(Reply<AdapterState>),
   StartScan {
      services: Vec<Uuid>,
      duration_secs: f64,
      allow_duplicates: bool,
      until_stopped: Option<ScanWaiter>,
      reply: Reply<()>,
   },
   StopScan(Reply<()>),
   Connect(PeripheralId, Reply<()>),
   Disconnect(PeripheralId, Reply<()>),
   Gatt(GattRequest),
   RetrieveConnected(Vec<Uuid>, Reply<Vec<Peripheral>>),

   // Queries
   GetPeripheral(PeripheralId, oneshot::Sender<Option<Peripheral>>),
   GetAllPeripherals(oneshot::Sender<Vec<Peripheral>>),
   GetAdapterState(oneshot::Sender<AdapterState>),
   IsScanning(oneshot::Sender<bool>),
   PendingOperations(PeripheralId, oneshot::Sender<usize>),
}

/// Timer expiries the actor sends to itself.
#[derive(Debug)]
enum Loopback {
   ScanExpired(ScanId),
   RequestExpired(RequestId),
}

// === Facade ===

/// Handle to a BLE central session.
///
/// Every suspending operation resolves exactly once: with its result, a
/// typed error, or [`BleError::Timeout`] once its bound elapses. Dropping
/// the last handle shuts the session down.
///
/// Listeners are owned by the session, so a listener holding a `BleManager`
/// keeps it alive forever. Capture a [`WeakBleManager`] instead.
#[derive(Clone)]
pub struct BleManager {
   inbox: mpsc::Sender<ManagerCommand>,
   events: Arc<EventDispatcher>,
}

/// Handle that does not keep the session alive.
#[derive(Clone)]
pub struct WeakBleManager {
   inbox: mpsc::WeakSender<ManagerCommand>,
   events: Weak<EventDispatcher>,
}

impl WeakBleManager {
   /// Returns a usable handle, or `None` once the session is shutting down.
   pub fn upgrade(&self) -> Option<BleManager> {
      Some(BleManager {
         inbox: self.inbox.upgrade()?,
         events: self.events.upgrade()?,
      })
   }
}

impl BleManager {
   /// Starts a session on top of `radio`, which reports back on
   /// `radio_events`. Must be called from within a Tokio runtime.
   pub fn new(radio: Arc<dyn Radio>, radio_events: RadioEventReceiver, config: Config) -> Self {
      let events = EventDispatcher::new();
      let (command_tx, command_rx) = mpsc::channel(config.channel_capacity.max(1));
      tokio::spawn(ManagerActor::new(config, radio, events.clone(), command_rx, radio_events).run());
      Self {
         inbox: command_tx,
         events,
      }
   }

   pub fn downgrade(&self) -> WeakBleManager {
      WeakBleManager {
         inbox: self.inbox.downgrade(),
         events: Arc::downgrade(&self.events),
      }
   }

   async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| BleError::ManagerShutdown)?;
      rx.await.map_err(|_| BleError::ManagerShutdown)?
   }

   async fn query<T: Default>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> T {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(command(tx)).await.is_err() {
         return T::default();
      }
      rx.await.unwrap_or_default()
   }

   /// Asks the radio for the adapter state. The answer is also published
   /// as a `StateUpdated` event.
   pub async fn check_state(&self) -> Result<AdapterState> {
      self.request(ManagerCommand::CheckState).await
   }

   /// Starts a scan session that ends by itself after `duration_secs`.
   /// An empty `services` filter accepts every peripheral.
   pub async fn start_scan(
      &self,
      services: &[Uuid],
      duration_secs: f64,
      allow_duplicates: bool,
   ) -> Result<()> {
      self
         .request(|reply| ManagerCommand::StartScan {
            services: services.to_vec(),
            duration_secs,
            allow_duplicates,
            until_stopped: None,
            reply,
         })
         .await
   }

   /// Runs a scan session to completion and returns the peripherals it
   /// reported, in discovery order.
   pub async fn scan(
      &self,
      services: &[Uuid],
      duration_secs: f64,
      allow_duplicates: bool,
   ) -> Result<Vec<Peripheral>> {
      let (done_tx, done_rx) = oneshot::channel();
      self
         .request(|reply| ManagerCommand::StartScan {
            services: services.to_vec(),
            duration_secs,
            allow_duplicates,
            until_stopped: Some(done_tx),
            reply,
         })
         .await?;
      done_rx.await.map_err(|_| BleError::ManagerShutdown)
   }

   /// Ends the current scan session. A no-op when not scanning.
   pub async fn stop_scan(&self) -> Result<()> {
      self.request(ManagerCommand::StopScan).await
   }

   pub async fn connect(&self, id: impl Into<PeripheralId>) -> Result<()> {
      let id = id.into();
      self.request(|reply| ManagerCommand::Connect(id, reply)).await
   }

   pub async fn disconnect(&self, id: impl Into<PeripheralId>) -> Result<()> {
      let id = id.into();
      self.request(|reply| ManagerCommand::Disconnect(id, reply)).await
   }

   pub async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
      self
         .request(|reply| {
            ManagerCommand::Gatt(GattRequest::Read {
               handle: handle.clone(),
               reply,
            })
         })
         .await
   }

   /// Writes `data`. Without response, resolves once the radio accepted the
   /// write.
   pub async fn write(
      &self,
      handle: &CharacteristicHandle,
      data: &[u8],
      with_response: bool,
   ) -> Result<()> {
      self
         .request(|reply| {
            ManagerCommand::Gatt(GattRequest::Write {
               handle: handle.clone(),
               data: data.to_vec(),
               with_response,
               reply,
            })
         })
         .await
   }

   /// Subscribes to value changes of `handle`. Changes are published as
   /// `CharacteristicValueUpdated` events.
   pub async fn start_notification(&self, handle: &CharacteristicHandle) -> Result<()> {
      self.notify(handle, true).await
   }

   pub async fn stop_notification(&self, handle: &CharacteristicHandle) -> Result<()> {
      self.notify(handle, false).await
   }

   async fn notify(&self, handle: &CharacteristicHandle, enable: bool) -> Result<()> {
      self
         .request(|reply| {
            ManagerCommand::Gatt(GattRequest::Notify {
               handle: handle.clone(),
               enable,
               reply,
            })
         })
         .await
   }

   /// Peripherals the system already holds a link to that expose any of
   /// `services`. Their connection state is left untouched.
   pub async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<Peripheral>> {
      self
         .request(|reply| ManagerCommand::RetrieveConnected(services.to_vec(), reply))
         .await
   }

   pub async fn peripheral(&self, id: impl Into<PeripheralId>) -> Option<Peripheral> {
      let id = id.into();
      self
         .query(|tx| ManagerCommand::GetPeripheral(id, tx))
         .await
   }

   /// Every known peripheral, sorted by id.
   pub async fn peripherals(&self) -> Vec<Peripheral> {
      self.query(ManagerCommand::GetAllPeripherals).await
   }

   pub async fn connection_state(&self, id: impl Into<PeripheralId>) -> ConnectionState {
      self
         .peripheral(id)
         .await
         .map(|p| p.state)
         .unwrap_or_default()
   }

   /// Last adapter state reported by the radio.
   pub async fn adapter_state(&self) -> AdapterState {
      self.query(ManagerCommand::GetAdapterState).await
   }

   pub async fn is_scanning(&self) -> bool {
      self.query(ManagerCommand::IsScanning).await
   }

   /// GATT operations in flight or queued on `id`.
   pub async fn pending_operations(&self, id: impl Into<PeripheralId>) -> usize {
      let id = id.into();
      self
         .query(|tx| ManagerCommand::PendingOperations(id, tx))
         .await
   }

   // === Listeners ===

   pub fn events(&self) -> &Arc<EventDispatcher> {
      &self.events
   }

   pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
   where
      F: Fn(&BleEvent) -> ListenerResult + Send + Sync + 'static,
   {
      self.events.subscribe(kind, listener)
   }

   pub fn unsubscribe(&self, subscription: Subscription) -> bool {
      self.events.unsubscribe(subscription)
   }

   pub fn on_state_updated<F>(&self, listener: F) -> Subscription
   where
      F: Fn(&StateUpdate) -> ListenerResult + Send + Sync + 'static,
   {
      self.subscribe(EventKind::StateUpdated, move |event| match event {
         BleEvent::StateUpdated(update) => listener(update),
         _ => Ok(()),
      })
   }

   pub fn on_peripheral_discovered<F>(&self, listener: F) -> Subscription
   where
      F: Fn(&Peripheral) -> ListenerResult + Send + Sync + 'static,
   {
      self.subscribe(EventKind::PeripheralDiscovered, move |event| match event {
         BleEvent::PeripheralDiscovered(peripheral) => listener(peripheral),
         _ => Ok(()),
      })
   }

   pub fn on_scan_stopped<F>(&self, listener: F) -> Subscription
   where
      F: Fn(ScanStopReason) -> ListenerResult + Send + Sync + 'static,
   {
      self.subscribe(EventKind::ScanStopped, move |event| match event {
         BleEvent::ScanStopped(reason) => listener(*reason),
         _ => Ok(()),
      })
   }

   pub fn on_peripheral_disconnected<F>(&self, listener: F) -> Subscription
   where
      F: Fn(&PeripheralId, DisconnectCause) -> ListenerResult + Send + Sync + 'static,
   {
      self.subscribe(EventKind::PeripheralDisconnected, move |event| match event {
         BleEvent::PeripheralDisconnected { id, cause } => listener(id, *cause),
         _ => Ok(()),
      })
   }

   pub fn on_characteristic_value_updated<F>(&self, listener: F) -> Subscription
   where
      F: Fn(&CharacteristicHandle, &[u8]) -> ListenerResult + Send + Sync + 'static,
   {
      self.subscribe(EventKind::CharacteristicValueUpdated, move |event| match event {
         BleEvent::CharacteristicValueUpdated { handle, value } => listener(handle, value),
         _ => Ok(()),
      })
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   radio: Arc<dyn Radio>,
   dispatcher: Arc<EventDispatcher>,
   events: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   radio_rx: RadioEventReceiver,
   loopback_rx: mpsc::Receiver<Loopback>,
   loopback_tx: mpsc::Sender<Loopback>,

   // State
   adapter_state: AdapterState,
   registry: PeripheralRegistry,
   scan: ScanController,
   connections: ConnectionMachines,
   gatt: GattSessions,
   requests: PendingRequests,
}

impl ManagerActor {
   fn new(
      config: Config,
      radio: Arc<dyn Radio>,
      dispatcher: Arc<EventDispatcher>,
      command_rx: mpsc::Receiver<ManagerCommand>,
      radio_rx: RadioEventReceiver,
   ) -> Self {
      let events: EventSender = dispatcher.clone();
      let (loopback_tx, loopback_rx) = mpsc::channel(config.channel_capacity.max(1));
      Self {
         registry: PeripheralRegistry::new(events.clone()),
         scan: ScanController::new(radio.clone(), events.clone()),
         connections: ConnectionMachines::new(),
         gatt: GattSessions::new(config.gatt_queue_limit),
         requests: PendingRequests::new(),
         adapter_state: AdapterState::Unknown,
         config,
         radio,
         dispatcher,
         events,
         command_rx,
         radio_rx,
         loopback_rx,
         loopback_tx,
      }
   }

   async fn run(mut self) {
      info!("BLE session starting up");

      let mut prune_interval = self.config.prune_after().map(|max_age| {
         let mut interval = time::interval(max_age.min(PRUNE_CHECK_INTERVAL));
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         interval
      });
      let mut radio_open = true;

      loop {
         select! {
             biased;
             event = self.radio_rx.recv(), if radio_open => {
                 match event {
                     Some(event) => self.handle_radio_event(event),
                     None => {
                         warn!("Radio event channel closed");
                         radio_open = false;
                     },
                 }
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_loopback(cmd);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("BLE session shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             () = tick(&mut prune_interval) => {
                 self.prune();
             }
         }
      }

      self.cleanup();
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::CheckState(reply) => self.check_state(reply),
         ManagerCommand::StartScan {
            services,
            duration_secs,
            allow_duplicates,
            until_stopped,
            reply,
         } => {
            let result = self.start_scan(&services, duration_secs, allow_duplicates, until_stopped);
            let _ = reply.send(result);
         },
         ManagerCommand::StopScan(reply) => {
            if !self.scan.stop(ScanStopReason::Requested) {
               debug!("Stop requested while not scanning");
            }
            let _ = reply.send(Ok(()));
         },
         ManagerCommand::Connect(id, reply) => self.connect(id, reply),
         ManagerCommand::Disconnect(id, reply) => self.disconnect(id, reply),
         ManagerCommand::Gatt(request) => self.submit_gatt(request),
         ManagerCommand::RetrieveConnected(services, reply) => {
            self.retrieve_connected(&services, reply);
         },
         ManagerCommand::GetPeripheral(id, tx) => {
            let _ = tx.send(self.registry.get(&id));
         },
         ManagerCommand::GetAllPeripherals(tx) => {
            let _ = tx.send(self.registry.list());
         },
         ManagerCommand::GetAdapterState(tx) => {
            let _ = tx.send(self.adapter_state);
         },
         ManagerCommand::IsScanning(tx) => {
            let _ = tx.send(self.scan.is_scanning());
         },
         ManagerCommand::PendingOperations(id, tx) => {
            let _ = tx.send(self.gatt.pending(&id));
         },
      }
   }

   fn handle_loopback(&mut self, cmd: Loopback) {
      match cmd {
         Loopback::ScanExpired(id) => {
            self.scan.expire(id);
         },
         Loopback::RequestExpired(request) => self.request_expired(request),
      }
   }

   // === Timers ===

   /// Sends `cmd` back to the actor after `after`.
   fn schedule(&self, after: Duration, cmd: Loopback) -> JoinHandle<()> {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         time::sleep(after).await;
         let _ = loopback.send(cmd).await;
      })
   }

   fn track(&mut self, request: RequestId, pending: Pending, bound: Duration) {
      self.requests.insert(request, pending);
      let timer = self.schedule(bound, Loopback::RequestExpired(request));
      self.requests.arm(request, timer);
   }

   fn request_expired(&mut self, request: RequestId) {
      let Some(pending) = self.requests.expire(request) else {
         return;
      };
      let label = pending.label();
      warn!("{label} {request} timed out");

      match pending {
         Pending::Connect { id, reply } => {
            if let Err(e) = self
               .connections
               .apply(&id, ConnectionInput::ConnectFailed, &mut self.registry)
            {
               debug!("{id}: connect timeout without transition: {e}");
            }
            let _ = reply.send(Err(BleError::Timeout(label)));
         },
         Pending::Disconnect { id, reply } => {
            let _ = reply.send(Err(BleError::Timeout(label)));
            // Unconfirmed disconnects still end up disconnected.
            if self.connections.state(&id) == ConnectionState::Disconnecting {
               self.link_down(&id, ConnectionInput::LinkLost, DisconnectCause::Requested);
            }
         },
         pending if pending.is_gatt() => {
            let id = pending.peripheral().cloned();
            pending.fail(BleError::Timeout(label));
            if let Some(id) = id {
               self.gatt.finish(&id, request);
               self.pump(&id);
            }
         },
         pending => pending.fail(BleError::Timeout(label)),
      }
   }

   fn prune(&mut self) {
      if let Some(max_age) = self.config.prune_after() {
         let removed = self.registry.prune(max_age, Instant::now());
         if removed > 0 {
            debug!("Pruned {removed} idle peripherals");
         }
      }
   }

   // === Adapter ===

   fn ensure_adapter(&self) -> Result<()> {
      if self.adapter_state.is_unavailable() {
         return Err(BleError::AdapterNotAvailable(self.adapter_state));
      }
      Ok(())
   }

   fn check_state(&mut self, reply: Reply<AdapterState>) {
      let request = self.requests.next_id();
      match self.radio.check_state(request) {
         Ok(()) => self.track(request, Pending::CheckState(reply), self.config.request_timeout()),
         Err(e) => {
            let _ = reply.send(Err(e));
         },
      }
   }

   fn adapter_state_updated(&mut self, request: Option<RequestId>, state: AdapterState) {
      let old = std::mem::replace(&mut self.adapter_state, state);
      let answered = request.and_then(|request| {
         self
            .requests
            .take_if(request, |p| matches!(p, Pending::CheckState(_)))
      });

      if old != state {
         info!("Adapter state: {old} -> {state}");
      }
      if old != state || answered.is_some() {
         self
            .events
            .emit(BleEvent::StateUpdated(StateUpdate::Adapter { old, new: state }));
      }
      if let Some(Pending::CheckState(reply)) = answered {
         let _ = reply.send(Ok(state));
      }

      if state.is_unavailable() {
         self.radio_unavailable();
      }
   }

   /// The radio can no longer hold links or scan: everything is torn down
   /// locally without commanding the radio.
   fn radio_unavailable(&mut self) {
      for id in self.connections.active() {
         self.link_down(&id, ConnectionInput::LinkLost, DisconnectCause::PoweredOff);
      }
      self.scan.stop(ScanStopReason::PoweredOff);
   }

   // === Scanning ===

   fn start_scan(
      &mut self,
      services: &[Uuid],
      duration_secs: f64,
      allow_duplicates: bool,
      until_stopped: Option<ScanWaiter>,
   ) -> Result<()> {
      scan::scan_duration(duration_secs)?;
      self.ensure_adapter()?;
      let request = self.requests.next_id();
      let (id, duration) = self
         .scan
         .start(request, services, duration_secs, allow_duplicates)?;
      let timer = self.schedule(duration, Loopback::ScanExpired(id));
      self.scan.arm(id, timer);
      if let Some(waiter) = until_stopped
         && self.scan.wait(waiter).is_err()
      {
         debug!("Scan ended before its waiter was registered");
      }
      Ok(())
   }

   fn retrieve_connected(&mut self, services: &[Uuid], reply: Reply<Vec<Peripheral>>) {
      let request = self.requests.next_id();
      match self.radio.retrieve_connected(request, services) {
         Ok(()) => self.track(request, Pending::Retrieve(reply), self.config.request_timeout()),
         Err(e) => {
            let _ = reply.send(Err(e));
         },
      }
   }

   // === Connections ===

   fn connect(&mut self, id: PeripheralId, reply: Reply<()>) {
      match self.begin_connect(&id) {
         Ok(request) => {
            let bound = self.config.connect_timeout();
            self.track(request, Pending::Connect { id, reply }, bound);
         },
         Err(e) => {
            let _ = reply.send(Err(e));
         },
      }
   }

   fn begin_connect(&mut self, id: &PeripheralId) -> Result<RequestId> {
      self.ensure_adapter()?;
      self.connections.check(id, ConnectionInput::Connect)?;
      let request = self.requests.next_id();
      self.radio.connect(request, id)?;
      debug!("→ connect {id} ({request})");

      self
         .connections
         .apply(id, ConnectionInput::Connect, &mut self.registry)?;
      Ok(request)
   }

   fn disconnect(&mut self, id: PeripheralId, reply: Reply<()>) {
      match self.begin_disconnect(&id) {
         Ok(request) => {
            let bound = self.config.disconnect_timeout();
            self.track(request, Pending::Disconnect { id, reply }, bound);
         },
         Err(e) => {
            let _ = reply.send(Err(e));
         },
      }
   }

   fn begin_disconnect(&mut self, id: &PeripheralId) -> Result<RequestId> {
      self.connections.check(id, ConnectionInput::Disconnect)?;
      let request = self.requests.next_id();
      self.radio.disconnect(request, id)?;
      debug!("→ disconnect {id} ({request})");

      // A connection attempt still in progress is abandoned.
      let superseded = self
         .requests
         .take_matching(|p| matches!(p, Pending::Connect { id: pending, .. } if pending == id));
      for (_, pending) in superseded {
         pending.fail(BleError::ConnectionFailed {
            id: id.clone(),
            reason: "cancelled by disconnect".into(),
         });
      }

      self
         .connections
         .apply(id, ConnectionInput::Disconnect, &mut self.registry)?;
      Ok(request)
   }

   fn connected(&mut self, request: RequestId, reported: &PeripheralId) {
      let Some(Pending::Connect { id, reply }) = self
         .requests
         .take_if(request, |p| matches!(p, Pending::Connect { .. }))
      else {
         debug!("Discarding late connect completion {request} for {reported}");
         return;
      };
      if &id != reported {
         warn!("Connect {request} for {id} completed as {reported}");
      }
      let result = self
         .connections
         .apply(&id, ConnectionInput::ConnectSucceeded, &mut self.registry)
         .map(drop);
      let _ = reply.send(result);
   }

   fn connect_failed(&mut self, request: RequestId, reported: &PeripheralId, reason: String) {
      let Some(Pending::Connect { id, reply }) = self
         .requests
         .take_if(request, |p| matches!(p, Pending::Connect { .. }))
      else {
         debug!("Discarding late connect failure {request} for {reported}: {reason}");
         return;
      };
      warn!("{id}: connection failed: {reason}");
      if let Err(e) = self
         .connections
         .apply(&id, ConnectionInput::ConnectFailed, &mut self.registry)
      {
         debug!("{id}: connect failure without transition: {e}");
      }
      let _ = reply.send(Err(BleError::ConnectionFailed { id, reason }));
   }

   fn disconnected(&mut self, id: &PeripheralId) {
      match self.connections.state(id) {
         ConnectionState::Disconnecting => {
            self.link_down(id, ConnectionInput::DisconnectConfirmed, DisconnectCause::Requested);
         },
         ConnectionState::Connecting | ConnectionState::Connected => {
            warn!("{id}: link lost");
            self.link_down(id, ConnectionInput::LinkLost, DisconnectCause::LinkLost);
         },
         ConnectionState::Disconnected => {
            debug!("{id}: ignoring disconnect of idle peripheral");
         },
      }
   }

   /// Moves `id` to `Disconnected`, settles everything waiting on the link
   /// and publishes `PeripheralDisconnected` once.
   fn link_down(&mut self, id: &PeripheralId, input: ConnectionInput, cause: DisconnectCause) {
      if let Err(e) = self.connections.apply(id, input, &mut self.registry) {
         debug!("{id}: {e}");
         return;
      }

      for (_, pending) in self.requests.take_for(id) {
         match pending {
            Pending::Disconnect { reply, .. } => {
               let _ = reply.send(Ok(()));
            },
            Pending::Connect { id, reply } => {
               let _ = reply.send(Err(BleError::ConnectionFailed {
                  id,
                  reason: format!("link closed before connecting ({cause})"),
               }));
            },
            pending => pending.fail(BleError::ConnectionLost(id.clone())),
         }
      }
      for request in self.gatt.close(id) {
         request.fail(BleError::ConnectionLost(id.clone()));
      }

      self.events.emit(BleEvent::PeripheralDisconnected {
         id: id.clone(),
         cause,
      });
   }

   // === GATT ===

   fn submit_gatt(&mut self, request: GattRequest) {
      let id = request.handle().peripheral.clone();
      if self.connections.state(&id) != ConnectionState::Connected {
         request.fail(BleError::NotConnected(id));
         return;
      }
      if let Err((request, e)) = self.gatt.submit(request) {
         request.fail(e);
         return;
      }
      self.pump(&id);
   }

   /// Issues queued operations on `id` until one is in flight.
   fn pump(&mut self, id: &PeripheralId) {
      while self.connections.state(id) == ConnectionState::Connected
         && let Some(request) = self.gatt.next_ready(id)
      {
         let token = self.requests.next_id();
         if let Err(e) = self.issue(token, &request) {
            warn!("{}: radio refused GATT operation: {e}", request.handle());
            request.fail(e);
            continue;
         }
         match request.into_pending() {
            Ok(pending) => {
               self.gatt.begin(id, token);
               let bound = self.config.request_timeout();
               self.track(token, pending, bound);
               break;
            },
            Err(reply) => {
               let _ = reply.send(Ok(()));
            },
         }
      }
   }

   fn issue(&self, token: RequestId, request: &GattRequest) -> Result<()> {
      match request {
         GattRequest::Read { handle, .. } => {
            debug!("→ read {handle} ({token})");
            self.radio.read(token, handle)
         },
         GattRequest::Write {
            handle,
            data,
            with_response,
            ..
         } => {
            debug!("→ write {handle} ({token}): {}", hex::encode(data));
            self.radio.write(token, handle, data, *with_response)
         },
         GattRequest::Notify {
            handle,
            enable: true,
            ..
         } => {
            debug!("→ start notification {handle} ({token})");
            self.radio.start_notification(token, handle)
         },
         GattRequest::Notify { handle, .. } => {
            debug!("→ stop notification {handle} ({token})");
            self.radio.stop_notification(token, handle)
         },
      }
   }

   /// Settles the in-flight GATT operation `request`, then issues the next.
   fn gatt_completed<F>(&mut self, request: RequestId, accept: fn(&Pending) -> bool, settle: F)
   where
      F: FnOnce(&mut Self, Pending),
   {
      let Some(pending) = self.requests.take_if(request, accept) else {
         debug!("Discarding late GATT completion {request}");
         return;
      };
      let Some(id) = pending.peripheral().cloned() else {
         return;
      };
      self.gatt.finish(&id, request);
      settle(self, pending);
      self.pump(&id);
   }

   fn read_completed(&mut self, request: RequestId, result: RadioResult<Vec<u8>>) {
      self.gatt_completed(
         request,
         |p| matches!(p, Pending::Read { .. }),
         |_, pending| {
            if let Pending::Read { handle, reply } = pending {
               match &result {
                  Ok(value) => debug!("← read {handle}: {}", hex::encode(value)),
                  Err(e) => warn!("{handle}: read failed: {e}"),
               }
               let _ = reply.send(result.map_err(BleError::Read));
            }
         },
      );
   }

   fn write_completed(&mut self, request: RequestId, result: RadioResult<()>) {
      self.gatt_completed(
         request,
         |p| matches!(p, Pending::Write { .. }),
         |_, pending| {
            if let Pending::Write { handle, reply } = pending {
               if let Err(e) = &result {
                  warn!("{handle}: write failed: {e}");
               }
               let _ = reply.send(result.map_err(BleError::Write));
            }
         },
      );
   }

   fn notification_state_changed(&mut self, request: RequestId, result: RadioResult<()>) {
      self.gatt_completed(
         request,
         |p| matches!(p, Pending::Notify { .. }),
         |actor, pending| {
            if let Pending::Notify {
               handle,
               enable,
               reply,
            } = pending
            {
               match &result {
                  Ok(()) => {
                     info!("{handle}: notifications {}", if enable { "on" } else { "off" });
                     actor.gatt.set_notifying(&handle, enable);
                  },
                  Err(e) => warn!("{handle}: notification change failed: {e}"),
               }
               let _ = reply.send(result.map_err(BleError::Notification));
            }
         },
      );
   }

   fn value_changed(&mut self, handle: CharacteristicHandle, value: Vec<u8>) {
      if !self.gatt.is_notifying(&handle) {
         debug!("Dropping value of unsubscribed {handle}");
         return;
      }
      debug!("← notify {handle}: {}", hex::encode(&value));
      self
         .events
         .emit(BleEvent::CharacteristicValueUpdated { handle, value });
   }

   fn connected_peripherals_retrieved(
      &mut self,
      request: RequestId,
      result: RadioResult<Vec<Advertisement>>,
   ) {
      let Some(Pending::Retrieve(reply)) = self
         .requests
         .take_if(request, |p| matches!(p, Pending::Retrieve(_)))
      else {
         debug!("Discarding late retrieval {request}");
         return;
      };
      let result = result
         .map(|found| {
            found
               .iter()
               .map(|adv| self.registry.upsert(adv))
               .collect::<Vec<_>>()
         })
         .map_err(BleError::Radio);
      let _ = reply.send(result);
   }

   // === Radio Events ===

   fn handle_radio_event(&mut self, event: RadioEvent) {
      match event {
         RadioEvent::StateUpdated { request, state } => self.adapter_state_updated(request, state),
         RadioEvent::PeripheralDiscovered(adv) => {
            let peripheral = self.registry.upsert(&adv);
            self.scan.discovered(&peripheral);
         },
         RadioEvent::ScanStopped { request } => {
            self.scan.radio_stopped(request);
         },
         RadioEvent::Connected { request, id } => self.connected(request, &id),
         RadioEvent::ConnectFailed {
            request,
            id,
            reason,
         } => self.connect_failed(request, &id, reason),
         RadioEvent::Disconnected { id } => self.disconnected(&id),
         RadioEvent::ReadCompleted { request, result } => self.read_completed(request, result),
         RadioEvent::WriteCompleted { request, result } => self.write_completed(request, result),
         RadioEvent::NotificationStateChanged { request, result } => {
            self.notification_state_changed(request, result);
         },
         RadioEvent::ValueChanged { handle, value } => self.value_changed(handle, value),
         RadioEvent::ConnectedPeripheralsRetrieved { request, result } => {
            self.connected_peripherals_retrieved(request, result);
         },
      }
   }

   fn cleanup(&mut self) {
      info!("Cleaning up BLE session");
      self.scan.stop(ScanStopReason::Requested);

      for id in self.connections.active() {
         let request = self.requests.next_id();
         if let Err(e) = self.radio.disconnect(request, &id) {
            warn!("Failed to disconnect {id}: {e}");
         }
      }
      for request in self.gatt.close_all() {
         request.fail(BleError::ManagerShutdown);
      }
      for pending in self.requests.drain() {
         pending.fail(BleError::ManagerShutdown);
      }
      self.dispatcher.clear();
   }
}

/// Ticks `interval`, or never resolves when there is none.
async fn tick(interval: &mut Option<Interval>) {
   match interval {
      Some(interval) => {
         interval.tick().await;
      },
      None => std::future::pending().await,
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;
   use tokio::time;

   use super::*;
   use crate::{
      event::testing::Recorder,
      model::uuid_from_u16,
      radio::{
         self, RadioEventSender,
         fake::{FakeRadio, RadioCommand},
      },
   };

   const AA: &str = "AA:BB:CC:DD:EE:01";
   const BB: &str = "AA:BB:CC:DD:EE:02";

   struct Harness {
      manager: BleManager,
      radio: Arc<FakeRadio>,
      radio_tx: RadioEventSender,
      commands: mpsc::UnboundedReceiver<RadioCommand>,
      recorder: Arc<Recorder>,
   }

   impl Harness {
      fn new() -> Self {
         Self::with_config(Config::default())
      }

      fn with_config(config: Config) -> Self {
         let (radio, commands) = FakeRadio::new();
         let (radio_tx, radio_rx) = radio::channel(64);
         let manager = BleManager::new(radio.clone(), radio_rx, config);
         let recorder = Recorder::attach(manager.events());
         Self {
            manager,
            radio,
            radio_tx,
            commands,
            recorder,
         }
      }

      async fn emit(&self, event: RadioEvent) {
         self.radio_tx.send(event).await.unwrap();
      }

      /// Round-trips a query, so every radio event sent before is handled.
      async fn sync(&self) {
         let _ = self.manager.is_scanning().await;
      }

      async fn next_command(&mut self) -> RadioCommand {
         recv_command(&mut self.commands).await
      }

      async fn connect(&mut self, id: &str) {
         let manager = self.manager.clone();
         let peer = PeripheralId::from(id);
         let task = tokio::spawn(async move { manager.connect(peer).await });
         let RadioCommand::Connect(request, peer) = self.next_command().await else {
            panic!("expected connect");
         };
         self
            .emit(RadioEvent::Connected { request, id: peer })
            .await;
         task.await.unwrap().unwrap();
      }

      async fn wait_for_pending(&self, id: &str, count: usize) {
         for _ in 0..1000 {
            if self.manager.pending_operations(id).await == count {
               return;
            }
            tokio::task::yield_now().await;
         }
         panic!("{id} never reached {count} pending operations");
      }

      fn disconnects(&self) -> Vec<BleEvent> {
         self.recorder.of_kind(EventKind::PeripheralDisconnected)
      }
   }

   async fn recv_command(commands: &mut mpsc::UnboundedReceiver<RadioCommand>) -> RadioCommand {
      time::timeout(Duration::from_secs(1), commands.recv())
         .await
         .expect("no radio command")
         .expect("radio dropped")
   }

   fn heart_rate(id: &str) -> CharacteristicHandle {
      CharacteristicHandle::parse(id, "180D", "2A37").unwrap()
   }

   #[tokio::test]
   async fn test_gatt_requires_connection() {
      let mut h = Harness::new();
      let handle = heart_rate(AA);

      assert!(matches!(
         h.manager.read(&handle).await,
         Err(BleError::NotConnected(_))
      ));
      assert!(matches!(
         h.manager.write(&handle, &[1], true).await,
         Err(BleError::NotConnected(_))
      ));
      assert!(matches!(
         h.manager.start_notification(&handle).await,
         Err(BleError::NotConnected(_))
      ));

      // Still connecting counts as not connected.
      let manager = h.manager.clone();
      let _connecting = tokio::spawn(async move { manager.connect(AA).await });
      assert!(matches!(h.next_command().await, RadioCommand::Connect(..)));
      assert!(matches!(
         h.manager.read(&handle).await,
         Err(BleError::NotConnected(_))
      ));
      assert!(h.commands.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_connect_twice_is_invalid() {
      let mut h = Harness::new();
      h.connect(AA).await;

      let err = h.manager.connect(AA).await.unwrap_err();
      assert!(matches!(
         err,
         BleError::InvalidState {
            state: ConnectionState::Connected,
            op: "connect",
            ..
         }
      ));
      assert!(h.commands.try_recv().is_err());
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Connected);
   }

   #[tokio::test]
   async fn test_connect_publishes_transitions() {
      let mut h = Harness::new();
      h.connect(AA).await;

      let transitions: Vec<_> = h
         .recorder
         .of_kind(EventKind::StateUpdated)
         .into_iter()
         .filter_map(|e| match e {
            BleEvent::StateUpdated(StateUpdate::Peripheral { old, new, .. }) => Some((old, new)),
            _ => None,
         })
         .collect();
      assert_eq!(
         transitions,
         [
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
         ]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_filters_deduplicates_and_expires() {
      let mut h = Harness::new();
      let hr = uuid_from_u16(0x180D);

      h.manager.start_scan(&[hr], 5.0, false).await.unwrap();
      let RadioCommand::Scan {
         services,
         allow_duplicates: false,
         ..
      } = h.next_command().await
      else {
         panic!("expected scan without duplicates");
      };
      assert_eq!(services, [hr]);
      assert!(matches!(
         h.manager.start_scan(&[], 1.0, false).await,
         Err(BleError::AlreadyScanning)
      ));

      h.emit(RadioEvent::PeripheralDiscovered(Advertisement::new("A").service(hr)))
         .await;
      h.emit(RadioEvent::PeripheralDiscovered(
         Advertisement::new("B").service(uuid_from_u16(0x180F)),
      ))
      .await;
      h.emit(RadioEvent::PeripheralDiscovered(Advertisement::new("A").service(hr).rssi(-40)))
         .await;
      h.sync().await;
      assert_eq!(h.recorder.count(EventKind::PeripheralDiscovered), 1);

      time::sleep(Duration::from_millis(4900)).await;
      assert!(h.manager.is_scanning().await);
      assert_eq!(h.recorder.count(EventKind::ScanStopped), 0);

      time::sleep(Duration::from_millis(200)).await;
      assert!(!h.manager.is_scanning().await);
      assert_eq!(
         h.recorder.of_kind(EventKind::ScanStopped),
         vec![BleEvent::ScanStopped(ScanStopReason::Timeout)]
      );
      assert_eq!(h.next_command().await, RadioCommand::StopScan);

      // Late advertisements still feed the registry but are not published.
      h.emit(RadioEvent::PeripheralDiscovered(Advertisement::new("C").service(hr)))
         .await;
      h.sync().await;
      assert_eq!(h.recorder.count(EventKind::PeripheralDiscovered), 1);
      assert!(h.manager.peripheral("C").await.is_some());
      assert_eq!(h.manager.peripheral("A").await.unwrap().rssi, Some(-40));
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_returns_discovered_peripherals() {
      let mut h = Harness::new();
      let manager = h.manager.clone();
      let task = tokio::spawn(async move { manager.scan(&[], 2.0, false).await });

      assert!(matches!(h.next_command().await, RadioCommand::Scan { .. }));
      h.emit(RadioEvent::PeripheralDiscovered(Advertisement::new("A").name("Polar H10")))
         .await;
      h.emit(RadioEvent::PeripheralDiscovered(Advertisement::new("B")))
         .await;

      let found = task.await.unwrap().unwrap();
      let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
      assert_eq!(ids, ["A", "B"]);
      assert_eq!(found[0].name.as_deref(), Some("Polar H10"));
   }

   #[tokio::test]
   async fn test_scan_argument_and_stop() {
      let mut h = Harness::new();
      assert!(matches!(
         h.manager.start_scan(&[], 0.0, false).await,
         Err(BleError::InvalidArgument(_))
      ));
      h.manager.stop_scan().await.unwrap();
      assert!(h.commands.try_recv().is_err());
      assert_eq!(h.recorder.count(EventKind::ScanStopped), 0);

      h.manager.start_scan(&[], 30.0, true).await.unwrap();
      let RadioCommand::Scan { request: first, .. } = h.next_command().await else {
         panic!("expected scan");
      };
      h.manager.stop_scan().await.unwrap();
      h.manager.stop_scan().await.unwrap();
      assert_eq!(h.next_command().await, RadioCommand::StopScan);
      assert_eq!(h.recorder.count(EventKind::ScanStopped), 1);

      // A stop report for the earlier session leaves the new one running.
      h.manager.start_scan(&[], 30.0, true).await.unwrap();
      let RadioCommand::Scan { request, .. } = h.next_command().await else {
         panic!("expected scan");
      };
      h.emit(RadioEvent::ScanStopped { request: first }).await;
      h.sync().await;
      assert!(h.manager.is_scanning().await);
      assert_eq!(h.recorder.count(EventKind::ScanStopped), 1);

      // The radio ending the current scan on its own is reported.
      h.emit(RadioEvent::ScanStopped { request }).await;
      h.sync().await;
      assert!(!h.manager.is_scanning().await);
      assert_eq!(
         h.recorder.of_kind(EventKind::ScanStopped).last(),
         Some(&BleEvent::ScanStopped(ScanStopReason::Radio))
      );
   }

   #[tokio::test]
   async fn test_read_then_disconnect() {
      let mut h = Harness::new();
      h.connect(AA).await;
      let handle = heart_rate(AA);

      let manager = h.manager.clone();
      let target = handle.clone();
      let read = tokio::spawn(async move { manager.read(&target).await });
      let RadioCommand::Read(request, issued) = h.next_command().await else {
         panic!("expected read");
      };
      assert_eq!(issued, handle);
      h.emit(RadioEvent::ReadCompleted {
         request,
         result: Ok(vec![0x16, 0x48]),
      })
      .await;
      assert_eq!(read.await.unwrap().unwrap(), [0x16, 0x48]);

      let manager = h.manager.clone();
      let disconnect = tokio::spawn(async move { manager.disconnect(AA).await });
      let RadioCommand::Disconnect(_, id) = h.next_command().await else {
         panic!("expected disconnect");
      };
      assert_eq!(
         h.manager.connection_state(AA).await,
         ConnectionState::Disconnecting
      );
      h.emit(RadioEvent::Disconnected { id }).await;
      disconnect.await.unwrap().unwrap();

      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
      assert_eq!(
         h.disconnects(),
         vec![BleEvent::PeripheralDisconnected {
            id: AA.into(),
            cause: DisconnectCause::Requested,
         }]
      );
   }

   #[tokio::test]
   async fn test_gatt_failures_are_typed() {
      let mut h = Harness::new();
      h.connect(AA).await;
      let handle = heart_rate(AA);

      let manager = h.manager.clone();
      let target = handle.clone();
      let read = tokio::spawn(async move { manager.read(&target).await });
      let RadioCommand::Read(request, _) = h.next_command().await else {
         panic!("expected read");
      };
      h.emit(RadioEvent::ReadCompleted {
         request,
         result: Err("insufficient authentication".into()),
      })
      .await;
      assert!(matches!(read.await.unwrap(), Err(BleError::Read(_))));

      let manager = h.manager.clone();
      let target = handle.clone();
      let write = tokio::spawn(async move { manager.write(&target, &[1], true).await });
      let RadioCommand::Write { request, .. } = h.next_command().await else {
         panic!("expected write");
      };
      h.emit(RadioEvent::WriteCompleted {
         request,
         result: Err("not permitted".into()),
      })
      .await;
      assert!(matches!(write.await.unwrap(), Err(BleError::Write(_))));
   }

   #[tokio::test(start_paused = true)]
   async fn test_write_timeout_discards_late_ack() {
      let mut h = Harness::new();
      h.connect(AA).await;
      let handle = heart_rate(AA);
      let started = time::Instant::now();

      let manager = h.manager.clone();
      let target = handle.clone();
      let write = tokio::spawn(async move { manager.write(&target, &[0x01, 0x02], true).await });
      let RadioCommand::Write {
         request,
         data,
         with_response: true,
         ..
      } = h.next_command().await
      else {
         panic!("expected write with response");
      };
      assert_eq!(data, [0x01, 0x02]);

      assert!(matches!(write.await.unwrap(), Err(BleError::Timeout("write"))));
      assert!(started.elapsed() >= Config::default().request_timeout());
      assert_eq!(h.manager.pending_operations(AA).await, 0);

      h.emit(RadioEvent::WriteCompleted {
         request,
         result: Ok(()),
      })
      .await;

      // The session is still usable.
      let manager = h.manager.clone();
      let target = handle.clone();
      let read = tokio::spawn(async move { manager.read(&target).await });
      let RadioCommand::Read(request, _) = h.next_command().await else {
         panic!("expected read");
      };
      h.emit(RadioEvent::ReadCompleted {
         request,
         result: Ok(vec![7]),
      })
      .await;
      assert_eq!(read.await.unwrap().unwrap(), [7]);
   }

   #[tokio::test]
   async fn test_write_without_response() {
      let mut h = Harness::new();
      h.connect(AA).await;
      let handle = heart_rate(AA);

      h.manager.write(&handle, &[9], false).await.unwrap();
      assert!(matches!(
         h.next_command().await,
         RadioCommand::Write {
            with_response: false,
            ..
         }
      ));
      assert_eq!(h.manager.pending_operations(AA).await, 0);
   }

   #[tokio::test]
   async fn test_unsolicited_disconnect() {
      let mut h = Harness::new();
      h.connect(AA).await;

      let manager = h.manager.clone();
      let handle = heart_rate(AA);
      let read = tokio::spawn(async move { manager.read(&handle).await });
      assert!(matches!(h.next_command().await, RadioCommand::Read(..)));

      h.emit(RadioEvent::Disconnected { id: AA.into() }).await;
      h.emit(RadioEvent::Disconnected { id: AA.into() }).await;
      h.sync().await;

      assert!(matches!(read.await.unwrap(), Err(BleError::ConnectionLost(_))));
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
      assert_eq!(
         h.disconnects(),
         vec![BleEvent::PeripheralDisconnected {
            id: AA.into(),
            cause: DisconnectCause::LinkLost,
         }]
      );
      assert!(matches!(
         h.manager.read(&heart_rate(AA)).await,
         Err(BleError::NotConnected(_))
      ));
   }

   #[tokio::test]
   async fn test_power_off_cascade() {
      let mut h = Harness::new();
      h.emit(RadioEvent::StateUpdated {
         request: None,
         state: AdapterState::PoweredOn,
      })
      .await;
      h.connect(AA).await;
      h.connect(BB).await;
      h.manager.start_scan(&[], 30.0, false).await.unwrap();
      let _ = h.next_command().await;

      h.emit(RadioEvent::StateUpdated {
         request: None,
         state: AdapterState::PoweredOff,
      })
      .await;
      h.sync().await;

      assert_eq!(h.manager.adapter_state().await, AdapterState::PoweredOff);
      assert!(!h.manager.is_scanning().await);
      for id in [AA, BB] {
         assert_eq!(h.manager.connection_state(id).await, ConnectionState::Disconnected);
      }
      assert_eq!(h.disconnects().len(), 2);
      assert!(h.disconnects().iter().all(|e| matches!(
         e,
         BleEvent::PeripheralDisconnected {
            cause: DisconnectCause::PoweredOff,
            ..
         }
      )));
      assert_eq!(
         h.recorder.of_kind(EventKind::ScanStopped),
         vec![BleEvent::ScanStopped(ScanStopReason::PoweredOff)]
      );
      // Nothing is sent to a radio that is off.
      assert!(h.commands.try_recv().is_err());

      assert!(matches!(
         h.manager.start_scan(&[], 1.0, false).await,
         Err(BleError::AdapterNotAvailable(AdapterState::PoweredOff))
      ));
      assert!(matches!(
         h.manager.connect(AA).await,
         Err(BleError::AdapterNotAvailable(_))
      ));
   }

   #[tokio::test]
   async fn test_gatt_operations_are_serialized() {
      let mut h = Harness::new();
      h.connect(AA).await;
      h.connect(BB).await;
      let handle = heart_rate(AA);

      let manager = h.manager.clone();
      let target = handle.clone();
      let first = tokio::spawn(async move { manager.read(&target).await });
      let RadioCommand::Read(first_request, _) = h.next_command().await else {
         panic!("expected read");
      };

      let manager = h.manager.clone();
      let target = handle.clone();
      let second = tokio::spawn(async move { manager.read(&target).await });
      h.wait_for_pending(AA, 2).await;
      assert!(h.commands.try_recv().is_err());

      // Another peripheral is not held up.
      let manager = h.manager.clone();
      let other = tokio::spawn(async move { manager.read(&heart_rate(BB)).await });
      let RadioCommand::Read(other_request, issued) = h.next_command().await else {
         panic!("expected read");
      };
      assert_eq!(issued.peripheral.as_str(), BB);
      h.emit(RadioEvent::ReadCompleted {
         request: other_request,
         result: Ok(vec![3]),
      })
      .await;
      assert_eq!(other.await.unwrap().unwrap(), [3]);

      h.emit(RadioEvent::ReadCompleted {
         request: first_request,
         result: Ok(vec![1]),
      })
      .await;
      let RadioCommand::Read(second_request, _) = h.next_command().await else {
         panic!("expected queued read");
      };
      assert_ne!(first_request, second_request);
      h.emit(RadioEvent::ReadCompleted {
         request: second_request,
         result: Ok(vec![2]),
      })
      .await;

      assert_eq!(first.await.unwrap().unwrap(), [1]);
      assert_eq!(second.await.unwrap().unwrap(), [2]);
      assert_eq!(h.manager.pending_operations(AA).await, 0);
   }

   #[tokio::test]
   async fn test_gatt_queue_limit() {
      let mut h = Harness::with_config(Config {
         gatt_queue_limit: 1,
         ..Config::default()
      });
      h.connect(AA).await;
      let handle = heart_rate(AA);

      let manager = h.manager.clone();
      let target = handle.clone();
      let _first = tokio::spawn(async move { manager.read(&target).await });
      assert!(matches!(h.next_command().await, RadioCommand::Read(..)));

      let manager = h.manager.clone();
      let target = handle.clone();
      let _second = tokio::spawn(async move { manager.read(&target).await });
      h.wait_for_pending(AA, 2).await;

      assert!(matches!(
         h.manager.read(&handle).await,
         Err(BleError::OperationInProgress(_))
      ));
   }

   #[tokio::test]
   async fn test_notifications_only_while_subscribed() {
      let mut h = Harness::new();
      h.connect(AA).await;
      let handle = heart_rate(AA);
      let other = CharacteristicHandle::parse(AA, "180F", "2A19").unwrap();

      let values = Arc::new(Mutex::new(Vec::new()));
      let sink = values.clone();
      h.manager.on_characteristic_value_updated(move |_, value| {
         sink.lock().push(value.to_vec());
         Ok(())
      });

      h.emit(RadioEvent::ValueChanged {
         handle: handle.clone(),
         value: vec![0],
      })
      .await;

      let manager = h.manager.clone();
      let target = handle.clone();
      let start = tokio::spawn(async move { manager.start_notification(&target).await });
      let RadioCommand::StartNotification(request, _) = h.next_command().await else {
         panic!("expected start notification");
      };
      h.emit(RadioEvent::NotificationStateChanged {
         request,
         result: Ok(()),
      })
      .await;
      start.await.unwrap().unwrap();

      for (handle, value) in [(&handle, 1), (&other, 9), (&handle, 2)] {
         h.emit(RadioEvent::ValueChanged {
            handle: handle.clone(),
            value: vec![value],
         })
         .await;
      }
      h.sync().await;
      assert_eq!(*values.lock(), [vec![1u8], vec![2u8]]);

      let manager = h.manager.clone();
      let target = handle.clone();
      let stop = tokio::spawn(async move { manager.stop_notification(&target).await });
      let RadioCommand::StopNotification(request, _) = h.next_command().await else {
         panic!("expected stop notification");
      };
      h.emit(RadioEvent::NotificationStateChanged {
         request,
         result: Ok(()),
      })
      .await;
      stop.await.unwrap().unwrap();

      h.emit(RadioEvent::ValueChanged {
         handle: handle.clone(),
         value: vec![3],
      })
      .await;
      h.sync().await;
      assert_eq!(values.lock().len(), 2);
   }

   #[tokio::test]
   async fn test_notification_failure() {
      let mut h = Harness::new();
      h.connect(AA).await;
      let handle = heart_rate(AA);

      let manager = h.manager.clone();
      let target = handle.clone();
      let start = tokio::spawn(async move { manager.start_notification(&target).await });
      let RadioCommand::StartNotification(request, _) = h.next_command().await else {
         panic!("expected start notification");
      };
      h.emit(RadioEvent::NotificationStateChanged {
         request,
         result: Err("not supported".into()),
      })
      .await;
      assert!(matches!(start.await.unwrap(), Err(BleError::Notification(_))));

      h.emit(RadioEvent::ValueChanged {
         handle,
         value: vec![1],
      })
      .await;
      h.sync().await;
      assert_eq!(h.recorder.count(EventKind::CharacteristicValueUpdated), 0);
   }

   #[tokio::test]
   async fn test_check_state_publishes() {
      let mut h = Harness::new();
      for expected in 1..=2 {
         let manager = h.manager.clone();
         let check = tokio::spawn(async move { manager.check_state().await });
         let RadioCommand::CheckState(request) = h.next_command().await else {
            panic!("expected check state");
         };
         h.emit(RadioEvent::StateUpdated {
            request: Some(request),
            state: AdapterState::PoweredOn,
         })
         .await;
         assert_eq!(check.await.unwrap().unwrap(), AdapterState::PoweredOn);
         assert_eq!(h.recorder.count(EventKind::StateUpdated), expected);
      }
      assert_eq!(
         h.recorder.of_kind(EventKind::StateUpdated)[0],
         BleEvent::StateUpdated(StateUpdate::Adapter {
            old: AdapterState::Unknown,
            new: AdapterState::PoweredOn,
         })
      );

      // Unsolicited reports only publish changes.
      h.emit(RadioEvent::StateUpdated {
         request: None,
         state: AdapterState::PoweredOn,
      })
      .await;
      h.sync().await;
      assert_eq!(h.recorder.count(EventKind::StateUpdated), 2);
   }

   #[tokio::test]
   async fn test_retrieve_connected_leaves_state_alone() {
      let mut h = Harness::new();
      let hr = uuid_from_u16(0x180D);

      let manager = h.manager.clone();
      let retrieve =
         tokio::spawn(async move { manager.retrieve_connected_peripherals(&[hr]).await });
      let RadioCommand::RetrieveConnected(request, services) = h.next_command().await else {
         panic!("expected retrieval");
      };
      assert_eq!(services, [hr]);
      h.emit(RadioEvent::ConnectedPeripheralsRetrieved {
         request,
         result: Ok(vec![Advertisement::new(AA).name("Strap").service(hr)]),
      })
      .await;

      let found = retrieve.await.unwrap().unwrap();
      assert_eq!(found.len(), 1);
      assert_eq!(found[0].state, ConnectionState::Disconnected);
      assert_eq!(h.manager.peripherals().await.len(), 1);
      assert_eq!(h.recorder.count(EventKind::PeripheralDiscovered), 0);
   }

   #[tokio::test]
   async fn test_radio_rejection_changes_nothing() {
      let h = Harness::new();
      h.radio.set_rejecting(true);

      assert!(matches!(h.manager.connect(AA).await, Err(BleError::Radio(_))));
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
      assert!(matches!(
         h.manager.start_scan(&[], 1.0, false).await,
         Err(BleError::Radio(_))
      ));
      assert!(!h.manager.is_scanning().await);
      assert!(matches!(h.manager.check_state().await, Err(BleError::Radio(_))));
      assert!(h.recorder.events().is_empty());
   }

   #[tokio::test]
   async fn test_connect_failure() {
      let mut h = Harness::new();

      let manager = h.manager.clone();
      let connect = tokio::spawn(async move { manager.connect(AA).await });
      let RadioCommand::Connect(request, id) = h.next_command().await else {
         panic!("expected connect");
      };
      h.emit(RadioEvent::ConnectFailed {
         request,
         id,
         reason: "refused".into(),
      })
      .await;

      let err = connect.await.unwrap().unwrap_err();
      assert!(matches!(err, BleError::ConnectionFailed { ref reason, .. } if reason == "refused"));
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
      assert!(h.disconnects().is_empty());

      // Retrying is allowed.
      h.connect(AA).await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_timeout() {
      let mut h = Harness::new();

      let manager = h.manager.clone();
      let connect = tokio::spawn(async move { manager.connect(AA).await });
      let RadioCommand::Connect(request, id) = h.next_command().await else {
         panic!("expected connect");
      };
      assert!(matches!(connect.await.unwrap(), Err(BleError::Timeout("connect"))));
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);

      h.emit(RadioEvent::Connected { request, id }).await;
      h.sync().await;
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
   }

   #[tokio::test]
   async fn test_disconnect_while_connecting() {
      let mut h = Harness::new();

      let manager = h.manager.clone();
      let connect = tokio::spawn(async move { manager.connect(AA).await });
      let RadioCommand::Connect(connect_request, id) = h.next_command().await else {
         panic!("expected connect");
      };

      let manager = h.manager.clone();
      let disconnect = tokio::spawn(async move { manager.disconnect(AA).await });
      assert!(matches!(h.next_command().await, RadioCommand::Disconnect(..)));
      assert!(matches!(
         connect.await.unwrap(),
         Err(BleError::ConnectionFailed { .. })
      ));

      // A connect completion racing the disconnect is stale.
      h.emit(RadioEvent::Connected {
         request: connect_request,
         id: id.clone(),
      })
      .await;
      h.sync().await;
      assert_eq!(
         h.manager.connection_state(AA).await,
         ConnectionState::Disconnecting
      );

      h.emit(RadioEvent::Disconnected { id }).await;
      disconnect.await.unwrap().unwrap();
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
      assert_eq!(h.disconnects().len(), 1);
   }

   #[tokio::test]
   async fn test_disconnect_when_idle_is_invalid() {
      let h = Harness::new();
      assert!(matches!(
         h.manager.disconnect(AA).await,
         Err(BleError::InvalidState {
            state: ConnectionState::Disconnected,
            ..
         })
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_timeout_forces_disconnected() {
      let mut h = Harness::new();
      h.connect(AA).await;

      let manager = h.manager.clone();
      let disconnect = tokio::spawn(async move { manager.disconnect(AA).await });
      assert!(matches!(h.next_command().await, RadioCommand::Disconnect(..)));
      assert!(matches!(
         disconnect.await.unwrap(),
         Err(BleError::Timeout("disconnect"))
      ));
      assert_eq!(h.manager.connection_state(AA).await, ConnectionState::Disconnected);
      assert_eq!(h.disconnects().len(), 1);

      // The late confirmation changes nothing.
      h.emit(RadioEvent::Disconnected { id: AA.into() }).await;
      h.sync().await;
      assert_eq!(h.disconnects().len(), 1);
   }

   #[tokio::test]
   async fn test_typed_listeners() {
      let h = Harness::new();
      let reasons = Arc::new(Mutex::new(Vec::new()));
      let sink = reasons.clone();
      let subscription = h.manager.on_scan_stopped(move |reason| {
         sink.lock().push(reason);
         Ok(())
      });

      h.manager.start_scan(&[], 10.0, false).await.unwrap();
      h.manager.stop_scan().await.unwrap();
      assert!(h.manager.unsubscribe(subscription));
      h.manager.start_scan(&[], 10.0, false).await.unwrap();
      h.manager.stop_scan().await.unwrap();

      assert_eq!(*reasons.lock(), [ScanStopReason::Requested]);
   }

   #[tokio::test]
   async fn test_teardown_stops_scan_and_disconnects() {
      let mut h = Harness::new();
      h.connect(AA).await;
      h.connect(BB).await;
      h.manager.start_scan(&[], 30.0, false).await.unwrap();
      assert!(matches!(h.next_command().await, RadioCommand::Scan { .. }));

      drop(h.manager);
      assert_eq!(recv_command(&mut h.commands).await, RadioCommand::StopScan);
      let mut disconnected = Vec::new();
      for _ in 0..2 {
         let RadioCommand::Disconnect(_, id) = recv_command(&mut h.commands).await else {
            panic!("expected disconnect");
         };
         disconnected.push(id);
      }
      assert_eq!(disconnected, [PeripheralId::from(AA), PeripheralId::from(BB)]);
      assert!(h.commands.try_recv().is_err());
      assert_eq!(
         h.recorder.of_kind(EventKind::ScanStopped),
         vec![BleEvent::ScanStopped(ScanStopReason::Requested)]
      );
   }

   #[tokio::test]
   async fn test_weak_handle_in_listener_allows_teardown() {
      let mut h = Harness::new();
      let weak = h.manager.downgrade();
      let upgrades = Arc::new(Mutex::new(Vec::new()));
      let sink = upgrades.clone();
      h.manager.on_scan_stopped(move |_| {
         sink.lock().push(weak.upgrade().is_some());
         Ok(())
      });

      h.manager.start_scan(&[], 30.0, false).await.unwrap();
      h.manager.stop_scan().await.unwrap();
      h.manager.start_scan(&[], 30.0, false).await.unwrap();
      for _ in 0..3 {
         let _ = h.next_command().await;
      }

      drop(h.manager);
      assert_eq!(recv_command(&mut h.commands).await, RadioCommand::StopScan);
      assert_eq!(*upgrades.lock(), [true, false]);
   }
}
