//! BlueZ radio backend.
//!
//! Every command is executed on its own task against the default adapter
//! and reports back on the radio event channel. Link and notification
//! streams are kept in tasks owned by the radio and aborted when the
//! session asks for them to stop.

use std::{collections::HashMap, future::Future};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
   gatt::{
      WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest},
   },
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Radio, RadioEvent, RadioEventSender, RadioResult, RequestId};
use crate::{
   error::{BleError, Result},
   model::{AdapterState, Advertisement, CharacteristicHandle, PeripheralId},
};

/// Radio driving the default local BlueZ adapter.
pub struct BluezRadio {
   adapter: Adapter,
   events: RadioEventSender,
   monitor: JoinHandle<()>,
   scan: Mutex<Option<JoinHandle<()>>>,
   links: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
   notifications: Mutex<HashMap<CharacteristicHandle, JoinHandle<()>>>,
   _session: Session,
}

impl BluezRadio {
   /// Opens a session with bluetoothd and starts watching the default
   /// adapter's power state.
   pub async fn new(events: RadioEventSender) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      info!("Using adapter {}", adapter.name());

      Ok(Self {
         monitor: Self::start_adapter_monitor(adapter.clone(), events.clone()),
         adapter,
         events,
         scan: Mutex::new(None),
         links: Mutex::new(HashMap::new()),
         notifications: Mutex::new(HashMap::new()),
         _session: session,
      })
   }

   fn start_adapter_monitor(adapter: Adapter, events: RadioEventSender) -> JoinHandle<()> {
      tokio::spawn(async move {
         let state = adapter_state(&adapter).await;
         let _ = events
            .send(RadioEvent::StateUpdated {
               request: None,
               state,
            })
            .await;

         let stream = match adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
               warn!("Failed to get adapter events for {}: {e}", adapter.name());
               return;
            },
         };
         pin_mut!(stream);

         while let Some(event) = stream.next().await {
            let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event else {
               continue;
            };
            let state = if powered {
               AdapterState::PoweredOn
            } else {
               AdapterState::PoweredOff
            };
            debug!("Adapter {} powered: {powered}", adapter.name());
            if events
               .send(RadioEvent::StateUpdated {
                  request: None,
                  state,
               })
               .await
               .is_err()
            {
               return;
            }
         }

         // Adapter is probably gone
         warn!("Adapter {} went away", adapter.name());
         let _ = events
            .send(RadioEvent::StateUpdated {
               request: None,
               state: AdapterState::PoweredOff,
            })
            .await;
      })
   }

   fn device(&self, id: &PeripheralId) -> Result<Device> {
      let addr: Address = id
         .as_str()
         .parse()
         .map_err(|_| BleError::InvalidArgument(format!("not a Bluetooth address: {id}")))?;
      Ok(self.adapter.device(addr)?)
   }

   /// Runs `completion` on its own task and reports its outcome.
   fn complete<F>(&self, completion: F)
   where
      F: Future<Output = RadioEvent> + Send + 'static,
   {
      let events = self.events.clone();
      tokio::spawn(async move {
         let _ = events.send(completion.await).await;
      });
   }

   fn drop_notifications(&self, id: &PeripheralId) {
      self.notifications.lock().retain(|handle, task| {
         if &handle.peripheral == id {
            task.abort();
            false
         } else {
            true
         }
      });
   }
}

impl Drop for BluezRadio {
   fn drop(&mut self) {
      self.monitor.abort();
      if let Some(scan) = self.scan.get_mut().take() {
         scan.abort();
      }
      for (_, task) in self.links.get_mut().drain() {
         task.abort();
      }
      for (_, task) in self.notifications.get_mut().drain() {
         task.abort();
      }
   }
}

impl Radio for BluezRadio {
   fn check_state(&self, request: RequestId) -> Result<()> {
      let adapter = self.adapter.clone();
      self.complete(async move {
         RadioEvent::StateUpdated {
            request: Some(request),
            state: adapter_state(&adapter).await,
         }
      });
      Ok(())
   }

   fn scan(&self, request: RequestId, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      let filter = DiscoveryFilter {
         uuids: services.iter().copied().collect(),
         duplicate_data: allow_duplicates,
         transport: DiscoveryTransport::Le,
         ..Default::default()
      };

      let task = tokio::spawn(async move {
         if let Err(e) = discover(&adapter, filter, &events).await {
            warn!("Discovery on {} failed: {e}", adapter.name());
         }
         let _ = events.send(RadioEvent::ScanStopped { request }).await;
      });
      if let Some(old) = self.scan.lock().replace(task) {
         old.abort();
      }
      Ok(())
   }

   fn stop_scan(&self) -> Result<()> {
      // Dropping the discovery stream ends discovery.
      if let Some(task) = self.scan.lock().take() {
         task.abort();
      }
      Ok(())
   }

   fn connect(&self, request: RequestId, id: &PeripheralId) -> Result<()> {
      let device = self.device(id)?;
      let events = self.events.clone();
      let id = id.clone();

      let task = tokio::spawn({
         let id = id.clone();
         async move {
            match device.connect().await {
               Ok(()) => {
                  let _ = events
                     .send(RadioEvent::Connected {
                        request,
                        id: id.clone(),
                     })
                     .await;
                  watch_link(device, id, events).await;
               },
               Err(e) => {
                  let _ = events
                     .send(RadioEvent::ConnectFailed {
                        request,
                        id,
                        reason: e.to_string(),
                     })
                     .await;
               },
            }
         }
      });
      if let Some(old) = self.links.lock().insert(id, task) {
         old.abort();
      }
      Ok(())
   }

   fn disconnect(&self, _request: RequestId, id: &PeripheralId) -> Result<()> {
      let device = self.device(id)?;
      if let Some(link) = self.links.lock().remove(id) {
         link.abort();
      }
      self.drop_notifications(id);

      let id = id.clone();
      self.complete(async move {
         if let Err(e) = device.disconnect().await {
            warn!("{id}: disconnect failed: {e}");
         }
         RadioEvent::Disconnected { id }
      });
      Ok(())
   }

   fn read(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()> {
      let device = self.device(&handle.peripheral)?;
      let handle = handle.clone();
      self.complete(async move {
         let result: RadioResult<Vec<u8>> = async {
            let characteristic = characteristic(&device, &handle).await?;
            characteristic.read().await.map_err(|e| e.to_string())
         }
         .await;
         RadioEvent::ReadCompleted { request, result }
      });
      Ok(())
   }

   fn write(
      &self,
      request: RequestId,
      handle: &CharacteristicHandle,
      data: &[u8],
      with_response: bool,
   ) -> Result<()> {
      let device = self.device(&handle.peripheral)?;
      let handle = handle.clone();
      let data = data.to_vec();
      let events = self.events.clone();
      let write_request = CharacteristicWriteRequest {
         op_type: if with_response {
            WriteOp::Request
         } else {
            WriteOp::Command
         },
         ..Default::default()
      };

      tokio::spawn(async move {
         let result: RadioResult<()> = async {
            let characteristic = characteristic(&device, &handle).await?;
            characteristic
               .write_ext(&data, &write_request)
               .await
               .map_err(|e| e.to_string())
         }
         .await;

         if with_response {
            let _ = events
               .send(RadioEvent::WriteCompleted { request, result })
               .await;
         } else if let Err(e) = result {
            warn!("{handle}: write without response failed: {e}");
         }
      });
      Ok(())
   }

   fn start_notification(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()> {
      let device = self.device(&handle.peripheral)?;
      let events = self.events.clone();
      let target = handle.clone();

      let task = tokio::spawn(async move {
         let stream = match characteristic(&device, &target).await {
            Ok(characteristic) => characteristic.notify().await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
         };
         let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
               let _ = events
                  .send(RadioEvent::NotificationStateChanged {
                     request,
                     result: Err(e),
                  })
                  .await;
               return;
            },
         };
         let _ = events
            .send(RadioEvent::NotificationStateChanged {
               request,
               result: Ok(()),
            })
            .await;

         pin_mut!(stream);
         while let Some(value) = stream.next().await {
            let event = RadioEvent::ValueChanged {
               handle: target.clone(),
               value,
            };
            if events.send(event).await.is_err() {
               break;
            }
         }
         debug!("{target}: notification stream ended");
      });
      if let Some(old) = self.notifications.lock().insert(handle.clone(), task) {
         old.abort();
      }
      Ok(())
   }

   fn stop_notification(&self, request: RequestId, handle: &CharacteristicHandle) -> Result<()> {
      // Dropping the notify stream unsubscribes.
      if let Some(task) = self.notifications.lock().remove(handle) {
         task.abort();
      }
      self.complete(async move {
         RadioEvent::NotificationStateChanged {
            request,
            result: Ok(()),
         }
      });
      Ok(())
   }

   fn retrieve_connected(&self, request: RequestId, services: &[Uuid]) -> Result<()> {
      let adapter = self.adapter.clone();
      let services = services.to_vec();
      self.complete(async move {
         RadioEvent::ConnectedPeripheralsRetrieved {
            request,
            result: connected_peripherals(&adapter, &services)
               .await
               .map_err(|e| e.to_string()),
         }
      });
      Ok(())
   }
}

async fn adapter_state(adapter: &Adapter) -> AdapterState {
   match adapter.is_powered().await {
      Ok(true) => AdapterState::PoweredOn,
      Ok(false) => AdapterState::PoweredOff,
      Err(e) if matches!(e.kind, ErrorKind::NotAuthorized) => AdapterState::Unauthorized,
      Err(e) => {
         warn!("Failed to read power state of {}: {e}", adapter.name());
         AdapterState::Unknown
      },
   }
}

/// Reports every advertisement until discovery ends.
async fn discover(
   adapter: &Adapter,
   filter: DiscoveryFilter,
   events: &RadioEventSender,
) -> bluer::Result<()> {
   adapter.set_discovery_filter(filter).await?;
   let stream = adapter.discover_devices_with_changes().await?;
   pin_mut!(stream);

   while let Some(event) = stream.next().await {
      let AdapterEvent::DeviceAdded(addr) = event else {
         continue;
      };
      let device = adapter.device(addr)?;
      match advertisement(&device).await {
         Ok(adv) => {
            if events.send(RadioEvent::PeripheralDiscovered(adv)).await.is_err() {
               break;
            }
         },
         Err(e) => debug!("{addr}: failed to read advertisement: {e}"),
      }
   }
   Ok(())
}

async fn advertisement(device: &Device) -> bluer::Result<Advertisement> {
   let mut adv = Advertisement::new(device.address().to_string());
   if let Some(name) = device.name().await? {
      adv = adv.name(name);
   }
   if let Some(rssi) = device.rssi().await? {
      adv = adv.rssi(rssi);
   }
   for uuid in device.uuids().await?.unwrap_or_default() {
      adv = adv.service(uuid);
   }
   Ok(adv)
}

async fn connected_peripherals(
   adapter: &Adapter,
   services: &[Uuid],
) -> bluer::Result<Vec<Advertisement>> {
   let mut found = Vec::new();
   for addr in adapter.device_addresses().await? {
      let device = adapter.device(addr)?;
      if !device.is_connected().await? {
         continue;
      }
      let adv = advertisement(&device).await?;
      if services.is_empty() || adv.services.iter().any(|uuid| services.contains(uuid)) {
         found.push(adv);
      }
   }
   Ok(found)
}

/// Reports `Disconnected` once the link to `device` goes down.
async fn watch_link(device: Device, id: PeripheralId, events: RadioEventSender) {
   let stream = match device.events().await {
      Ok(stream) => stream,
      Err(e) => {
         warn!("{id}: cannot watch link: {e}");
         return;
      },
   };
   pin_mut!(stream);

   // The link may have dropped before the watch was in place.
   if device.is_connected().await.unwrap_or(false) {
      while let Some(event) = stream.next().await {
         if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            break;
         }
      }
   }
   debug!("{id}: link down");
   let _ = events.send(RadioEvent::Disconnected { id }).await;
}

async fn characteristic(
   device: &Device,
   handle: &CharacteristicHandle,
) -> RadioResult<Characteristic> {
   let services = device.services().await.map_err(|e| e.to_string())?;
   for service in services {
      if service.uuid().await.map_err(|e| e.to_string())? != handle.service {
         continue;
      }
      for characteristic in service.characteristics().await.map_err(|e| e.to_string())? {
         if characteristic.uuid().await.map_err(|e| e.to_string())? == handle.characteristic {
            return Ok(characteristic);
         }
      }
   }
   Err(format!("characteristic {handle} not found"))
}
