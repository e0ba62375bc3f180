//! Scan session lifecycle: start/stop, filtering, deduplication and expiry.

use std::{collections::HashSet, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

use crate::{
   error::{BleError, Result},
   event::{BleEvent, EventSender, ScanStopReason},
   model::{Peripheral, PeripheralId},
   radio::{Radio, RequestId},
};

/// Identifies one scan session so stale timers and radio reports can be
/// told apart. Wraps the request the session was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanId(RequestId);

/// Resolved with the peripherals reported during the session.
pub type ScanWaiter = oneshot::Sender<Vec<Peripheral>>;

struct ScanSession {
   id: ScanId,
   services: Vec<Uuid>,
   allow_duplicates: bool,
   reported: HashSet<PeripheralId>,
   discovered: Vec<Peripheral>,
   waiters: Vec<ScanWaiter>,
   timer: Option<JoinHandle<()>>,
}

pub struct ScanController {
   radio: Arc<dyn Radio>,
   events: EventSender,
   session: Option<ScanSession>,
}

/// Validates a scan duration given in (possibly fractional) seconds.
pub fn scan_duration(secs: f64) -> Result<Duration> {
   if !secs.is_finite() || secs <= 0.0 {
      return Err(BleError::InvalidArgument(format!(
         "scan duration must be positive, got {secs}"
      )));
   }
   Duration::try_from_secs_f64(secs)
      .map_err(|e| BleError::InvalidArgument(format!("scan duration {secs}: {e}")))
}

impl ScanController {
   pub fn new(radio: Arc<dyn Radio>, events: EventSender) -> Self {
      Self {
         radio,
         events,
         session: None,
      }
   }

   pub const fn is_scanning(&self) -> bool {
      self.session.is_some()
   }

   /// Starts a session under `request`. The caller is responsible for
   /// arming the expiry timer with the returned duration.
   pub fn start(
      &mut self,
      request: RequestId,
      services: &[Uuid],
      duration_secs: f64,
      allow_duplicates: bool,
   ) -> Result<(ScanId, Duration)> {
      let duration = scan_duration(duration_secs)?;
      if self.session.is_some() {
         return Err(BleError::AlreadyScanning);
      }

      self.radio.scan(request, services, allow_duplicates)?;

      let id = ScanId(request);
      info!(
         "Scanning for {duration:?} (services: {}, duplicates: {allow_duplicates})",
         services.len()
      );
      self.session = Some(ScanSession {
         id,
         services: services.to_vec(),
         allow_duplicates,
         reported: HashSet::new(),
         discovered: Vec::new(),
         waiters: Vec::new(),
         timer: None,
      });
      Ok((id, duration))
   }

   /// Attaches the expiry timer to its session. A timer for a session that
   /// already ended is aborted.
   pub fn arm(&mut self, id: ScanId, timer: JoinHandle<()>) {
      match &mut self.session {
         Some(session) if session.id == id => {
            if let Some(old) = session.timer.replace(timer) {
               old.abort();
            }
         },
         _ => timer.abort(),
      }
   }

   /// Registers a waiter resolved when the current session ends. Returns
   /// the waiter back if there is no session.
   pub fn wait(&mut self, waiter: ScanWaiter) -> std::result::Result<(), ScanWaiter> {
      match &mut self.session {
         Some(session) => {
            session.waiters.push(waiter);
            Ok(())
         },
         None => Err(waiter),
      }
   }

   /// Publishes `PeripheralDiscovered` for `peripheral` if the active session
   /// wants it. Returns whether it was published.
   pub fn discovered(&mut self, peripheral: &Peripheral) -> bool {
      let Some(session) = &mut self.session else {
         return false;
      };
      if !peripheral.matches_any(&session.services) {
         debug!("{}: filtered out of scan results", peripheral.id);
         return false;
      }
      if !session.allow_duplicates && !session.reported.insert(peripheral.id.clone()) {
         return false;
      }

      match session
         .discovered
         .iter_mut()
         .find(|p| p.id == peripheral.id)
      {
         Some(existing) => *existing = peripheral.clone(),
         None => session.discovered.push(peripheral.clone()),
      }
      self
         .events
         .emit(BleEvent::PeripheralDiscovered(peripheral.clone()));
      true
   }

   /// Ends the active session, if any, publishing `ScanStopped` once.
   pub fn stop(&mut self, reason: ScanStopReason) -> bool {
      let Some(mut session) = self.session.take() else {
         return false;
      };
      if let Some(timer) = session.timer.take() {
         timer.abort();
      }
      if matches!(reason, ScanStopReason::Requested | ScanStopReason::Timeout)
         && let Err(e) = self.radio.stop_scan()
      {
         warn!("Radio refused to stop scanning: {e}");
      }

      info!(
         "Scan stopped ({reason}), {} peripherals reported",
         session.discovered.len()
      );
      self.events.emit(BleEvent::ScanStopped(reason));
      for waiter in session.waiters.drain(..) {
         let _ = waiter.send(session.discovered.clone());
      }
      true
   }

   /// Handles an expiry timer; ignored unless `id` is the active session.
   pub fn expire(&mut self, id: ScanId) -> bool {
      if self.is_current(id) {
         self.stop(ScanStopReason::Timeout)
      } else {
         debug!("Ignoring expiry of finished scan {}", id.0);
         false
      }
   }

   /// Handles the radio ending the scan started by `request` on its own.
   pub fn radio_stopped(&mut self, request: RequestId) -> bool {
      if self.is_current(ScanId(request)) {
         self.stop(ScanStopReason::Radio)
      } else {
         debug!("Ignoring radio stop of finished scan {request}");
         false
      }
   }

   fn is_current(&self, id: ScanId) -> bool {
      matches!(&self.session, Some(session) if session.id == id)
   }
}
