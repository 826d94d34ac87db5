//! Bluetooth session manager.
//!
//! This module handles Bluetooth adapter management, headset discovery and
//! the lifecycle of headset sessions, and routes scan batches from the
//! per-adapter scanners into those sessions.

use std::{collections::HashMap, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::{
      self,
      metadata::SharedStore,
      session::{Headset, HeadsetSession, SessionOptions},
   },
   bluetooth::scanner::{self, ScanBatch},
   config::Config,
   error::{Result, ServiceError},
   event::{EventSender, HeadsetEvent},
};

/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum adapter recovery delay
const MAX_ADAPTER_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Scan batches in flight
const SCAN_BUFFER_SIZE: usize = 64;

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   scanner_handle: Option<JoinHandle<()>>,
   retry_count: u32,
   name: SmolStr,
}

impl AdapterInfo {
   fn stop_scanner(&mut self) {
      if let Some(handle) = self.scanner_handle.take() {
         info!("Stopping LE scan on {}", self.name);
         handle.abort();
      }
   }
}

struct ManagedSession {
   session: HeadsetSession,
   adapter_name: SmolStr,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String), // adapter_name, error

   // Device events
   DeviceDiscovered(Address, SmolStr), // address, adapter_name
   DeviceLost(Address),

   // Queries
   GetSession(Address, oneshot::Sender<Option<serde_json::Value>>),
   GetAllSessions(oneshot::Sender<Vec<serde_json::Value>>),
   CountSessions(oneshot::Sender<u32>),
}

// === Main Manager ===

/// Handle to the manager actor that owns every headset session.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(
      event_tx: EventSender,
      config: Config,
      store: Option<SharedStore>,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(session, config, event_tx, command_rx, store).run());
      Ok(Self { inbox: command_tx })
   }

   pub async fn get_session(&self, address: Address) -> Result<serde_json::Value> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetSession(address, tx))
         .await
         .map_err(|_| ServiceError::ManagerShutdown)?;

      rx.await
         .map_err(|_| ServiceError::ManagerShutdown)?
         .ok_or(ServiceError::DeviceNotFound(address))
   }

   pub async fn all_sessions(&self) -> Vec<serde_json::Value> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetAllSessions(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn count_sessions(&self) -> u32 {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::CountSessions(tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   options: SessionOptions,
   store: Option<SharedStore>,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   scan_rx: mpsc::Receiver<ScanBatch>,
   scan_tx: mpsc::Sender<ScanBatch>,
   session: Session,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
   sessions: HashMap<Address, ManagedSession>,
}

impl ManagerActor {
   fn new(
      session: Session,
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      store: Option<SharedStore>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (scan_tx, scan_rx) = mpsc::channel(SCAN_BUFFER_SIZE);
      Self {
         options: SessionOptions::from_config(&config),
         config,
         store,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         scan_rx,
         scan_tx,
         session,
         adapters: HashMap::new(),
         sessions: HashMap::new(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      // Initialize adapters
      self.initialize_adapters().await;

      // Start periodic checks
      let health_check = Duration::from_secs(self.config.health_check_interval_sec.max(1));
      let mut health_check_interval = time::interval(health_check);
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Main event loop
      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_session_health().await;
                 self.scan_for_connected_headsets().await;
                 self.update_scanners();
             }
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             Some(batch) = self.scan_rx.recv() => {
                 self.dispatch_batch(&batch);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      // Cleanup
      self.cleanup().await;
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      // If no adapters found, try default
      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => {
            info!("Initializing adapter: {name}");

            // Ensure adapter is powered on
            if let Ok(powered) = adapter.is_powered().await
               && !powered
            {
               if let Err(e) = adapter.set_powered(true).await {
                  warn!("Failed to power on adapter {name}: {e}");
                  // Schedule retry
                  let loopback = self.loopback_tx.clone();
                  tokio::spawn(async move {
                     time::sleep(ADAPTER_RECOVERY_DELAY).await;
                     let _ = loopback
                        .send(ManagerCommand::AdapterAvailable(name, adapter))
                        .await;
                  });
                  return;
               }
               info!("Powered on adapter: {name}");
            }

            if let Some(mut old) = self.adapters.remove(&name) {
               old.stop_scanner();
               if let Some(handle) = old.monitor_handle.take() {
                  handle.abort();
               }
            }

            // Start monitoring this adapter
            self.adapters.insert(
               name.clone(),
               AdapterInfo {
                  state: AdapterState::Active,
                  monitor_handle: Some(Self::start_adapter_monitor(
                     self.loopback_tx.clone(),
                     name.clone(),
                     adapter.clone(),
                  )),
                  scanner_handle: None,
                  adapter,
                  retry_count: 0,
                  name: name.clone(),
               },
            );

            // Check for already connected headsets
            self.check_connected_devices(&name).await;
         },
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
         },
      }
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            if let Err(e) = loopback
               .send(ManagerCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await
            {
               warn!("Channel overflow sending adapter error: {e}");
            }
            return;
         };

         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceRemoved(addr) = event {
               debug!("Device removed on {name}: {addr}");
               let _ = loopback.send(ManagerCommand::DeviceLost(addr)).await;
            }
         }

         // If we exit the event loop, adapter is probably gone
         if let Err(e) = loopback.send(ManagerCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   async fn check_connected_devices(&self, adapter_name: &SmolStr) {
      let Some(adapter_info) = self.adapters.get(adapter_name) else {
         return;
      };

      let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
         return;
      };

      for addr in addresses {
         if self.sessions.contains_key(&addr) {
            continue;
         }
         if let Ok(device) = adapter_info.adapter.device(addr)
            && device.is_connected().await == Ok(true)
            && self.is_headset(&device).await
         {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name.clone()))
               .await;
         }
      }
   }

   async fn is_headset(&self, device: &bluer::Device) -> bool {
      // Check known addresses
      let addr = device.address();
      if self.config.is_known_device(&addr.to_string()).is_some() {
         return true;
      }
      airpods::recognition::is_device_headset(device).await
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::DeviceLost(addr) => {
            self.stop_session(addr);
         },
         ManagerCommand::GetSession(addr, reply) => {
            let snapshot = self.sessions.get(&addr).map(|m| m.session.snapshot());
            let _ = reply.send(snapshot);
         },
         ManagerCommand::GetAllSessions(reply) => {
            let snapshots = self
               .sessions
               .values()
               .map(|m| m.session.snapshot())
               .collect();
            let _ = reply.send(snapshots);
         },
         ManagerCommand::CountSessions(reply) => {
            let _ = reply.send(self.sessions.len() as u32);
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.adapter = adapter;
         info.state = AdapterState::Active;
         info.retry_count = 0; // Reset retry count on success

         // Restart monitor if needed
         if info.monitor_handle.is_none() {
            info.monitor_handle = Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name.clone(),
               info.adapter.clone(),
            ));
         }

         self.check_connected_devices(&name).await;
         self.update_scanners();
      } else {
         self.initialize_adapter(name).await;
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;
      info.stop_scanner();
      if let Some(handle) = info.monitor_handle.take() {
         handle.abort();
      }

      // Sessions on this adapter start over once it is back
      for managed in self.sessions.values_mut() {
         if managed.adapter_name == name {
            managed.session.reset();
         }
      }

      // Schedule adapter recovery with exponential backoff
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(info.retry_count);
      info!("Retrying adapter {name} in {delay:?}");

      tokio::spawn(async move {
         time::sleep(delay).await;

         match session.adapter(&name) {
            Ok(adapter) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterAvailable(name, adapter))
                  .await;
            },
            Err(e) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterError(
                     name,
                     format!("Recovery failed: {e}"),
                  ))
                  .await;
            },
         }
      });
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.stop_scanner();
         info.state = AdapterState::Failed(error);
      }
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.sessions.contains_key(&addr) {
         return;
      }

      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };

      let Ok(device) = adapter_info.adapter.device(addr) else {
         return;
      };

      if !self.is_headset(&device).await {
         return;
      }

      // Only proceed if already connected by bluetoothd
      if !device.is_connected().await.unwrap_or(false) {
         debug!("Discovered headset at {addr} but not connected by system");
         return;
      }

      let name = match self.config.is_known_device(&addr.to_string()) {
         Some(name) => SmolStr::from(name),
         None => device
            .name()
            .await
            .ok()
            .flatten()
            .map_or_else(|| SmolStr::from(addr.to_string()), SmolStr::from),
      };
      info!("Starting session for {name} ({addr}) on {adapter_name}");

      let headset = Headset::new(addr, name);
      self
         .event_tx
         .emit(&headset, HeadsetEvent::SessionStarted);
      self.sessions.insert(
         addr,
         ManagedSession {
            session: HeadsetSession::new(headset, self.options.clone(), self.store.clone()),
            adapter_name,
         },
      );
      self.update_scanners();
   }

   fn stop_session(&mut self, addr: Address) {
      let Some(mut managed) = self.sessions.remove(&addr) else {
         return;
      };
      let headset = managed.session.headset().clone();
      info!("Stopping session for {} ({addr})", headset.name);
      managed.session.reset();
      self
         .event_tx
         .emit(&headset, HeadsetEvent::SessionStopped);
      self.update_scanners();
   }

   /// Runs discovery exactly on the active adapters that have sessions.
   fn update_scanners(&mut self) {
      let report_delay = Duration::from_millis(self.config.report_delay_ms.max(1));
      for (name, info) in &mut self.adapters {
         let wanted = info.state == AdapterState::Active
            && self.sessions.values().any(|m| &m.adapter_name == name);
         let running = info
            .scanner_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());

         if wanted && !running {
            info.scanner_handle = Some(scanner::spawn_scanner(
               info.adapter.clone(),
               name.clone(),
               report_delay,
               self.scan_tx.clone(),
            ));
         } else if !wanted {
            info.stop_scanner();
         }
      }
   }

   fn dispatch_batch(&mut self, batch: &ScanBatch) {
      debug!(
         "Scan batch of {} observations from {}",
         batch.observations.len(),
         batch.adapter
      );
      for managed in self.sessions.values_mut() {
         if managed.adapter_name == batch.adapter {
            managed
               .session
               .handle_batch(&batch.observations, self.event_tx.as_ref());
         }
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up Bluetooth manager");

      for info in self.adapters.values_mut() {
         info.stop_scanner();
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            // Give it a moment to finish
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      let addresses: Vec<Address> = self.sessions.keys().copied().collect();
      for addr in addresses {
         self.stop_session(addr);
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   async fn scan_for_connected_headsets(&self) {
      for adapter_info in self.adapters.values() {
         if adapter_info.state == AdapterState::Active {
            self.check_connected_devices(&adapter_info.name).await;
         }
      }
   }

   async fn check_session_health(&mut self) {
      let mut disconnected = Vec::new();
      for (addr, managed) in &self.sessions {
         let connected = match self.adapters.get(&managed.adapter_name) {
            Some(info) if info.state == AdapterState::Active => match info.adapter.device(*addr) {
               Ok(device) => device.is_connected().await.unwrap_or(false),
               Err(_) => false,
            },
            // Wait for the adapter to come back
            Some(_) => true,
            None => false,
         };
         if !connected {
            disconnected.push(*addr);
         }
      }

      for addr in disconnected {
         self.stop_session(addr);
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_ADAPTER_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_retry_delay_backoff() {
      let first = calc_retry_delay(0);
      assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(3));

      let third = calc_retry_delay(2);
      assert!(third >= Duration::from_secs(8) && third < Duration::from_secs(9));

      for retries in [6, 7, 30, u32::MAX] {
         let delay = calc_retry_delay(retries);
         assert!(delay >= MAX_ADAPTER_RETRY_DELAY);
         assert!(delay < MAX_ADAPTER_RETRY_DELAY + Duration::from_secs(1));
      }
   }
}
