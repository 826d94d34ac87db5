//! Headset battery reporting daemon.
//!
//! This service watches BLE advertisements of connected Apple headsets,
//! decodes their battery, charging and in-ear state, and republishes it
//! over D-Bus and into a per-device metadata store.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use airpods::{
   metadata::{MemoryStore, SharedStore},
   protocol::BatteryEvent,
   session::Headset,
};
use bluetooth::manager::BluetoothManager;
use dbus::BatteryService;
use event::{EventBus, HeadsetEvent};
use store::MetadataDb;

mod airpods;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod store;

use crate::{dbus::BatteryServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting podbattery D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let store: SharedStore = match MetadataDb::open(config.metadata_db_path.as_deref()) {
      Ok(db) => Arc::new(db),
      Err(e) => {
         warn!("Metadata store unavailable, keeping metadata in memory: {e}");
         Arc::new(MemoryStore::new())
      },
   };

   // Create event channel
   let event_bus = EventProcessor::new();

   let bluetooth_manager = BluetoothManager::new(event_bus.clone(), config, Some(store)).await?;

   let service = BatteryService::new(bluetooth_manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(dbus::BUS_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("podbattery D-Bus service started at {}", dbus::BUS_NAME);

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down podbattery service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Headset, HeadsetEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Headset, HeadsetEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<BatteryService>,
      (headset, event): (Headset, HeadsetEvent),
   ) -> Result<()> {
      let addr_str = headset.address.to_string();
      match event {
         HeadsetEvent::SessionStarted => {
            iface.session_started(&addr_str).await?;
         },
         HeadsetEvent::SessionStopped => {
            iface.session_stopped(&addr_str).await?;
         },
         HeadsetEvent::BatteryIndicator(battery) => {
            iface
               .vendor_specific_event(
                  &addr_str,
                  &headset.name,
                  BatteryEvent::COMMAND,
                  BatteryEvent::COMPANY_ID,
                  BatteryEvent::COMMAND_TYPE as i32,
                  battery.arguments.to_vec(),
               )
               .await?;
         },
         HeadsetEvent::BatteryWidgetChanged(battery) => {
            iface
               .battery_widget_changed(&addr_str, &battery.to_json().to_string())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BatteryService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, headset: &Headset, event: HeadsetEvent) {
      self.queue.push((headset.clone(), event));
      self.notifier.notify_waiters();
   }
}
