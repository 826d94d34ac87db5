use std::str::FromStr;

use bluer::Address;
use zbus::{interface, object_server::SignalEmitter};

use crate::bluetooth::manager::BluetoothManager;

pub const BUS_NAME: &str = "org.podbattery";
pub const OBJECT_PATH: &str = "/org/podbattery/manager";

pub struct BatteryService {
   bluetooth_manager: BluetoothManager,
}

impl BatteryService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

#[interface(name = "org.podbattery.Battery")]
impl BatteryService {
   async fn get_sessions(&self) -> zbus::fdo::Result<String> {
      let sessions = self.bluetooth_manager.all_sessions().await;
      serde_json::to_string(&sessions).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_session(&self, address: String) -> zbus::fdo::Result<String> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      let session = self
         .bluetooth_manager
         .get_session(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(session.to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn vendor_specific_event(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
      command: &str,
      company_id: u16,
      command_type: i32,
      args: Vec<i32>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_widget_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      event: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_started(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_stopped(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn session_count(&self) -> u32 {
      self.bluetooth_manager.count_sessions().await
   }
}
