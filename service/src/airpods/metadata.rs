//! Per-device metadata fields and their synchronization.
//!
//! Decoded state is mirrored into a key/value metadata store consumed by UI
//! layers. Identity, icon and threshold fields are written once if absent;
//! battery and charging fields are written whenever they change.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr, format_smolstr};
use strum::IntoEnumIterator;

use crate::{
   airpods::{
      models::ModelSpec,
      protocol::{AccessoryState, BatteryLevel},
   },
   error::Result,
};

pub const MANUFACTURER_NAME: &str = "Apple Inc.";
pub const DEVICE_TYPE_UNTETHERED_HEADSET: &str = "Untethered Headset";

const TRUE: &str = "true";
const FALSE: &str = "false";

/// Metadata fields, numbered like the platform's device metadata keys.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   PartialOrd,
   Ord,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum MetadataKey {
   ManufacturerName = 0,
   ModelName = 1,
   MainIcon = 5,
   UntetheredLeftIcon = 7,
   UntetheredRightIcon = 8,
   UntetheredCaseIcon = 9,
   UntetheredLeftBattery = 10,
   UntetheredRightBattery = 11,
   UntetheredCaseBattery = 12,
   UntetheredLeftCharging = 13,
   UntetheredRightCharging = 14,
   UntetheredCaseCharging = 15,
   DeviceType = 17,
   MainBattery = 18,
   MainCharging = 19,
   MainLowBatteryThreshold = 20,
   UntetheredLeftLowBatteryThreshold = 21,
   UntetheredRightLowBatteryThreshold = 22,
   UntetheredCaseLowBatteryThreshold = 23,
}

/// Persistent per-device key/value store.
pub trait MetadataStore: Send + Sync {
   /// Reads a field, `None` if it was never written.
   fn get(&self, device: Address, key: MetadataKey) -> Result<Option<Vec<u8>>>;

   /// Writes a field, replacing any previous value.
   fn set(&self, device: Address, key: MetadataKey, value: &[u8]) -> Result<()>;

   /// Every field stored for `device`, in key order.
   fn entries(&self, device: Address) -> Result<Vec<(MetadataKey, Vec<u8>)>> {
      let mut entries = Vec::new();
      for key in MetadataKey::iter() {
         if let Some(value) = self.get(device, key)? {
            entries.push((key, value));
         }
      }
      Ok(entries)
   }
}

/// Type alias for a shareable metadata store.
pub type SharedStore = Arc<dyn MetadataStore>;

/// Volatile store, used when no database is available and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
   entries: Mutex<HashMap<(Address, MetadataKey), Vec<u8>>>,
}

impl MemoryStore {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn get_str(&self, device: Address, key: MetadataKey) -> Option<String> {
      self
         .entries
         .lock()
         .get(&(device, key))
         .map(|v| String::from_utf8_lossy(v).into_owned())
   }

   pub fn len(&self) -> usize {
      self.entries.lock().len()
   }
}

impl MetadataStore for MemoryStore {
   fn get(&self, device: Address, key: MetadataKey) -> Result<Option<Vec<u8>>> {
      Ok(self.entries.lock().get(&(device, key)).cloned())
   }

   fn set(&self, device: Address, key: MetadataKey, value: &[u8]) -> Result<()> {
      self.entries.lock().insert((device, key), value.to_vec());
      Ok(())
   }
}

/// Everything a sync pass needs besides the decoded state.
pub struct SyncContext<'a> {
   pub store: &'a dyn MetadataStore,
   pub device: Address,
   pub icon_base_uri: &'a str,
   pub low_battery_threshold: u8,
}

/// Write-side bookkeeping of one model decoder.
#[derive(Debug, Default)]
pub struct MetadataSync {
   identity_set: bool,
   icons_set: bool,
   thresholds_set: bool,
   /// Last value successfully written per write-on-change field
   written: HashMap<MetadataKey, SmolStr>,
}

impl MetadataSync {
   /// Mirrors `state` into the store. Returns the number of writes made.
   pub fn sync(
      &mut self,
      spec: &ModelSpec,
      state: &AccessoryState,
      ctx: &SyncContext<'_>,
   ) -> usize {
      let mut writes = 0;

      if !spec.is_generic() && !self.identity_set {
         self.identity_set = set_all_if_absent(
            ctx,
            &[
               (MetadataKey::ManufacturerName, MANUFACTURER_NAME),
               (MetadataKey::ModelName, spec.model_name),
               (MetadataKey::DeviceType, DEVICE_TYPE_UNTETHERED_HEADSET),
            ],
            &mut writes,
         );
      }

      if let Some(icons) = spec.icons
         && !self.icons_set
      {
         let base = ctx.icon_base_uri.trim_end_matches('/');
         let uri = |name: &str| format!("{base}/{name}");
         let (main, left, right, case) = (
            uri(icons.main),
            uri(icons.left),
            uri(icons.right),
            uri(icons.case),
         );
         self.icons_set = set_all_if_absent(
            ctx,
            &[
               (MetadataKey::MainIcon, main.as_str()),
               (MetadataKey::UntetheredLeftIcon, left.as_str()),
               (MetadataKey::UntetheredRightIcon, right.as_str()),
               (MetadataKey::UntetheredCaseIcon, case.as_str()),
            ],
            &mut writes,
         );
      }

      if !self.thresholds_set {
         let threshold = ctx.low_battery_threshold.to_smolstr();
         self.thresholds_set = if spec.is_generic() {
            set_all_if_absent(
               ctx,
               &[(MetadataKey::MainLowBatteryThreshold, threshold.as_str())],
               &mut writes,
            )
         } else {
            set_all_if_absent(
               ctx,
               &[
                  (MetadataKey::MainLowBatteryThreshold, threshold.as_str()),
                  (MetadataKey::UntetheredLeftLowBatteryThreshold, threshold.as_str()),
                  (MetadataKey::UntetheredRightLowBatteryThreshold, threshold.as_str()),
                  (MetadataKey::UntetheredCaseLowBatteryThreshold, threshold.as_str()),
               ],
               &mut writes,
            )
         };
      }

      if spec.is_generic() {
         return writes;
      }

      if let Some(charging) = state.charging {
         for (key, value) in [
            (MetadataKey::UntetheredLeftCharging, charging.left),
            (MetadataKey::UntetheredRightCharging, charging.right),
            (MetadataKey::UntetheredCaseCharging, charging.case),
            (MetadataKey::MainCharging, charging.main),
         ] {
            writes += self.set_on_change(ctx, key, flag(value));
         }
      }

      writes += self.set_on_change(ctx, MetadataKey::UntetheredLeftBattery, percent(state.left));
      writes += self.set_on_change(ctx, MetadataKey::UntetheredRightBattery, percent(state.right));
      if let Some(case) = state.case {
         writes += self.set_on_change(ctx, MetadataKey::UntetheredCaseBattery, percent(case));
      }
      writes += self.set_on_change(ctx, MetadataKey::MainBattery, percent(state.unified()));

      writes
   }

   fn set_on_change(&mut self, ctx: &SyncContext<'_>, key: MetadataKey, value: SmolStr) -> usize {
      if self.written.get(&key) == Some(&value) {
         return 0;
      }
      match ctx.store.set(ctx.device, key, value.as_bytes()) {
         Ok(()) => {
            debug!("Metadata {key} = {value} for {}", ctx.device);
            self.written.insert(key, value);
            1
         },
         Err(e) => {
            warn!("Failed to write metadata {key} for {}: {e}", ctx.device);
            0
         },
      }
   }
}

/// Writes every field that is absent or empty. True if all fields are now set.
fn set_all_if_absent(
   ctx: &SyncContext<'_>,
   fields: &[(MetadataKey, &str)],
   writes: &mut usize,
) -> bool {
   let mut complete = true;
   for &(key, value) in fields {
      complete &= set_if_absent(ctx, key, value, writes);
   }
   complete
}

fn set_if_absent(ctx: &SyncContext<'_>, key: MetadataKey, value: &str, writes: &mut usize) -> bool {
   match ctx.store.get(ctx.device, key) {
      Ok(Some(existing)) if !existing.is_empty() => true,
      Ok(_) => match ctx.store.set(ctx.device, key, value.as_bytes()) {
         Ok(()) => {
            debug!("Metadata {key} initialized to {value:?} for {}", ctx.device);
            *writes += 1;
            true
         },
         Err(e) => {
            warn!("Failed to write metadata {key} for {}: {e}", ctx.device);
            false
         },
      },
      Err(e) => {
         warn!("Failed to read metadata {key} for {}: {e}", ctx.device);
         false
      },
   }
}

fn flag(value: bool) -> SmolStr {
   SmolStr::new_static(if value { TRUE } else { FALSE })
}

fn percent(level: BatteryLevel) -> SmolStr {
   format_smolstr!("{}", level.percent())
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicBool, Ordering};

   use super::*;
   use crate::{
      airpods::{
         models::{GENERIC, ModelId},
         parser::{self, tests::frame},
      },
      error::ServiceError,
   };

   const DEVICE: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   fn ctx(store: &dyn MetadataStore) -> SyncContext<'_> {
      SyncContext {
         store,
         device: DEVICE,
         icon_base_uri: "file:///icons/",
         low_battery_threshold: 20,
      }
   }

   fn pro_state(flags: u8, battery: u8, charging: u8) -> AccessoryState {
      let data = frame([0x14, 0x20], flags, battery, charging);
      parser::decode_premium(parser::validate_frame(&data).unwrap())
   }

   #[test]
   fn test_first_sync_writes_everything() {
      let store = MemoryStore::new();
      let mut sync = MetadataSync::default();
      let spec = ModelId::AirPodsProGen2.spec();

      let writes = sync.sync(spec, &pro_state(0x00, 0x82, 0x25), &ctx(&store));
      // 3 identity + 4 icons + 4 thresholds + 4 charging + 4 batteries
      assert_eq!(writes, 19);
      assert_eq!(store.len(), 19);

      let get = |key| store.get_str(DEVICE, key).unwrap();
      assert_eq!(get(MetadataKey::ManufacturerName), "Apple Inc.");
      assert_eq!(get(MetadataKey::ModelName), "AirPods Pro");
      assert_eq!(get(MetadataKey::DeviceType), "Untethered Headset");
      assert_eq!(get(MetadataKey::MainIcon), "file:///icons/airpods_pro");
      assert_eq!(get(MetadataKey::UntetheredCaseIcon), "file:///icons/airpods_pro_case");
      assert_eq!(get(MetadataKey::UntetheredLeftLowBatteryThreshold), "20");
      assert_eq!(get(MetadataKey::UntetheredLeftBattery), "80");
      assert_eq!(get(MetadataKey::UntetheredRightBattery), "20");
      assert_eq!(get(MetadataKey::UntetheredCaseBattery), "50");
      assert_eq!(get(MetadataKey::MainBattery), "20");
      assert_eq!(get(MetadataKey::UntetheredLeftCharging), "true");
      assert_eq!(get(MetadataKey::UntetheredRightCharging), "false");
      assert_eq!(get(MetadataKey::MainCharging), "false");
   }

   #[test]
   fn test_sync_is_idempotent() {
      let store = MemoryStore::new();
      let mut sync = MetadataSync::default();
      let spec = ModelId::AirPodsPro.spec();
      let state = pro_state(0x00, 0x82, 0x00);

      assert!(sync.sync(spec, &state, &ctx(&store)) > 0);
      assert_eq!(sync.sync(spec, &state, &ctx(&store)), 0);

      // Only the changed battery fields are rewritten (right and main).
      let state = pro_state(0x00, 0x81, 0x00);
      assert_eq!(sync.sync(spec, &state, &ctx(&store)), 2);
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::UntetheredRightBattery).as_deref(),
         Some("10")
      );
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::MainBattery).as_deref(),
         Some("10")
      );
   }

   #[test]
   fn test_unknown_battery_writes_sentinel() {
      let store = MemoryStore::new();
      let mut sync = MetadataSync::default();
      sync.sync(
         ModelId::AirPodsProGen2.spec(),
         &pro_state(0x00, 0xF3, 0x0F),
         &ctx(&store),
      );
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::UntetheredLeftBattery).as_deref(),
         Some("-1")
      );
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::UntetheredCaseBattery).as_deref(),
         Some("-1")
      );
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::MainBattery).as_deref(),
         Some("30")
      );
   }

   #[test]
   fn test_existing_identity_is_preserved() {
      let store = MemoryStore::new();
      store
         .set(DEVICE, MetadataKey::ModelName, b"My Buds")
         .unwrap();
      store.set(DEVICE, MetadataKey::MainIcon, b"").unwrap();

      let mut sync = MetadataSync::default();
      sync.sync(
         ModelId::AirPodsProGen2.spec(),
         &pro_state(0x00, 0x55, 0x00),
         &ctx(&store),
      );
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::ModelName).as_deref(),
         Some("My Buds")
      );
      // Empty values count as absent.
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::MainIcon).as_deref(),
         Some("file:///icons/airpods_pro")
      );
   }

   #[test]
   fn test_generic_only_sets_main_threshold() {
      let store = MemoryStore::new();
      let mut sync = MetadataSync::default();
      let data = frame([0x06, 0x20], 0x00, 0x55, 0x00);
      let state = parser::decode_generic(parser::validate_frame(&data).unwrap());

      assert_eq!(sync.sync(&GENERIC, &state, &ctx(&store)), 1);
      assert_eq!(
         store.get_str(DEVICE, MetadataKey::MainLowBatteryThreshold).as_deref(),
         Some("20")
      );
      assert_eq!(sync.sync(&GENERIC, &state, &ctx(&store)), 0);
   }

   /// Rejects writes to one key while `broken` is set.
   #[derive(Default)]
   struct FlakyStore {
      inner: MemoryStore,
      broken: AtomicBool,
   }

   impl MetadataStore for FlakyStore {
      fn get(&self, device: Address, key: MetadataKey) -> Result<Option<Vec<u8>>> {
         self.inner.get(device, key)
      }

      fn set(&self, device: Address, key: MetadataKey, value: &[u8]) -> Result<()> {
         if key == MetadataKey::UntetheredRightIcon && self.broken.load(Ordering::Relaxed) {
            return Err(ServiceError::DeviceNotFound(device));
         }
         self.inner.set(device, key, value)
      }
   }

   #[test]
   fn test_failed_write_does_not_block_others() {
      let store = FlakyStore::default();
      store.broken.store(true, Ordering::Relaxed);
      let mut sync = MetadataSync::default();
      let spec = ModelId::AirPodsProGen2.spec();
      let state = pro_state(0x00, 0x55, 0x00);

      let writes = sync.sync(spec, &state, &ctx(&store));
      assert_eq!(writes, 18);
      assert!(
         store
            .inner
            .get_str(DEVICE, MetadataKey::UntetheredCaseIcon)
            .is_some()
      );
      assert!(!sync.icons_set);

      // The icon group is retried once the store recovers.
      store.broken.store(false, Ordering::Relaxed);
      assert_eq!(sync.sync(spec, &state, &ctx(&store)), 1);
      assert!(sync.icons_set);
   }
}
