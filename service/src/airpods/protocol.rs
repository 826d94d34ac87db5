//! Proximity-pairing advertisement definitions and decoded state types.
//!
//! This module contains the constants, byte offsets and bit masks of the
//! proximity-pairing manufacturer data broadcast by `AirPods`-family
//! accessories, plus the value types produced by the model decoders.
//! Payloads are Apple manufacturer data with the company id already
//! stripped by `BlueZ`.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::{SmallVec, smallvec};

/// Apple company ID for manufacturer data
pub const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type, first byte of every payload
pub const PP_MAGIC: u8 = 0x07;
/// Value of the length byte for all currently known models
pub const PP_DATA_LENGTH: u8 = 25;
/// Full payload length: `[magic][length][body; PP_DATA_LENGTH]`
pub const PP_PAYLOAD_LEN: usize = 2 + PP_DATA_LENGTH as usize;

// Byte offsets inside the payload
pub const OFF_MAGIC: usize = 0;
pub const OFF_LENGTH: usize = 1;
pub const OFF_MODEL_HI: usize = 3;
pub const OFF_MODEL_LO: usize = 4;
pub const OFF_FLAGS: usize = 5;
pub const OFF_BATTERY: usize = 6;
pub const OFF_CHARGING: usize = 7;

// Flags byte
pub const FLAG_REVERSED: u8 = 1 << 7;
pub const MASK_USING_LEFT: u8 = 1 << 3;
pub const MASK_USING_RIGHT: u8 = 1 << 1;

// Charging byte, low nibble is the case level
pub const MASK_CHARGING_CASE: u8 = 1 << 6;
pub const MASK_CHARGING_LEFT: u8 = 1 << 5;
pub const MASK_CHARGING_RIGHT: u8 = 1 << 4;

/// Raw nibble value broadcast for a disconnected component
pub const NIBBLE_UNKNOWN: u8 = 0x0F;
/// Highest level on the raw 0-10 scale
pub const NIBBLE_MAX: u8 = 10;
/// Sentinel reported for an unknown battery level
pub const BATTERY_LEVEL_UNKNOWN: i32 = -1;

/// Vendor-specific headset event command carrying accessory indicators
pub const VENDOR_EVENT_IPHONEACCEV: &str = "+IPHONEACCEV";
/// Indicator type for battery level in `+IPHONEACCEV` arguments
pub const INDICATOR_BATTERY_LEVEL: i32 = 1;

/// AT command types of a vendor-specific headset event.
#[repr(i32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum AtCommandType {
   Read = 0,
   Test = 1,
   Set = 2,
   Basic = 3,
   Action = 4,
}

/// Output scale for a normalized battery level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelScale {
   /// 0-10, used for metadata fields
   Metadata,
   /// 0-9, used for the outward battery indicator
   Indicator,
}

/// Normalizes a raw battery nibble.
///
/// 15 maps to [`BATTERY_LEVEL_UNKNOWN`], anything above 10 is clamped to 10.
/// On the indicator scale positive values are additionally decremented by
/// one, which is the platform convention for the `+IPHONEACCEV` battery
/// indicator (0-9), while metadata keeps the 0-10 value.
pub const fn normalize_level(raw: u8, scale: LevelScale) -> i32 {
   if raw == NIBBLE_UNKNOWN {
      return BATTERY_LEVEL_UNKNOWN;
   }
   let clamped = if raw > NIBBLE_MAX { NIBBLE_MAX } else { raw };
   let mut level = clamped as i32;
   if matches!(scale, LevelScale::Indicator) && level > 0 {
      level -= 1;
   }
   level
}

/// Battery level of a single component as broadcast (one nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BatteryLevel(u8);

impl BatteryLevel {
   pub const UNKNOWN: Self = Self(NIBBLE_UNKNOWN);

   pub const fn from_nibble(nibble: u8) -> Self {
      Self(nibble & 0x0F)
   }

   pub const fn raw(self) -> u8 {
      self.0
   }

   pub const fn is_known(self) -> bool {
      self.0 != NIBBLE_UNKNOWN
   }

   /// Metadata-scale level (0-10 or -1).
   pub const fn level(self) -> i32 {
      normalize_level(self.0, LevelScale::Metadata)
   }

   /// Indicator-scale level (0-9 or -1).
   pub const fn indicator(self) -> i32 {
      normalize_level(self.0, LevelScale::Indicator)
   }

   /// Metadata level on the external percent-like scale (level × 10, or -1).
   pub const fn percent(self) -> i32 {
      let level = self.level();
      if level == BATTERY_LEVEL_UNKNOWN {
         BATTERY_LEVEL_UNKNOWN
      } else {
         level * 10
      }
   }

   /// Lower of two raw levels. An unknown side (15) never wins over a known one.
   pub fn min(self, other: Self) -> Self {
      Self(self.0.min(other.0))
   }
}

impl fmt::Display for BatteryLevel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_known() {
         write!(f, "{}", self.level())
      } else {
         f.write_str("-")
      }
   }
}

/// Model code read from the two nibble-packed header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelCode([u8; 2]);

impl ModelCode {
   pub const fn new(hi: u8, lo: u8) -> Self {
      Self([hi, lo])
   }

   pub const fn from_frame(frame: &[u8; PP_PAYLOAD_LEN]) -> Self {
      Self([frame[OFF_MODEL_HI], frame[OFF_MODEL_LO]])
   }

   /// Model code of a Bluetooth device-id product number (`0x2014` is `0x14 0x20`).
   pub const fn from_product_id(product: u16) -> Self {
      Self(product.to_le_bytes())
   }

   pub const fn product_id(self) -> u16 {
      u16::from_le_bytes(self.0)
   }

   pub const fn nibbles(self) -> [u8; 4] {
      let [hi, lo] = self.0;
      [hi >> 4, hi & 0x0F, lo >> 4, lo & 0x0F]
   }

   /// Decimal rendering of each nibble, concatenated (`0x14 0x20` is `"1420"`).
   pub fn digits(self) -> heapless::String<8> {
      let mut s = heapless::String::new();
      for nibble in self.nibbles() {
         // At most two digits per nibble, always fits.
         let _ = write!(s, "{nibble}");
      }
      s
   }
}

impl fmt::Display for ModelCode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.digits())
   }
}

/// Charging flags of a premium-layout accessory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargingState {
   pub left: bool,
   pub right: bool,
   pub case: bool,
   /// Both earbuds charging at once
   pub main: bool,
}

/// In-ear flags of a premium-layout accessory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InEarState {
   pub left: bool,
   pub right: bool,
}

/// Snapshot produced by one decode of one payload.
///
/// Fields a layout cannot derive are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryState {
   pub reversed: bool,
   pub left: BatteryLevel,
   pub right: BatteryLevel,
   pub case: Option<BatteryLevel>,
   pub charging: Option<ChargingState>,
   pub in_ear: Option<InEarState>,
}

impl AccessoryState {
   /// Conservative single level: the lower of both earbuds.
   pub fn unified(&self) -> BatteryLevel {
      self.left.min(self.right)
   }

   /// Headline battery indicator event for this snapshot.
   pub fn battery_event(&self) -> BatteryEvent {
      BatteryEvent::battery_level(self.unified().indicator())
   }

   pub fn to_json(self) -> serde_json::Value {
      let charging = self.charging.unwrap_or_default();
      let in_ear = self.in_ear.unwrap_or_default();
      json!({
          "reversed": self.reversed,
          "left_level": self.left.level(),
          "right_level": self.right.level(),
          "case_level": self.case.map_or(BATTERY_LEVEL_UNKNOWN, BatteryLevel::level),
          "unified_level": self.unified().level(),
          "left_charging": charging.left,
          "right_charging": charging.right,
          "case_charging": charging.case,
          "main_charging": charging.main,
          "left_in_ear": in_ear.left,
          "right_in_ear": in_ear.right,
          "has_charging": self.charging.is_some(),
          "has_in_ear": self.in_ear.is_some(),
      })
   }
}

impl fmt::Display for AccessoryState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let charging = self.charging.unwrap_or_default();
      let in_ear = self.in_ear.unwrap_or_default();
      let tag = |using: bool, charging: bool| {
         if using {
            "USE"
         } else if charging {
            "CHG"
         } else {
            "---"
         }
      };
      write!(
         f,
         "reversed={} L: {} ({}) R: {} ({}) CASE: {} ({})",
         self.reversed,
         self.left,
         tag(in_ear.left, charging.left),
         self.right,
         tag(in_ear.right, charging.right),
         self.case.unwrap_or(BatteryLevel::UNKNOWN),
         tag(false, charging.case),
      )
   }
}

/// Set of watched boolean fields that differ between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct ChangeSet(u8);

impl ChangeSet {
   pub const LEFT_CHARGING: u8 = 1 << 0;
   pub const RIGHT_CHARGING: u8 = 1 << 1;
   pub const CASE_CHARGING: u8 = 1 << 2;
   pub const MAIN_CHARGING: u8 = 1 << 3;
   pub const LEFT_IN_EAR: u8 = 1 << 4;
   pub const RIGHT_IN_EAR: u8 = 1 << 5;

   const NAMES: [(u8, &'static str); 6] = [
      (Self::LEFT_CHARGING, "left_charging"),
      (Self::RIGHT_CHARGING, "right_charging"),
      (Self::CASE_CHARGING, "case_charging"),
      (Self::MAIN_CHARGING, "main_charging"),
      (Self::LEFT_IN_EAR, "left_in_ear"),
      (Self::RIGHT_IN_EAR, "right_in_ear"),
   ];

   /// Diffs the watched fields of `next` against `prev`.
   ///
   /// Without a previous snapshot every watched field the layout provides
   /// counts as changed. Battery levels are never watched.
   pub fn between(prev: Option<&AccessoryState>, next: &AccessoryState) -> Self {
      let mut bits = 0;

      if let Some(now) = next.charging {
         match prev.and_then(|p| p.charging) {
            Some(old) => {
               bits |= flag_if(now.left != old.left, Self::LEFT_CHARGING);
               bits |= flag_if(now.right != old.right, Self::RIGHT_CHARGING);
               bits |= flag_if(now.case != old.case, Self::CASE_CHARGING);
               bits |= flag_if(now.main != old.main, Self::MAIN_CHARGING);
            },
            None => {
               bits |= Self::LEFT_CHARGING
                  | Self::RIGHT_CHARGING
                  | Self::CASE_CHARGING
                  | Self::MAIN_CHARGING;
            },
         }
      }

      if let Some(now) = next.in_ear {
         match prev.and_then(|p| p.in_ear) {
            Some(old) => {
               bits |= flag_if(now.left != old.left, Self::LEFT_IN_EAR);
               bits |= flag_if(now.right != old.right, Self::RIGHT_IN_EAR);
            },
            None => bits |= Self::LEFT_IN_EAR | Self::RIGHT_IN_EAR,
         }
      }

      Self(bits)
   }

   pub const fn is_empty(self) -> bool {
      self.0 == 0
   }

   pub const fn contains(self, flag: u8) -> bool {
      self.0 & flag != 0
   }

   pub const fn bits(self) -> u8 {
      self.0
   }
}

const fn flag_if(cond: bool, flag: u8) -> u8 {
   if cond { flag } else { 0 }
}

impl fmt::Display for ChangeSet {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_empty() {
         return f.write_str("none");
      }
      let mut first = true;
      for (flag, name) in Self::NAMES {
         if self.contains(flag) {
            if !first {
               f.write_str(",")?;
            }
            f.write_str(name)?;
            first = false;
         }
      }
      Ok(())
   }
}

/// Headline battery event: `[count, indicator kind, value, ...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryEvent {
   pub arguments: SmallVec<[i32; 3]>,
}

impl BatteryEvent {
   pub const COMPANY_ID: u16 = APPLE_CID;
   pub const COMMAND: &'static str = VENDOR_EVENT_IPHONEACCEV;
   pub const COMMAND_TYPE: AtCommandType = AtCommandType::Set;

   /// Single battery-level indicator pair.
   pub fn battery_level(level: i32) -> Self {
      Self {
         arguments: smallvec![1, INDICATOR_BATTERY_LEVEL, level],
      }
   }

   /// Looks up the battery-level value among the key/value pairs.
   pub fn level(&self) -> Option<i32> {
      let (count, pairs) = self.arguments.split_first()?;
      pairs
         .chunks_exact(2)
         .take(usize::try_from(*count).unwrap_or(0))
         .find(|pair| pair[0] == INDICATOR_BATTERY_LEVEL)
         .map(|pair| pair[1])
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "command": Self::COMMAND,
          "company_id": Self::COMPANY_ID,
          "command_type": Self::COMMAND_TYPE as i32,
          "arguments": self.arguments.as_slice(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_normalize_unknown_on_both_scales() {
      assert_eq!(normalize_level(15, LevelScale::Metadata), BATTERY_LEVEL_UNKNOWN);
      assert_eq!(normalize_level(15, LevelScale::Indicator), BATTERY_LEVEL_UNKNOWN);
      assert_eq!(BatteryLevel::UNKNOWN.percent(), BATTERY_LEVEL_UNKNOWN);
   }

   #[test]
   fn test_normalize_clamps_above_ten() {
      for raw in 11..15 {
         assert_eq!(normalize_level(raw, LevelScale::Metadata), 10);
         assert_eq!(normalize_level(raw, LevelScale::Indicator), 9);
      }
   }

   #[test]
   fn test_indicator_scale_is_one_below_metadata() {
      // The indicator path is deliberately offset from the metadata path.
      assert_eq!(normalize_level(0, LevelScale::Indicator), 0);
      for raw in 1..=10 {
         assert_eq!(
            normalize_level(raw, LevelScale::Indicator),
            normalize_level(raw, LevelScale::Metadata) - 1
         );
      }
   }

   #[test]
   fn test_unified_is_min_of_raw_levels() {
      for left in (0..=10).chain([15]) {
         for right in (0..=10).chain([15]) {
            let state = AccessoryState {
               reversed: false,
               left: BatteryLevel::from_nibble(left),
               right: BatteryLevel::from_nibble(right),
               case: None,
               charging: None,
               in_ear: None,
            };
            assert_eq!(state.unified().raw(), left.min(right));
         }
      }
   }

   #[test]
   fn test_unified_ignores_single_unknown_side() {
      let state = AccessoryState {
         reversed: false,
         left: BatteryLevel::UNKNOWN,
         right: BatteryLevel::from_nibble(4),
         case: None,
         charging: None,
         in_ear: None,
      };
      assert_eq!(state.unified().level(), 4);
      assert_eq!(state.battery_event().level(), Some(3));
   }

   #[test]
   fn test_model_code_digits() {
      assert_eq!(ModelCode::new(0x14, 0x20).to_string(), "1420");
      assert_eq!(ModelCode::new(0x0F, 0x20).to_string(), "01520");
      assert_eq!(ModelCode::new(0x0E, 0x20).to_string(), "01420");
      assert_eq!(ModelCode::new(0x02, 0x20).to_string(), "0220");
   }

   #[test]
   fn test_model_code_product_id() {
      assert_eq!(ModelCode::new(0x14, 0x20).product_id(), 0x2014);
      assert_eq!(ModelCode::from_product_id(0x200E), ModelCode::new(0x0E, 0x20));
   }

   #[test]
   fn test_battery_event_arguments() {
      let event = BatteryEvent::battery_level(7);
      assert_eq!(event.arguments.as_slice(), &[1, INDICATOR_BATTERY_LEVEL, 7]);
      assert_eq!(event.level(), Some(7));
      assert_eq!(event.to_json()["command_type"], 2);
   }

   #[test]
   fn test_change_set_from_uninitialized() {
      let state = AccessoryState {
         reversed: false,
         left: BatteryLevel::from_nibble(5),
         right: BatteryLevel::from_nibble(5),
         case: None,
         charging: None,
         in_ear: None,
      };
      // Nothing watched, nothing changed.
      assert!(ChangeSet::between(None, &state).is_empty());

      let premium = AccessoryState {
         charging: Some(ChargingState::default()),
         in_ear: Some(InEarState::default()),
         ..state
      };
      let changes = ChangeSet::between(None, &premium);
      assert_eq!(changes.bits(), 0b11_1111);
      assert!(ChangeSet::between(Some(&premium), &premium).is_empty());
   }

   #[test]
   fn test_change_set_ignores_battery() {
      let old = AccessoryState {
         reversed: false,
         left: BatteryLevel::from_nibble(5),
         right: BatteryLevel::from_nibble(5),
         case: Some(BatteryLevel::from_nibble(3)),
         charging: Some(ChargingState::default()),
         in_ear: Some(InEarState::default()),
      };
      let new = AccessoryState {
         left: BatteryLevel::from_nibble(9),
         case: Some(BatteryLevel::from_nibble(1)),
         ..old
      };
      assert!(ChangeSet::between(Some(&old), &new).is_empty());

      let new = AccessoryState {
         in_ear: Some(InEarState {
            left: true,
            right: false,
         }),
         ..old
      };
      let changes = ChangeSet::between(Some(&old), &new);
      assert!(changes.contains(ChangeSet::LEFT_IN_EAR));
      assert!(!changes.contains(ChangeSet::RIGHT_IN_EAR));
      assert_eq!(changes.to_string(), "left_in_ear");
   }
}
