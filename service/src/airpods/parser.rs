//! Bitfield parsing of proximity-pairing payloads.
//!
//! This module validates the fixed frame header and contains the two
//! bit layouts used by the model decoders: the premium layout (battery,
//! charging and in-ear bits) and the reduced generic layout (battery only).

use log::trace;
use thiserror::Error;

use crate::airpods::protocol::{
   AccessoryState, BatteryLevel, ChargingState, FLAG_REVERSED, InEarState, MASK_CHARGING_CASE,
   MASK_CHARGING_LEFT, MASK_CHARGING_RIGHT, MASK_USING_LEFT, MASK_USING_RIGHT, OFF_BATTERY,
   OFF_CHARGING, OFF_FLAGS, OFF_LENGTH, OFF_MAGIC, PP_DATA_LENGTH, PP_MAGIC, PP_PAYLOAD_LEN,
};

/// Error type for proximity-pairing frame validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Payload is not exactly the fixed frame size
   #[error("Payload size mismatch: expected {expected} bytes, got {actual}")]
   PayloadSizeMismatch { expected: usize, actual: usize },

   /// First byte is not the proximity-pairing type
   #[error("Not a proximity-pairing payload (type 0x{magic:02x})")]
   WrongMagic { magic: u8 },

   /// Length byte does not match the fixed body length
   #[error("Unexpected data length byte: {length} (expected {PP_DATA_LENGTH})")]
   WrongDataLength { length: u8 },
}

/// Checks size, magic and length byte of a payload.
///
/// Returns the payload as a fixed-size frame so that layout decoders can
/// index it without bounds checks failing.
pub fn validate_frame(data: &[u8]) -> Result<&[u8; PP_PAYLOAD_LEN], ProtoError> {
   let frame: &[u8; PP_PAYLOAD_LEN] =
      data.try_into().map_err(|_| ProtoError::PayloadSizeMismatch {
         expected: PP_PAYLOAD_LEN,
         actual: data.len(),
      })?;

   if frame[OFF_MAGIC] != PP_MAGIC {
      return Err(ProtoError::WrongMagic {
         magic: frame[OFF_MAGIC],
      });
   }
   if frame[OFF_LENGTH] != PP_DATA_LENGTH {
      return Err(ProtoError::WrongDataLength {
         length: frame[OFF_LENGTH],
      });
   }
   Ok(frame)
}

/// Splits the battery byte into `(left, right)`, honoring the reversed flag.
const fn split_battery(battery: u8, reversed: bool) -> (BatteryLevel, BatteryLevel) {
   let high = BatteryLevel::from_nibble(battery >> 4);
   let low = BatteryLevel::from_nibble(battery);
   if reversed { (low, high) } else { (high, low) }
}

/// Decodes the premium layout used by every fully known model.
pub fn decode_premium(frame: &[u8; PP_PAYLOAD_LEN]) -> AccessoryState {
   let flags = frame[OFF_FLAGS];
   let battery = frame[OFF_BATTERY];
   let charging = frame[OFF_CHARGING];

   let reversed = flags & FLAG_REVERSED != 0;
   let (left, right) = split_battery(battery, reversed);

   // Raw bit positions are fixed; reversal swaps which one means "left".
   let (left_mask, right_mask) = if reversed {
      (MASK_CHARGING_RIGHT, MASK_CHARGING_LEFT)
   } else {
      (MASK_CHARGING_LEFT, MASK_CHARGING_RIGHT)
   };
   let left_charging = charging & left_mask != 0;
   let right_charging = charging & right_mask != 0;

   let (left_using, right_using) = if reversed {
      (MASK_USING_LEFT, MASK_USING_RIGHT)
   } else {
      (MASK_USING_RIGHT, MASK_USING_LEFT)
   };

   let state = AccessoryState {
      reversed,
      left,
      right,
      case: Some(BatteryLevel::from_nibble(charging)),
      charging: Some(ChargingState {
         left: left_charging,
         right: right_charging,
         case: charging & MASK_CHARGING_CASE != 0,
         main: left_charging && right_charging,
      }),
      in_ear: Some(InEarState {
         left: flags & left_using != 0,
         right: flags & right_using != 0,
      }),
   };
   trace!("Premium layout: {state}");
   state
}

/// Decodes the reduced layout used for unrecognized models.
pub fn decode_generic(frame: &[u8; PP_PAYLOAD_LEN]) -> AccessoryState {
   let reversed = frame[OFF_FLAGS] & FLAG_REVERSED != 0;
   let (left, right) = split_battery(frame[OFF_BATTERY], reversed);

   let state = AccessoryState {
      reversed,
      left,
      right,
      case: None,
      charging: None,
      in_ear: None,
   };
   trace!("Generic layout: {state}");
   state
}

#[cfg(test)]
pub(crate) mod tests {
   use super::*;
   use crate::airpods::protocol::{OFF_MODEL_HI, OFF_MODEL_LO};

   /// Builds a valid frame with the given model bytes and state bytes.
   pub(crate) fn frame(model: [u8; 2], flags: u8, battery: u8, charging: u8) -> Vec<u8> {
      let mut data = vec![0u8; PP_PAYLOAD_LEN];
      data[OFF_MAGIC] = PP_MAGIC;
      data[OFF_LENGTH] = PP_DATA_LENGTH;
      data[2] = 0x01;
      data[OFF_MODEL_HI] = model[0];
      data[OFF_MODEL_LO] = model[1];
      data[OFF_FLAGS] = flags;
      data[OFF_BATTERY] = battery;
      data[OFF_CHARGING] = charging;
      data
   }

   #[test]
   fn test_rejects_wrong_sizes() {
      let good = frame([0x14, 0x20], 0, 0x55, 0);
      for len in (0..64).filter(|&l| l != PP_PAYLOAD_LEN) {
         let mut data = good.clone();
         data.resize(len, 0);
         assert_eq!(
            validate_frame(&data),
            Err(ProtoError::PayloadSizeMismatch {
               expected: PP_PAYLOAD_LEN,
               actual: len,
            })
         );
      }
      assert!(validate_frame(&good).is_ok());
   }

   #[test]
   fn test_rejects_wrong_header() {
      let mut data = frame([0x14, 0x20], 0, 0x55, 0);
      data[OFF_MAGIC] = 0x4C;
      assert_eq!(
         validate_frame(&data),
         Err(ProtoError::WrongMagic { magic: 0x4C })
      );

      let mut data = frame([0x14, 0x20], 0, 0x55, 0);
      data[OFF_LENGTH] = 0x19 + 1;
      assert_eq!(
         validate_frame(&data),
         Err(ProtoError::WrongDataLength { length: 26 })
      );
   }

   #[test]
   fn test_premium_default_orientation() {
      let data = frame([0x14, 0x20], 0x00, 0x82, 0x00);
      let state = decode_premium(validate_frame(&data).unwrap());
      assert!(!state.reversed);
      assert_eq!(state.left.level(), 8);
      assert_eq!(state.right.level(), 2);
      assert_eq!(state.case.unwrap().level(), 0);
      assert_eq!(state.charging, Some(ChargingState::default()));
      assert_eq!(state.in_ear, Some(InEarState::default()));
   }

   #[test]
   fn test_premium_charging_and_use_bits() {
      // left charging (bit 5), case charging (bit 6), case level 7
      // flags: bit 1 = left in ear when not reversed
      let data = frame([0x14, 0x20], 0x02, 0x9A, 0x67);
      let state = decode_premium(validate_frame(&data).unwrap());
      let charging = state.charging.unwrap();
      assert!(charging.left);
      assert!(!charging.right);
      assert!(charging.case);
      assert!(!charging.main);
      assert_eq!(state.case.unwrap().level(), 7);
      assert_eq!(state.right.level(), 10);
      let in_ear = state.in_ear.unwrap();
      assert!(in_ear.left);
      assert!(!in_ear.right);
   }

   #[test]
   fn test_main_charging_needs_both() {
      let data = frame([0x14, 0x20], 0x00, 0x55, 0x30);
      let charging = decode_premium(validate_frame(&data).unwrap()).charging.unwrap();
      assert!(charging.left && charging.right && charging.main);
   }

   #[test]
   fn test_reversed_symmetry() {
      // Toggling the reversed bit while swapping nibbles, charging bits and
      // in-ear bits describes the same physical state.
      let cases = [
         (0x00u8, 0x82u8, 0x00u8),
         (0x02, 0x9A, 0x67),
         (0x08, 0x3F, 0x15),
         (0x0A, 0xF4, 0x2A),
      ];
      for (flags, battery, charging) in cases {
         let swapped_battery = battery.rotate_left(4);
         let swapped_charging = (charging & !0x30)
            | ((charging & MASK_CHARGING_LEFT) >> 1)
            | ((charging & MASK_CHARGING_RIGHT) << 1);
         let swapped_flags = (flags & !0x0A)
            | ((flags & MASK_USING_LEFT) >> 2)
            | ((flags & MASK_USING_RIGHT) << 2)
            | FLAG_REVERSED;

         let a = frame([0x14, 0x20], flags, battery, charging);
         let b = frame(
            [0x14, 0x20],
            swapped_flags,
            swapped_battery,
            swapped_charging,
         );
         let a = decode_premium(validate_frame(&a).unwrap());
         let b = decode_premium(validate_frame(&b).unwrap());

         assert!(b.reversed);
         assert_eq!(a.left, b.left);
         assert_eq!(a.right, b.right);
         assert_eq!(a.charging, b.charging);
         assert_eq!(a.in_ear, b.in_ear);
      }
   }

   #[test]
   fn test_generic_reduced_layout() {
      let data = frame([0x05, 0x20], FLAG_REVERSED, 0x82, 0x7F);
      let state = decode_generic(validate_frame(&data).unwrap());
      assert!(state.reversed);
      assert_eq!(state.left.level(), 2);
      assert_eq!(state.right.level(), 8);
      assert!(state.case.is_none());
      assert!(state.charging.is_none());
      assert!(state.in_ear.is_none());
   }
}
