//! Headset recognition.
//!
//! Decides whether a BlueZ device is a headset worth a session, from its
//! modalias, its advertised manufacturer data, its service UUIDs, or as a
//! last resort its name and alias.

use log::debug;
use uuid::Uuid;

use crate::{
   airpods::{
      models::{self, ModelSpec},
      parser,
      protocol::{APPLE_CID, ModelCode},
   },
   error::Result,
};

/// Patterns to match headset names (case-insensitive)
const NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple vendor ID in the device-id profile
const APPLE_VID: u32 = 0x004C;

/// Apple service UUIDs, not always advertised
static APPLE_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb), // Find My
   Uuid::from_u128(0x0000fd39_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd32_0000_1000_8000_00805f9b34fb),
];

/// Model described by an Apple manufacturer-data payload.
///
/// Any well-formed proximity-pairing frame describes a headset; unknown
/// model codes resolve to the generic decoder.
pub fn headset_model(data: &[u8]) -> Result<&'static ModelSpec> {
   let frame = parser::validate_frame(data)?;
   Ok(models::lookup(ModelCode::from_frame(frame)))
}

/// Known model for a device-id product number, if any.
pub fn model_for_product(vendor: u32, product: u32) -> Option<&'static ModelSpec> {
   if vendor != APPLE_VID {
      return None;
   }
   let product = u16::try_from(product).ok()?;
   let spec = models::lookup(ModelCode::from_product_id(product));
   (!spec.is_generic()).then_some(spec)
}

fn matches_name(name: &str) -> Option<&'static str> {
   let name = name.to_ascii_lowercase();
   NAME_PATTERNS
      .iter()
      .copied()
      .find(|pattern| name.contains(pattern))
}

pub async fn is_device_headset(dev: &bluer::Device) -> bool {
   // 1. Modalias (most reliable for connected devices)
   if let Ok(Some(modalias)) = dev.modalias().await
      && let Some(spec) = model_for_product(modalias.vendor, modalias.product)
   {
      debug!(
         "{} detected via modalias: product={:#06x}",
         spec.display_name, modalias.product
      );
      return true;
   }

   // 2. Manufacturer data (advertising devices)
   if let Ok(Some(mfg_data)) = dev.manufacturer_data().await
      && let Some(apple_data) = mfg_data.get(&APPLE_CID)
      && let Ok(spec) = headset_model(apple_data)
   {
      debug!("{} detected via manufacturer data", spec.display_name);
      return true;
   }

   // 3. Service UUIDs
   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.iter().any(|u| APPLE_SERVICES.contains(u))
   {
      debug!("Headset detected via Apple service UUID");
      return true;
   }

   // 4. Last-chance name/alias pattern matching
   if let Ok(Some(name)) = dev.name().await
      && let Some(pattern) = matches_name(&name)
   {
      debug!("Headset detected via name pattern: {name} => {pattern}");
      return true;
   }
   if let Ok(alias) = dev.alias().await
      && let Some(pattern) = matches_name(&alias)
   {
      debug!("Headset detected via alias pattern: {alias} => {pattern}");
      return true;
   }
   false
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      airpods::{models::ModelId, parser::tests::frame},
      error::ServiceError,
   };

   #[test]
   fn test_headset_model_from_payload() {
      let spec = headset_model(&frame([0x0E, 0x20], 0, 0x55, 0)).unwrap();
      assert_eq!(spec.id, ModelId::AirPodsPro);

      let spec = headset_model(&frame([0x06, 0x20], 0, 0x55, 0)).unwrap();
      assert_eq!(spec.id, ModelId::Generic);

      assert!(matches!(
         headset_model(&[0x07, 0x19, 0x01]),
         Err(ServiceError::Protocol(_))
      ));
   }

   #[test]
   fn test_model_for_product() {
      assert_eq!(
         model_for_product(APPLE_VID, 0x2014).map(|s| s.id),
         Some(ModelId::AirPodsProGen2)
      );
      assert_eq!(
         model_for_product(APPLE_VID, 0x2013).map(|s| s.id),
         Some(ModelId::AirPodsGen3)
      );
      assert!(model_for_product(APPLE_VID, 0x2006).is_none());
      assert!(model_for_product(APPLE_VID, 0x1_2014).is_none());
      assert!(model_for_product(0x1234, 0x2014).is_none());
   }

   #[test]
   fn test_name_patterns() {
      assert_eq!(matches_name("Alice's AirPods Pro"), Some("airpods"));
      assert_eq!(matches_name("Powerbeats Pro"), Some("beats"));
      assert_eq!(matches_name("EarPods"), None);
   }
}
