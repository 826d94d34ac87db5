//! Known accessory models and their capabilities.
//!
//! Every model is a row in a static table keyed by its model code. Adding a
//! model means adding a row; the decoder registry never branches on model
//! identity.

use std::{collections::HashMap, sync::LazyLock};

use serde::{Deserialize, Serialize};

use crate::airpods::{
   parser,
   protocol::{AccessoryState, ModelCode, PP_PAYLOAD_LEN},
};

/// Identifier of a decoder slot.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModelId {
   AirPods,
   AirPodsGen2,
   AirPodsGen3,
   AirPodsPro,
   AirPodsProGen2,
   Generic,
}

/// Bit layout of the payload body from the flags byte onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
   /// Battery, case, charging and in-ear bits
   Premium,
   /// Left/right battery only
   Generic,
}

/// Icon resource names for the main device and its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IconSet {
   pub main: &'static str,
   pub left: &'static str,
   pub right: &'static str,
   pub case: &'static str,
}

impl IconSet {
   const fn named(
      main: &'static str,
      left: &'static str,
      right: &'static str,
      case: &'static str,
   ) -> Self {
      Self {
         main,
         left,
         right,
         case,
      }
   }
}

/// Static description of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
   pub id: ModelId,
   /// Model code digits, `None` for the fallback
   pub code: Option<&'static str>,
   pub display_name: &'static str,
   /// Value written to the model-name metadata field
   pub model_name: &'static str,
   pub layout: Layout,
   pub icons: Option<IconSet>,
}

impl ModelSpec {
   pub fn decode(&self, frame: &[u8; PP_PAYLOAD_LEN]) -> AccessoryState {
      match self.layout {
         Layout::Premium => parser::decode_premium(frame),
         Layout::Generic => parser::decode_generic(frame),
      }
   }

   pub const fn is_generic(&self) -> bool {
      matches!(self.layout, Layout::Generic)
   }
}

const AIRPODS_ICONS: IconSet =
   IconSet::named("airpods", "airpods_left", "airpods_right", "airpods_case");
const AIRPODS_GEN3_ICONS: IconSet = IconSet::named(
   "airpods_gen3",
   "airpods_gen3_left",
   "airpods_gen3_right",
   "airpods_gen3_case",
);
const AIRPODS_PRO_ICONS: IconSet = IconSet::named(
   "airpods_pro",
   "airpods_pro_left",
   "airpods_pro_right",
   "airpods_pro_case",
);

pub static GENERIC: ModelSpec = ModelSpec {
   id: ModelId::Generic,
   code: None,
   display_name: "Generic",
   model_name: "",
   layout: Layout::Generic,
   icons: None,
};

/// All fully known models.
///
/// Families that need more discrimination bits than the two code bytes
/// (`AirPods` Max, Powerbeats Pro, Beats Studio) are not listed and fall
/// back to [`GENERIC`].
pub static MODELS: [ModelSpec; 5] = [
   ModelSpec {
      id: ModelId::AirPods,
      code: Some("0220"),
      display_name: "AirPods",
      model_name: "AirPods",
      layout: Layout::Premium,
      icons: Some(AIRPODS_ICONS),
   },
   ModelSpec {
      id: ModelId::AirPodsGen2,
      code: Some("01520"),
      display_name: "AirPods (2nd generation)",
      model_name: "AirPods",
      layout: Layout::Premium,
      icons: Some(AIRPODS_ICONS),
   },
   ModelSpec {
      id: ModelId::AirPodsGen3,
      code: Some("1320"),
      display_name: "AirPods (3rd generation)",
      model_name: "AirPods",
      layout: Layout::Premium,
      icons: Some(AIRPODS_GEN3_ICONS),
   },
   ModelSpec {
      id: ModelId::AirPodsPro,
      code: Some("01420"),
      display_name: "AirPods Pro",
      model_name: "AirPods Pro",
      layout: Layout::Premium,
      icons: Some(AIRPODS_PRO_ICONS),
   },
   ModelSpec {
      id: ModelId::AirPodsProGen2,
      code: Some("1420"),
      display_name: "AirPods Pro (2nd generation)",
      model_name: "AirPods Pro",
      layout: Layout::Premium,
      icons: Some(AIRPODS_PRO_ICONS),
   },
];

static BY_CODE: LazyLock<HashMap<&'static str, &'static ModelSpec>> = LazyLock::new(|| {
   MODELS
      .iter()
      .filter_map(|spec| spec.code.map(|code| (code, spec)))
      .collect()
});

/// Finds the decoder for a model code by exact digit match.
pub fn lookup(code: ModelCode) -> &'static ModelSpec {
   BY_CODE.get(code.digits().as_str()).copied().unwrap_or(&GENERIC)
}

impl ModelId {
   pub fn spec(self) -> &'static ModelSpec {
      MODELS
         .iter()
         .find(|spec| spec.id == self)
         .unwrap_or(&GENERIC)
   }
}
