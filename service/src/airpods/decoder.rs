//! Model decoder registry.
//!
//! Classifies an accepted payload by model code, runs the model's layout
//! decoder, and diffs the resulting snapshot against the previous snapshot
//! of the same model. Each model keeps its own snapshot and metadata
//! bookkeeping; nothing is shared across models or sessions.

use std::collections::HashMap;

use log::{debug, info};

use crate::airpods::{
   metadata::{MetadataSync, SyncContext},
   models::{self, ModelId, ModelSpec},
   parser::{self, ProtoError},
   protocol::{AccessoryState, BatteryEvent, ChangeSet, ModelCode},
};

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
   pub model: ModelId,
   pub code: ModelCode,
   pub state: AccessoryState,
   pub changes: ChangeSet,
}

impl Decoded {
   /// True when any watched boolean field changed since the last decode.
   pub const fn changed(&self) -> bool {
      !self.changes.is_empty()
   }

   pub fn spec(&self) -> &'static ModelSpec {
      self.model.spec()
   }

   /// Headline battery event arguments.
   pub fn arguments(&self) -> BatteryEvent {
      self.state.battery_event()
   }
}

/// Per-model decoder state: uninitialized until the first decode.
#[derive(Debug, Default)]
struct ModelSlot {
   last: Option<AccessoryState>,
   metadata: MetadataSync,
}

#[derive(Debug, Default)]
pub struct DecoderRegistry {
   current: Option<ModelId>,
   slots: HashMap<ModelId, ModelSlot>,
}

impl DecoderRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Validates, classifies and decodes a payload.
   ///
   /// Fails without touching any state if the frame is malformed.
   pub fn classify_and_decode(&mut self, payload: &[u8]) -> Result<Decoded, ProtoError> {
      let frame = parser::validate_frame(payload)?;
      let code = ModelCode::from_frame(frame);
      let spec = models::lookup(code);

      if self.current != Some(spec.id) {
         info!("Detected model {} (code {code})", spec.display_name);
         self.current = Some(spec.id);
      }

      let state = spec.decode(frame);
      let slot = self.slots.entry(spec.id).or_default();
      let changes = ChangeSet::between(slot.last.as_ref(), &state);
      slot.last = Some(state);

      if !changes.is_empty() {
         debug!("{} state changed ({changes}): {state}", spec.display_name);
      }

      Ok(Decoded {
         model: spec.id,
         code,
         state,
         changes,
      })
   }

   /// Model of the most recently decoded payload.
   pub const fn current_model(&self) -> Option<ModelId> {
      self.current
   }

   /// Latest snapshot of the current model.
   pub fn current_state(&self) -> Option<&AccessoryState> {
      let slot = self.slots.get(&self.current?)?;
      slot.last.as_ref()
   }

   /// Headline battery event for the current model, if any payload was decoded.
   pub fn arguments(&self) -> Option<BatteryEvent> {
      self.current_state().map(AccessoryState::battery_event)
   }

   /// Mirrors the current model's snapshot into the metadata store.
   pub fn sync_metadata(&mut self, ctx: &SyncContext<'_>) -> usize {
      let Some(id) = self.current else {
         return 0;
      };
      let Some(slot) = self.slots.get_mut(&id) else {
         return 0;
      };
      let Some(state) = slot.last else {
         return 0;
      };
      slot.metadata.sync(id.spec(), &state, ctx)
   }

   /// Drops every snapshot, returning all models to uninitialized.
   pub fn clear(&mut self) {
      self.current = None;
      self.slots.clear();
   }
}
