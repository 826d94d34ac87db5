//! Headset sessions.
//!
//! A session is the context object for one connected headset: it owns the
//! arbiter, the decoder registry and the identity that emitted events are
//! attributed to. Sessions never share state, so several headsets can be
//! tracked at once.

use std::time::{Duration, Instant};

use bluer::Address;
use log::{debug, trace, warn};
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   airpods::{
      arbiter::{Arbiter, Rejected, ScanObservation, Verdict},
      decoder::{Decoded, DecoderRegistry},
      metadata::{SharedStore, SyncContext},
   },
   config::Config,
   event::{EventBus, HeadsetEvent},
};

/// The connected headset device that events are attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headset {
   pub address: Address,
   pub name: SmolStr,
}

impl Headset {
   pub fn new(address: Address, name: impl Into<SmolStr>) -> Self {
      Self {
         address,
         name: name.into(),
      }
   }
}

/// Tunables of a session, derived from the configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
   pub grace_window: Duration,
   pub icon_base_uri: SmolStr,
   pub low_battery_threshold: u8,
}

impl SessionOptions {
   pub fn from_config(config: &Config) -> Self {
      Self {
         grace_window: Duration::from_millis(config.grace_window_ms),
         icon_base_uri: config.icon_base_uri.clone(),
         low_battery_threshold: config.low_battery_threshold,
      }
   }
}

impl Default for SessionOptions {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionStats {
   accepted: u64,
   rejected: u64,
   malformed: u64,
   changes: u64,
}

pub struct HeadsetSession {
   headset: Headset,
   arbiter: Arbiter,
   registry: DecoderRegistry,
   store: Option<SharedStore>,
   options: SessionOptions,
   stats: SessionStats,
   started_at: Instant,
}

impl HeadsetSession {
   pub fn new(headset: Headset, options: SessionOptions, store: Option<SharedStore>) -> Self {
      Self {
         headset,
         arbiter: Arbiter::new(options.grace_window),
         registry: DecoderRegistry::new(),
         store,
         options,
         stats: SessionStats::default(),
         started_at: Instant::now(),
      }
   }

   pub const fn headset(&self) -> &Headset {
      &self.headset
   }

   /// Runs one observation through arbitration and decoding.
   ///
   /// On acceptance the battery indicator is always emitted; the widget
   /// notification follows only when a watched flag changed. Returns the
   /// decoded payload, or `None` if the observation was dropped.
   pub fn handle(&mut self, obs: &ScanObservation, events: &dyn EventBus) -> Option<Decoded> {
      match self.arbiter.consider(obs) {
         Verdict::Accept(reason) => {
            trace!("{}: accepted {} ({reason})", self.headset.address, obs.address);
            self.stats.accepted += 1;
         },
         Verdict::Reject(Rejected::Weaker) => {
            self.stats.rejected += 1;
            return None;
         },
         Verdict::Reject(Rejected::Malformed(_)) => {
            self.stats.malformed += 1;
            return None;
         },
      }

      let decoded = match self.registry.classify_and_decode(&obs.payload) {
         Ok(decoded) => decoded,
         Err(e) => {
            debug!("Failed to decode payload from {}: {e}", obs.address);
            return None;
         },
      };

      let event = decoded.arguments();
      events.emit(&self.headset, HeadsetEvent::BatteryIndicator(event.clone()));

      self.sync_metadata();

      if decoded.changed() {
         self.stats.changes += 1;
         events.emit(&self.headset, HeadsetEvent::BatteryWidgetChanged(event));
      }

      Some(decoded)
   }

   /// Processes a batch in delivery order. Returns the number decoded.
   pub fn handle_batch(&mut self, batch: &[ScanObservation], events: &dyn EventBus) -> usize {
      batch
         .iter()
         .filter(|obs| self.handle(obs, events).is_some())
         .count()
   }

   /// Clears arbitration and decoder state, as on scan stop.
   pub fn reset(&mut self) {
      debug!("Resetting session for {}", self.headset.address);
      self.arbiter.reset();
      self.registry.clear();
   }

   fn sync_metadata(&mut self) {
      let Some(store) = &self.store else {
         trace!("No metadata store, skipping sync");
         return;
      };
      let ctx = SyncContext {
         store: store.as_ref(),
         device: self.headset.address,
         icon_base_uri: &self.options.icon_base_uri,
         low_battery_threshold: self.options.low_battery_threshold,
      };
      let writes = self.registry.sync_metadata(&ctx);
      if writes > 0 {
         debug!("Wrote {writes} metadata fields for {}", self.headset.address);
      }
   }

   pub fn snapshot(&self) -> serde_json::Value {
      let model = self.registry.current_model().map(|id| id.spec().display_name);
      json!({
          "address": self.headset.address.to_string(),
          "name": self.headset.name.as_str(),
          "advertiser": self.arbiter.current().map(|a| a.to_string()),
          "advertiser_rssi": self.arbiter.current().map(|_| self.arbiter.strength()),
          "advertiser_age_ms": self.arbiter.last_seen().map(|t| t.elapsed().as_millis() as u64),
          "model": model,
          "state": self.registry.current_state().map(|s| s.to_json()),
          "battery_event": self.registry.arguments().map(|e| e.to_json()),
          "accepted": self.stats.accepted,
          "rejected": self.stats.rejected,
          "malformed": self.stats.malformed,
          "state_changes": self.stats.changes,
          "uptime_sec": self.started_at.elapsed().as_secs(),
          "metadata": self.metadata_json(),
      })
   }

   fn metadata_json(&self) -> serde_json::Value {
      let Some(store) = &self.store else {
         return serde_json::Value::Null;
      };
      match store.entries(self.headset.address) {
         Ok(entries) => entries
            .into_iter()
            .map(|(key, value)| {
               let name: &'static str = key.into();
               let value = String::from_utf8_lossy(&value).into_owned();
               (name.to_owned(), serde_json::Value::String(value))
            })
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into(),
         Err(e) => {
            warn!("Failed to read metadata for {}: {e}", self.headset.address);
            serde_json::Value::Null
         },
      }
   }
}
