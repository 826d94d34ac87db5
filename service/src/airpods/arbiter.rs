//! Advertiser arbitration.
//!
//! Several broadcasters of the same accessory family can be in range at
//! once (a neighbor's earbuds, for instance). The arbiter commits to one
//! advertiser per headset session: a stronger or equally strong newcomer
//! takes over, and a weaker one only once the tracked advertiser has been
//! silent for longer than the grace window.

use std::time::{Duration, Instant};

use bluer::Address;
use log::{debug, trace};

use crate::airpods::parser::{self, ProtoError};

/// Strength assigned when nothing is tracked
pub const RSSI_FLOOR: i16 = -128;
/// Silence tolerated before failing over to a weaker advertiser
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5);

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanObservation {
   pub address: Address,
   pub rssi: i16,
   pub observed_at: Instant,
   /// Apple manufacturer data, company id stripped
   pub payload: Vec<u8>,
}

/// Why an observation was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Accepted {
   /// Nothing was tracked yet
   First,
   /// Fresh reading from the tracked advertiser
   Same,
   /// Different advertiser at least as strong as the tracked one
   Stronger,
   /// Tracked advertiser went silent past the grace window
   Failover,
}

/// Why an observation was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
   Malformed(ProtoError),
   /// Weaker than the tracked advertiser, which is still fresh
   Weaker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
   Accept(Accepted),
   Reject(Rejected),
}

impl Verdict {
   pub const fn is_accepted(&self) -> bool {
      matches!(self, Self::Accept(_))
   }
}

/// Arbitration state of one headset session.
#[derive(Debug, Clone)]
pub struct Arbiter {
   current: Option<Address>,
   strength: i16,
   last_seen: Option<Instant>,
   grace: Duration,
}

impl Default for Arbiter {
   fn default() -> Self {
      Self::new(DEFAULT_GRACE_WINDOW)
   }
}

impl Arbiter {
   pub const fn new(grace: Duration) -> Self {
      Self {
         current: None,
         strength: RSSI_FLOOR,
         last_seen: None,
         grace,
      }
   }

   /// Decides whether `obs` is authoritative, updating the tracked advertiser.
   ///
   /// Malformed frames and weaker advertisers are rejected without side
   /// effects.
   pub fn consider(&mut self, obs: &ScanObservation) -> Verdict {
      if let Err(e) = parser::validate_frame(&obs.payload) {
         trace!("Dropping frame from {}: {e}", obs.address);
         return Verdict::Reject(Rejected::Malformed(e));
      }

      let Some(current) = self.current else {
         debug!("First result from {}, rssi={}", obs.address, obs.rssi);
         self.adopt(obs);
         return Verdict::Accept(Accepted::First);
      };

      if current == obs.address {
         self.last_seen = Some(obs.observed_at);
         return Verdict::Accept(Accepted::Same);
      }

      if obs.rssi >= self.strength {
         debug!("Better result from {}, rssi={}", obs.address, obs.rssi);
         self.adopt(obs);
         Verdict::Accept(Accepted::Stronger)
      } else if self.silent_for(obs.observed_at) > self.grace {
         debug!(
            "Best result gone, alternate result from {}, rssi={}",
            obs.address, obs.rssi
         );
         self.adopt(obs);
         Verdict::Accept(Accepted::Failover)
      } else {
         Verdict::Reject(Rejected::Weaker)
      }
   }

   /// Forgets the tracked advertiser.
   pub const fn reset(&mut self) {
      self.current = None;
      self.strength = RSSI_FLOOR;
      self.last_seen = None;
   }

   pub const fn current(&self) -> Option<Address> {
      self.current
   }

   pub const fn strength(&self) -> i16 {
      self.strength
   }

   pub const fn last_seen(&self) -> Option<Instant> {
      self.last_seen
   }

   fn adopt(&mut self, obs: &ScanObservation) {
      self.current = Some(obs.address);
      self.strength = obs.rssi;
      self.last_seen = Some(obs.observed_at);
   }

   fn silent_for(&self, now: Instant) -> Duration {
      self
         .last_seen
         .map_or(Duration::MAX, |seen| now.saturating_duration_since(seen))
   }
}
