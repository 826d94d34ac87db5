//! Event handling for headset battery reporting.
//!
//! This module provides the event infrastructure used by headset sessions
//! to publish battery indicators, widget updates and session lifecycle
//! changes to external sinks.

use std::sync::Arc;

use crate::airpods::{protocol::BatteryEvent, session::Headset};

/// Events that can be emitted by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadsetEvent {
   SessionStarted,
   SessionStopped,
   /// Vendor-specific battery indicator, sent for every decoded payload
   BatteryIndicator(BatteryEvent),
   /// Sent only when a charging or in-ear flag changed
   BatteryWidgetChanged(BatteryEvent),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, headset: &Headset, event: HeadsetEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
