//! Event handling system for tag monitoring updates.
//!
//! This module provides the event infrastructure for notifying about
//! proximity changes such as sightings, weak signal and raised alerts.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use serde::Serialize;

/// Why an alert was raised.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertReason {
   /// RSSI stayed below the threshold for too many consecutive sightings.
   WeakSignal,
   /// Nothing heard from the tag within the signal timeout.
   SignalLost,
   /// Requested by an operator to check the buzzer and push path.
   Test,
}

impl AlertReason {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   /// Human readable description used in logs.
   pub const fn describe(self) -> &'static str {
      match self {
         Self::WeakSignal => "distance exceeded (weak RSSI)",
         Self::SignalLost => "signal lost (timeout)",
         Self::Test => "manual test",
      }
   }
}

/// Events that can be emitted by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
   TagSighted { address: Address, rssi: i16 },
   SignalWeak { rssi: i16, count: u32 },
   TagLost { elapsed: Duration },
   AlertRaised(AlertReason),
   AlertCleared,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: TagEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event bus that drops everything; used when D-Bus is disabled.
pub struct NullBus;

impl EventBus for NullBus {
   fn emit(&self, _event: TagEvent) {}
}
