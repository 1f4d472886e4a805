//! Proximity decision logic.
//!
//! [`ProximityTracker`] turns tag sightings and periodic ticks into buzzer,
//! push and event actions. It owns no I/O, so every rule can be driven with
//! synthetic timestamps.

use std::time::Duration;

use bluer::Address;
use heapless::HistoryBuffer;
use serde_json::json;
use tokio::time::Instant;

use crate::{
   config::MonitorConfig,
   event::{AlertReason, TagEvent},
};

/// Number of recent RSSI samples kept for status reporting
const RSSI_HISTORY_SIZE: usize = 16;

/// Side effects requested by the tracker, in the order they should run.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
   BuzzerOn,
   BuzzerOff,
   Push(AlertReason),
   Emit(TagEvent),
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
   pub rssi: i16,
   pub danger_count: u32,
   pub signal_timeout: Duration,
   pub alert_duration: Duration,
}

impl From<&MonitorConfig> for Thresholds {
   fn from(config: &MonitorConfig) -> Self {
      Self {
         rssi: config.rssi_threshold,
         danger_count: config.danger_threshold,
         signal_timeout: config.signal_timeout(),
         alert_duration: config.alert_duration(),
      }
   }
}

/// Per-tag proximity state.
pub struct ProximityTracker {
   thresholds: Thresholds,
   address: Option<Address>,
   last_seen: Option<Instant>,
   weak_count: u32,
   alert: Option<AlertReason>,
   buzzer_until: Option<Instant>,
   lost_reported: bool,
   history: HistoryBuffer<i16, RSSI_HISTORY_SIZE>,
   alerts_raised: u64,
}

impl ProximityTracker {
   pub fn new(thresholds: Thresholds) -> Self {
      Self {
         thresholds,
         address: None,
         last_seen: None,
         weak_count: 0,
         alert: None,
         buzzer_until: None,
         lost_reported: false,
         history: HistoryBuffer::new(),
         alerts_raised: 0,
      }
   }

   /// Handles one advertisement from the tag.
   pub fn observe(&mut self, address: Address, rssi: i16, now: Instant) -> Vec<Action> {
      let mut actions = vec![Action::Emit(TagEvent::TagSighted { address, rssi })];

      self.address = Some(address);
      self.last_seen = Some(now);
      self.lost_reported = false;
      self.history.write(rssi);

      if rssi > self.thresholds.rssi {
         self.weak_count = 0;
         if self.buzzer_until.take().is_some() {
            actions.push(Action::BuzzerOff);
         }
         if self.alert.take().is_some() {
            actions.push(Action::Emit(TagEvent::AlertCleared));
         }
      } else {
         self.weak_count = self.weak_count.saturating_add(1);
         actions.push(Action::Emit(TagEvent::SignalWeak {
            rssi,
            count: self.weak_count,
         }));
         if self.weak_count >= self.thresholds.danger_count && self.alert.is_none() {
            self.raise(AlertReason::WeakSignal, now, &mut actions);
         }
      }

      actions
   }

   /// Periodic check for signal loss and buzzer expiry.
   pub fn tick(&mut self, now: Instant) -> Vec<Action> {
      let mut actions = Vec::new();

      if let Some(last_seen) = self.last_seen {
         let elapsed = now.saturating_duration_since(last_seen);
         if elapsed > self.thresholds.signal_timeout {
            if !self.lost_reported {
               self.lost_reported = true;
               actions.push(Action::Emit(TagEvent::TagLost { elapsed }));
            }
            if self.alert.is_none() {
               self.raise(AlertReason::SignalLost, now, &mut actions);
            }
         }
      }

      if let Some(until) = self.buzzer_until
         && now >= until
      {
         self.buzzer_until = None;
         actions.push(Action::BuzzerOff);
      }

      actions
   }

   /// Stops the buzzer without clearing the alert.
   pub fn silence(&mut self) -> Vec<Action> {
      if self.buzzer_until.take().is_some() {
         vec![Action::BuzzerOff]
      } else {
         Vec::new()
      }
   }

   /// Sounds the buzzer and sends a push without touching the alert latch.
   pub fn test_alert(&mut self, now: Instant) -> Vec<Action> {
      self.buzzer_until = Some(now + self.thresholds.alert_duration);
      vec![
         Action::BuzzerOn,
         Action::Push(AlertReason::Test),
         Action::Emit(TagEvent::AlertRaised(AlertReason::Test)),
      ]
   }

   fn raise(&mut self, reason: AlertReason, now: Instant, actions: &mut Vec<Action>) {
      self.alert = Some(reason);
      self.alerts_raised += 1;
      self.buzzer_until = Some(now + self.thresholds.alert_duration);
      actions.push(Action::BuzzerOn);
      actions.push(Action::Push(reason));
      actions.push(Action::Emit(TagEvent::AlertRaised(reason)));
   }

   pub const fn alert(&self) -> Option<AlertReason> {
      self.alert
   }

   pub const fn is_buzzing(&self) -> bool {
      self.buzzer_until.is_some()
   }

   pub const fn weak_count(&self) -> u32 {
      self.weak_count
   }

   pub fn last_rssi(&self) -> Option<i16> {
      self.history.recent().copied()
   }

   /// JSON snapshot for D-Bus consumers.
   pub fn to_json(&self, now: Instant) -> serde_json::Value {
      json!({
         "address": self.address.map(|a| a.to_string()),
         "seen": self.last_seen.is_some(),
         "seconds_since_seen": self
            .last_seen
            .map(|t| now.saturating_duration_since(t).as_secs()),
         "last_rssi": self.last_rssi(),
         "rssi_history": self.history.oldest_ordered().copied().collect::<Vec<_>>(),
         "weak_count": self.weak_count,
         "alert": self.alert.map(AlertReason::to_str),
         "buzzing": self.is_buzzing(),
         "alerts_raised": self.alerts_raised,
      })
   }
}
