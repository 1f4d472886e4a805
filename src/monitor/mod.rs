//! Guardian side of the child tag.
//!
//! The monitor actor owns the proximity tracker and all alert outputs. It is
//! fed by the scanner and queried through a [`MonitorHandle`].

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant, MissedTickBehavior},
};

use crate::{
   alarm::{buzzer::Buzzer, push::PushSender},
   bluetooth::scanner::Sighting,
   config::MonitorConfig,
   error::{ChildTagError, Result},
   event::{EventSender, TagEvent},
};

pub mod proximity;

use proximity::{Action, ProximityTracker, Thresholds};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

#[derive(Debug)]
enum MonitorCommand {
   GetStatus(oneshot::Sender<serde_json::Value>),
   IsAlertActive(oneshot::Sender<bool>),
   Silence(oneshot::Sender<bool>),
   TestAlert(oneshot::Sender<()>),
}

/// Handle to a running monitor actor. This type is cheaply cloneable.
#[derive(Clone)]
pub struct MonitorHandle {
   inbox: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
   /// Starts the actor. It stops when the sighting channel closes or every
   /// handle is dropped.
   pub fn spawn(
      config: &MonitorConfig,
      sightings: mpsc::Receiver<Sighting>,
      buzzer: Box<dyn Buzzer>,
      push: Option<PushSender>,
      event_tx: EventSender,
   ) -> (Self, JoinHandle<()>) {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = MonitorActor {
         tracker: ProximityTracker::new(Thresholds::from(config)),
         tick_interval: config.tick_interval(),
         buzzer,
         push,
         event_tx,
         sightings,
         command_rx,
      };
      let handle = tokio::spawn(actor.run());
      (Self { inbox: command_tx }, handle)
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> MonitorCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| ChildTagError::ManagerShutdown)?;
      rx.await.map_err(|_| ChildTagError::ManagerShutdown)
   }

   pub async fn status(&self) -> Result<serde_json::Value> {
      self.request(MonitorCommand::GetStatus).await
   }

   pub async fn alert_active(&self) -> Result<bool> {
      self.request(MonitorCommand::IsAlertActive).await
   }

   /// Stops the buzzer; returns whether it was sounding.
   pub async fn silence(&self) -> Result<bool> {
      self.request(MonitorCommand::Silence).await
   }

   pub async fn test_alert(&self) -> Result<()> {
      self.request(MonitorCommand::TestAlert).await
   }
}

struct MonitorActor {
   tracker: ProximityTracker,
   tick_interval: std::time::Duration,
   buzzer: Box<dyn Buzzer>,
   push: Option<PushSender>,
   event_tx: EventSender,
   sightings: mpsc::Receiver<Sighting>,
   command_rx: mpsc::Receiver<MonitorCommand>,
}

impl MonitorActor {
   async fn run(mut self) {
      info!("Monitor started, no alerts until the tag is first seen");

      let mut tick = time::interval(self.tick_interval);
      tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = tick.tick() => {
                 let actions = self.tracker.tick(Instant::now());
                 self.apply(actions);
             }
             sighting = self.sightings.recv() => {
                 let Some(sighting) = sighting else {
                     info!("Scanner gone, monitor shutting down");
                     break;
                 };
                 let actions = self.tracker.observe(sighting.address, sighting.rssi, sighting.at);
                 self.apply(actions);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Monitor shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
         }
      }

      if let Err(e) = self.buzzer.off() {
         warn!("Failed to silence buzzer: {e}");
      }
   }

   fn handle_command(&mut self, cmd: MonitorCommand) {
      match cmd {
         MonitorCommand::GetStatus(reply) => {
            let _ = reply.send(self.tracker.to_json(Instant::now()));
         },
         MonitorCommand::IsAlertActive(reply) => {
            let _ = reply.send(self.tracker.alert().is_some());
         },
         MonitorCommand::Silence(reply) => {
            let actions = self.tracker.silence();
            let was_buzzing = !actions.is_empty();
            if was_buzzing {
               info!("Buzzer silenced by request");
            }
            self.apply(actions);
            let _ = reply.send(was_buzzing);
         },
         MonitorCommand::TestAlert(reply) => {
            let actions = self.tracker.test_alert(Instant::now());
            self.apply(actions);
            let _ = reply.send(());
         },
      }
   }

   fn apply(&mut self, actions: Vec<Action>) {
      for action in actions {
         match action {
            Action::BuzzerOn => {
               if let Err(e) = self.buzzer.on() {
                  warn!("Failed to start buzzer: {e}");
               }
            },
            Action::BuzzerOff => {
               if let Err(e) = self.buzzer.off() {
                  warn!("Failed to stop buzzer: {e}");
               }
            },
            Action::Push(reason) => match &self.push {
               Some(push) => {
                  push.spawn(reason);
               },
               None => debug!("Push skipped for {reason}, not configured"),
            },
            Action::Emit(event) => {
               log_event(&event);
               self.event_tx.emit(event);
            },
         }
      }
   }
}

fn log_event(event: &TagEvent) {
   match event {
      TagEvent::TagSighted { address, rssi } => debug!("Tag {address} RSSI: {rssi} dBm"),
      TagEvent::SignalWeak { rssi, count } => {
         info!("Distance warning: RSSI {rssi} dBm ({count} in a row)");
      },
      TagEvent::TagLost { elapsed } => {
         warn!("Signal lost! ({}s since last sighting)", elapsed.as_secs());
      },
      TagEvent::AlertRaised(reason) => warn!("Alert: {}", reason.describe()),
      TagEvent::AlertCleared => info!("Tag back in range, alert cleared"),
   }
}
