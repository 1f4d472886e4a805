//! D-Bus surface of the monitor.
//!
//! Exposes the monitor actor as `org.childtag.Monitor` and forwards every
//! [`TagEvent`] as a signal. The forwarding queue is filled from the actor
//! without awaiting, so a slow bus never stalls proximity tracking.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{sync::Notify, time};
use zbus::{
   Connection, connection, interface,
   object_server::{InterfaceRef, SignalEmitter},
};

use crate::{
   config::BusKind,
   error::Result,
   event::{EventBus, EventSender, NullBus, TagEvent},
   monitor::MonitorHandle,
};

pub const SERVICE_NAME: &str = "org.childtag";
pub const OBJECT_PATH: &str = "/org/childtag/monitor";
pub const INTERFACE_NAME: &str = "org.childtag.Monitor";

pub struct ChildTagService {
   monitor: MonitorHandle,
}

impl ChildTagService {
   pub const fn new(monitor: MonitorHandle) -> Self {
      Self { monitor }
   }
}

#[interface(name = "org.childtag.Monitor")]
impl ChildTagService {
   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let status = self
         .monitor
         .status()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(status.to_string())
   }

   async fn silence(&self) -> zbus::fdo::Result<bool> {
      self
         .monitor
         .silence()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn test_alert(&self) -> zbus::fdo::Result<bool> {
      self
         .monitor
         .test_alert()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn tag_sighted(
      emitter: &SignalEmitter<'_>,
      address: &str,
      rssi: i16,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn signal_weak(emitter: &SignalEmitter<'_>, rssi: i16, count: u32)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn tag_lost(emitter: &SignalEmitter<'_>, seconds: u64) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn alert_raised(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn alert_cleared(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property(emits_changed_signal = "false"))]
   async fn status(&self) -> String {
      self.get_status().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn alert_active(&self) -> bool {
      self.monitor.alert_active().await.unwrap_or_default()
   }
}

/// Serves `monitor` on the connection `builder` produces and starts forwarding
/// events from `events` as signals.
pub async fn connect(
   builder: connection::Builder<'_>,
   monitor: MonitorHandle,
   events: Arc<EventProcessor>,
) -> Result<Connection> {
   let connection = builder
      .serve_at(OBJECT_PATH, ChildTagService::new(monitor))?
      .build()
      .await?;
   events.spawn_dispatcher(connection.clone()).await?;
   Ok(connection)
}

/// Where the monitor should send its events for the configured bus.
pub fn event_sender(bus: BusKind, events: &Arc<EventProcessor>) -> EventSender {
   match bus {
      BusKind::None => {
         info!("D-Bus interface disabled");
         Arc::new(NullBus)
      },
      _ => events.clone(),
   }
}

pub struct EventProcessor {
   queue: SegQueue<TagEvent>,
   notifier: Notify,
}

impl EventProcessor {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<TagEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         // Wakes up now and then to notice the last emitter going away.
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<ChildTagService>, event: TagEvent) -> Result<()> {
      match event {
         TagEvent::TagSighted { address, rssi } => {
            iface.tag_sighted(&address.to_string(), rssi).await?;
         },
         TagEvent::SignalWeak { rssi, count } => {
            iface.signal_weak(rssi, count).await?;
         },
         TagEvent::TagLost { elapsed } => {
            iface.tag_lost(elapsed.as_secs()).await?;
         },
         TagEvent::AlertRaised(reason) => {
            iface.alert_raised(reason.to_str()).await?;
            iface
               .get()
               .await
               .alert_active_changed(iface.signal_emitter())
               .await?;
         },
         TagEvent::AlertCleared => {
            iface.alert_cleared().await?;
            iface
               .get()
               .await
               .alert_active_changed(iface.signal_emitter())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ChildTagService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: TagEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
