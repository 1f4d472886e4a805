//! Child tag beacon and proximity guardian service
//!
//! In the `tag` role this service advertises the device as `CHILD_TAG` over
//! Bluetooth LE. In the `monitor` role it scans for that tag, sounds a buzzer
//! and pushes an emergency notification when the tag drifts out of range.

use std::{env, time::Duration};

use log::{info, warn};
use tokio::{signal, time};
use zbus::connection;

use bluetooth::{beacon::Beacon, scanner::Scanner};
use config::{BusKind, Config, Role};
use dbus::EventProcessor;
use monitor::MonitorHandle;

mod alarm;
mod backoff;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod monitor;

use crate::error::{ChildTagError, Result};

/// Sighting channel buffer size
const SIGHTING_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let mut config = Config::load()?;
   if let Some(arg) = env::args().nth(1) {
      config.role = arg
         .parse::<Role>()
         .map_err(|_| ChildTagError::UnknownRole(arg))?;
   }

   info!("Starting childtagd in {} role", config.role);

   let session = bluer::Session::new().await?;
   match config.role {
      Role::Tag => run_tag(&session, &config).await,
      Role::Monitor => run_monitor(session, config).await,
   }
}

async fn run_tag(session: &bluer::Session, config: &Config) -> Result<()> {
   let beacon = Beacon::start(session, config.adapter.as_deref(), &config.tag).await?;

   // Nothing else to do; BlueZ keeps advertising while the handle lives.
   signal::ctrl_c().await?;
   info!("Shutting down tag {}...", beacon.name());
   beacon.stop().await
}

async fn run_monitor(session: bluer::Session, config: Config) -> Result<()> {
   let buzzer = alarm::buzzer::open(config.buzzer.clone()).await?;
   let push = alarm::push::PushSender::new(&config.push);

   let event_bus = EventProcessor::new();
   let event_tx = dbus::event_sender(config.dbus.bus, &event_bus);

   let (sighting_tx, sighting_rx) = tokio::sync::mpsc::channel(SIGHTING_BUFFER_SIZE);
   let (monitor, monitor_task) =
      MonitorHandle::spawn(&config.monitor, sighting_rx, buzzer, push, event_tx);
   let scanner_task = Scanner::spawn(
      session,
      config.adapter.clone(),
      config.monitor.target_name.clone(),
      sighting_tx,
   );

   // Keep the connection alive until shutdown.
   let _connection = match config.dbus.bus {
      BusKind::None => None,
      bus => {
         let builder = match bus {
            BusKind::System => connection::Builder::system()?,
            _ => connection::Builder::session()?,
         };
         let connection =
            dbus::connect(builder.name(dbus::SERVICE_NAME)?, monitor.clone(), event_bus).await?;
         info!("D-Bus interface started at {} on the {bus} bus", dbus::SERVICE_NAME);
         Some(connection)
      },
   };

   signal::ctrl_c().await?;
   info!("Shutting down monitor...");

   scanner_task.abort();
   drop(monitor);
   if time::timeout(Duration::from_secs(2), monitor_task).await.is_err() {
      warn!("Monitor did not stop in time");
   }

   Ok(())
}
