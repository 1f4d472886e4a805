//! LE discovery loop for the monitor role.
//!
//! Runs BlueZ discovery with duplicate reporting enabled so that every
//! advertisement from the tag refreshes its RSSI, and forwards matching
//! devices as [`Sighting`]s.

use std::{collections::HashSet, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle, time, time::Instant};

use crate::{backoff::retry_delay, bluetooth, error::Result};

/// Delay before the first discovery restart
const RESTART_BASE_DELAY: Duration = Duration::from_secs(2);
/// Maximum delay between discovery restarts
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// One advertisement heard from the tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
   pub address: Address,
   pub rssi: i16,
   pub at: Instant,
}

/// Background discovery task.
pub struct Scanner {
   session: Session,
   adapter_name: Option<SmolStr>,
   target_name: SmolStr,
   tx: mpsc::Sender<Sighting>,
   matched: HashSet<Address>,
}

impl Scanner {
   pub fn spawn(
      session: Session,
      adapter_name: Option<SmolStr>,
      target_name: SmolStr,
      tx: mpsc::Sender<Sighting>,
   ) -> JoinHandle<()> {
      let scanner = Self {
         session,
         adapter_name,
         target_name,
         tx,
         matched: HashSet::new(),
      };
      tokio::spawn(scanner.run())
   }

   async fn run(mut self) {
      info!("Scanning for tag {}", self.target_name);

      let mut attempt = 0;
      loop {
         match self.discover().await {
            Ok(true) => {
               info!("Sighting channel closed, scanner stopping");
               return;
            },
            Ok(false) => {
               warn!("Discovery stream ended, restarting");
               attempt = 0;
            },
            Err(e) => {
               warn!("Discovery failed: {e}");
            },
         }

         if self.tx.is_closed() {
            return;
         }

         let delay = retry_delay(attempt, RESTART_BASE_DELAY, MAX_RESTART_DELAY);
         attempt = attempt.saturating_add(1);
         debug!("Restarting discovery in {delay:?}");
         time::sleep(delay).await;
      }
   }

   /// Runs one discovery session. Returns `Ok(true)` when the receiver is gone.
   async fn discover(&mut self) -> Result<bool> {
      let adapter = bluetooth::open_adapter(&self.session, self.adapter_name.as_deref()).await?;

      adapter
         .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
         })
         .await?;

      let events = adapter.discover_devices_with_changes().await?;
      pin_mut!(events);
      info!("Discovery running on {}", adapter.name());

      while let Some(event) = events.next().await {
         match event {
            AdapterEvent::DeviceAdded(addr) => {
               if let Some(sighting) = self.inspect(&adapter, addr).await
                  && self.tx.send(sighting).await.is_err()
               {
                  return Ok(true);
               }
            },
            AdapterEvent::DeviceRemoved(addr) => {
               if self.matched.remove(&addr) {
                  debug!("Tag {addr} removed from BlueZ cache");
               }
            },
            _ => {},
         }
      }

      Ok(false)
   }

   async fn inspect(&mut self, adapter: &Adapter, addr: Address) -> Option<Sighting> {
      let device = adapter.device(addr).ok()?;
      let name = device.name().await.ok().flatten()?;
      if !is_target(&name, &self.target_name) {
         return None;
      }
      let rssi = device.rssi().await.ok().flatten()?;

      if self.matched.insert(addr) {
         info!("Found tag {name} at {addr}");
      }
      debug!("Tag {addr} RSSI {rssi} dBm");

      Some(Sighting {
         address: addr,
         rssi,
         at: Instant::now(),
      })
   }
}

/// Names must match exactly; BlueZ may report trailing NULs from short names.
fn is_target(name: &str, target: &str) -> bool {
   name.trim_end_matches('\0') == target
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_target_match_is_exact() {
      assert!(is_target("CHILD_TAG", "CHILD_TAG"));
      assert!(is_target("CHILD_TAG\0", "CHILD_TAG"));
      assert!(!is_target("child_tag", "CHILD_TAG"));
      assert!(!is_target("CHILD_TAG_2", "CHILD_TAG"));
      assert!(!is_target("", "CHILD_TAG"));
   }
}
