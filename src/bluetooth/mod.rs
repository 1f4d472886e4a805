//! Bluetooth layer for the child tag.
//!
//! This module provides LE advertising for the tag role and LE discovery for
//! the monitor role, both on top of BlueZ.

use log::{info, warn};

use crate::error::{ChildTagError, Result};

pub mod beacon;
pub mod scanner;

/// Opens the configured adapter, or the default one, and makes sure it is powered.
pub async fn open_adapter(session: &bluer::Session, name: Option<&str>) -> Result<bluer::Adapter> {
   let adapter = match name {
      Some(name) => session
         .adapter(name)
         .map_err(|_| ChildTagError::AdapterNotFound)?,
      None => session
         .default_adapter()
         .await
         .map_err(|_| ChildTagError::AdapterNotFound)?,
   };

   if !adapter.is_powered().await? {
      if let Err(e) = adapter.set_powered(true).await {
         warn!("Failed to power on adapter {}: {e}", adapter.name());
         return Err(e.into());
      }
      info!("Powered on adapter: {}", adapter.name());
   }

   Ok(adapter)
}
