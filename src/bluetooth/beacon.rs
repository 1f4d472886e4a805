//! LE advertiser for the tag role.
//!
//! The tag does nothing but announce itself under its configured name; all
//! proximity logic lives on the monitor side.

use std::collections::{BTreeMap, BTreeSet};

use bluer::{
   Adapter, Session,
   adv::{Advertisement, AdvertisementHandle, Type},
};
use log::{debug, info};

use crate::{
   bluetooth,
   config::TagConfig,
   error::{ChildTagError, Result},
};

/// An active advertisement. Dropping it withdraws the advertisement.
pub struct Beacon {
   adapter: Adapter,
   name: String,
   handle: AdvertisementHandle,
   /// Alias to put back on stop, when we replaced it.
   previous_alias: Option<String>,
}

/// The tag name as it goes on air.
fn advertised_name(config: &TagConfig) -> Result<&str> {
   let name = config.name.trim();
   if name.is_empty() {
      return Err(ChildTagError::InvalidConfig("tag name is empty".into()));
   }
   Ok(name)
}

impl Beacon {
   /// Builds the advertisement payload for the given tag settings.
   pub fn advertisement(config: &TagConfig) -> Result<Advertisement> {
      let name = advertised_name(config)?;

      let mut manufacturer_data = BTreeMap::new();
      if let Some(id) = config.manufacturer_id {
         let payload = match &config.manufacturer_data {
            Some(data) => hex::decode(data.trim()).map_err(|e| {
               ChildTagError::InvalidConfig(format!("tag.manufacturer_data: {e}"))
            })?,
            None => Vec::new(),
         };
         manufacturer_data.insert(id, payload);
      }

      Ok(Advertisement {
         advertisement_type: Type::Peripheral,
         local_name: Some(name.to_string()),
         discoverable: Some(true),
         service_uuids: config.service_uuids.iter().copied().collect::<BTreeSet<_>>(),
         manufacturer_data,
         ..Default::default()
      })
   }

   /// Powers the adapter and starts advertising.
   pub async fn start(session: &Session, adapter: Option<&str>, config: &TagConfig) -> Result<Self> {
      let name = advertised_name(config)?.to_string();
      let advertisement = Self::advertisement(config)?;
      let adapter = bluetooth::open_adapter(session, adapter).await?;

      let mut previous_alias = None;
      if config.set_alias {
         let alias = adapter.alias().await?;
         if alias != name {
            adapter.set_alias(name.clone()).await?;
            previous_alias = Some(alias);
         }
      }

      let handle = adapter.advertise(advertisement).await?;
      info!(
         "Advertising started as {name} on {} ({})",
         adapter.name(),
         adapter.address().await?
      );

      Ok(Self {
         adapter,
         name,
         handle,
         previous_alias,
      })
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   /// Withdraws the advertisement and restores the adapter alias.
   pub async fn stop(self) -> Result<()> {
      drop(self.handle);
      info!("Advertising stopped on {}", self.adapter.name());

      if let Some(alias) = self.previous_alias {
         debug!("Restoring adapter alias {alias}");
         self.adapter.set_alias(alias).await?;
      }
      Ok(())
   }
}
