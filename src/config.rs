//! Configuration management for the child tag service.
//!
//! This module handles loading and saving configuration from disk. A single
//! file configures both roles: the advertising tag and the guardian monitor.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::{ChildTagError, Result};

/// Name the tag advertises and the monitor looks for.
pub const DEFAULT_TAG_NAME: &str = "CHILD_TAG";

/// Which half of the system this process runs as.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
   Tag,
   #[default]
   Monitor,
}

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
   #[serde(default)]
   pub role: Role,

   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default)]
   pub tag: TagConfig,

   #[serde(default)]
   pub monitor: MonitorConfig,

   #[serde(default)]
   pub buzzer: BuzzerConfig,

   #[serde(default)]
   pub push: PushConfig,

   #[serde(default)]
   pub dbus: DBusConfig,
}

/// Advertising parameters for the tag role.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TagConfig {
   #[serde(default = "default_tag_name")]
   pub name: SmolStr,

   /// Also rename the adapter alias so scanners resolving the name see it.
   #[serde(default = "default_true")]
   pub set_alias: bool,

   #[serde(default)]
   pub service_uuids: Vec<Uuid>,

   #[serde(default)]
   pub manufacturer_id: Option<u16>,

   /// Hex encoded manufacturer payload, sent under `manufacturer_id`.
   #[serde(default)]
   pub manufacturer_data: Option<String>,
}

/// Proximity thresholds for the monitor role.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorConfig {
   #[serde(default = "default_tag_name")]
   pub target_name: SmolStr,

   /// Sightings with RSSI strictly above this are considered near.
   #[serde(default = "default_rssi_threshold")]
   pub rssi_threshold: i16,

   #[serde(default = "default_danger_threshold")]
   pub danger_threshold: u32,

   #[serde(default = "default_signal_timeout")]
   pub signal_timeout_sec: u64,

   #[serde(default = "default_alert_duration")]
   pub alert_duration_ms: u64,

   #[serde(default = "default_tick_interval")]
   pub tick_interval_ms: u64,
}

/// Buzzer output. Without a PWM chip the buzzer only logs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BuzzerConfig {
   #[serde(default)]
   pub pwm_chip: Option<u32>,

   #[serde(default)]
   pub pwm_channel: u32,

   #[serde(default = "default_frequency")]
   pub frequency_hz: u32,

   #[serde(default = "default_duty_percent")]
   pub duty_percent: u8,

   #[serde(default = "default_sysfs_root")]
   pub sysfs_root: PathBuf,
}

/// Where the FCM access token comes from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenSource {
   /// Google service account key file, exchanged for a token via a signed JWT.
   ServiceAccount { key_path: PathBuf },
   Env { var: String },
   File { path: PathBuf },
   /// Command printing a token on stdout, e.g. `gcloud auth print-access-token`.
   Command { argv: Vec<String> },
}

impl Default for TokenSource {
   fn default() -> Self {
      Self::ServiceAccount {
         key_path: PathBuf::from("/etc/childtag/service-account.json"),
      }
   }
}

/// Firebase Cloud Messaging settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PushConfig {
   #[serde(default)]
   pub project_id: String,

   /// Registration token of the guardian's phone.
   #[serde(default)]
   pub device_token: String,

   #[serde(default = "default_push_title")]
   pub title: String,

   #[serde(default = "default_push_body")]
   pub body: String,

   #[serde(default)]
   pub token_source: TokenSource,

   #[serde(default = "default_push_retries")]
   pub retries: u32,

   #[serde(default = "default_push_timeout")]
   pub timeout_sec: u64,
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BusKind {
   #[default]
   Session,
   System,
   None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DBusConfig {
   #[serde(default)]
   pub bus: BusKind,
}

fn default_tag_name() -> SmolStr {
   SmolStr::new_static(DEFAULT_TAG_NAME)
}

const fn default_true() -> bool {
   true
}

const fn default_rssi_threshold() -> i16 {
   -75
}

const fn default_danger_threshold() -> u32 {
   5
}

const fn default_signal_timeout() -> u64 {
   10
}

const fn default_alert_duration() -> u64 {
   3000
}

const fn default_tick_interval() -> u64 {
   1000
}

const fn default_frequency() -> u32 {
   2000
}

const fn default_duty_percent() -> u8 {
   50
}

fn default_sysfs_root() -> PathBuf {
   PathBuf::from("/sys/class/pwm")
}

fn default_push_title() -> String {
   "Emergency alert".to_string()
}

fn default_push_body() -> String {
   "The child has left the safe zone! Check their location.".to_string()
}

const fn default_push_retries() -> u32 {
   3
}

const fn default_push_timeout() -> u64 {
   15
}

impl Default for TagConfig {
   fn default() -> Self {
      Self {
         name: default_tag_name(),
         set_alias: default_true(),
         service_uuids: vec![],
         manufacturer_id: None,
         manufacturer_data: None,
      }
   }
}

impl Default for MonitorConfig {
   fn default() -> Self {
      Self {
         target_name: default_tag_name(),
         rssi_threshold: default_rssi_threshold(),
         danger_threshold: default_danger_threshold(),
         signal_timeout_sec: default_signal_timeout(),
         alert_duration_ms: default_alert_duration(),
         tick_interval_ms: default_tick_interval(),
      }
   }
}

impl MonitorConfig {
   pub const fn signal_timeout(&self) -> Duration {
      Duration::from_secs(self.signal_timeout_sec)
   }

   pub const fn alert_duration(&self) -> Duration {
      Duration::from_millis(self.alert_duration_ms)
   }

   pub const fn tick_interval(&self) -> Duration {
      Duration::from_millis(self.tick_interval_ms)
   }
}

impl Default for BuzzerConfig {
   fn default() -> Self {
      Self {
         pwm_chip: None,
         pwm_channel: 0,
         frequency_hz: default_frequency(),
         duty_percent: default_duty_percent(),
         sysfs_root: default_sysfs_root(),
      }
   }
}

impl Default for PushConfig {
   fn default() -> Self {
      Self {
         project_id: String::new(),
         device_token: String::new(),
         title: default_push_title(),
         body: default_push_body(),
         token_source: TokenSource::default(),
         retries: default_push_retries(),
         timeout_sec: default_push_timeout(),
      }
   }
}

impl PushConfig {
   /// Push is only attempted when both the project and the target are known.
   pub fn is_enabled(&self) -> bool {
      !self.project_id.is_empty() && !self.device_token.is_empty()
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      let config = if path.exists() {
         let contents = fs::read_to_string(path)?;
         toml::from_str::<Self>(&contents)?
      } else {
         let config = Self::default();
         config.save_to(path)?;
         config
      };
      config.validate()?;
      Ok(config)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(childtag_home) = env::var("CHILDTAG_HOME") {
         PathBuf::from(childtag_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(ChildTagError::ConfigDirNotFound);
      };

      Ok(config_dir.join("childtag").join("config.toml"))
   }

   /// Rejects values that would make either role misbehave silently.
   pub fn validate(&self) -> Result<()> {
      if self.tag.name.trim().is_empty() {
         return Err(ChildTagError::InvalidConfig("tag.name is empty".into()));
      }
      if self.monitor.target_name.trim().is_empty() {
         return Err(ChildTagError::InvalidConfig(
            "monitor.target_name is empty".into(),
         ));
      }
      if self.monitor.danger_threshold == 0 {
         return Err(ChildTagError::InvalidConfig(
            "monitor.danger_threshold must be at least 1".into(),
         ));
      }
      if self.monitor.tick_interval_ms == 0 {
         return Err(ChildTagError::InvalidConfig(
            "monitor.tick_interval_ms must be positive".into(),
         ));
      }
      if self.buzzer.frequency_hz == 0 {
         return Err(ChildTagError::InvalidConfig(
            "buzzer.frequency_hz must be positive".into(),
         ));
      }
      if self.buzzer.duty_percent > 100 {
         return Err(ChildTagError::InvalidConfig(
            "buzzer.duty_percent must be within 0..=100".into(),
         ));
      }
      if self.tag.manufacturer_data.is_some() && self.tag.manufacturer_id.is_none() {
         return Err(ChildTagError::InvalidConfig(
            "tag.manufacturer_data requires tag.manufacturer_id".into(),
         ));
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_defaults_match_receiver_constants() {
      let config = Config::default();
      assert_eq!(config.role, Role::Monitor);
      assert_eq!(config.tag.name, "CHILD_TAG");
      assert_eq!(config.monitor.target_name, "CHILD_TAG");
      assert_eq!(config.monitor.rssi_threshold, -75);
      assert_eq!(config.monitor.danger_threshold, 5);
      assert_eq!(config.monitor.signal_timeout(), Duration::from_secs(10));
      assert_eq!(config.monitor.alert_duration(), Duration::from_secs(3));
      assert_eq!(config.buzzer.frequency_hz, 2000);
      assert!(!config.push.is_enabled());
      assert!(matches!(
         config.push.token_source,
         TokenSource::ServiceAccount { .. }
      ));
   }

   #[test]
   fn test_partial_file_fills_defaults() -> Result<()> {
      let config: Config = toml::from_str(
         r#"
            role = "tag"

            [tag]
            name = "KID_1"

            [push]
            project_id = "demo"
            device_token = "abc"
            token_source = { kind = "service_account", key_path = "/home/pi/service-account.json" }
         "#,
      )?;
      assert_eq!(config.role, Role::Tag);
      assert_eq!(config.tag.name, "KID_1");
      assert!(config.tag.set_alias);
      assert_eq!(config.monitor.danger_threshold, 5);
      assert!(config.push.is_enabled());
      assert_eq!(
         config.push.token_source,
         TokenSource::ServiceAccount {
            key_path: PathBuf::from("/home/pi/service-account.json")
         }
      );
      assert_eq!(config.dbus.bus, BusKind::Session);
      Ok(())
   }

   #[test]
   fn test_load_creates_default_file() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("childtag").join("config.toml");

      let config = Config::load_from(&path)?;
      assert!(path.exists());
      assert_eq!(config.tag.name, DEFAULT_TAG_NAME);

      let reloaded = Config::load_from(&path)?;
      assert_eq!(reloaded.monitor.rssi_threshold, config.monitor.rssi_threshold);
      Ok(())
   }

   #[test]
   fn test_save_then_load_keeps_changes() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.monitor.rssi_threshold = -60;
      config.buzzer.pwm_chip = Some(0);
      config.save_to(&path)?;

      let loaded = Config::load_from(&path)?;
      assert_eq!(loaded.monitor.rssi_threshold, -60);
      assert_eq!(loaded.buzzer.pwm_chip, Some(0));
      Ok(())
   }

   #[test]
   fn test_validate_rejects_bad_values() {
      let mut config = Config::default();
      config.tag.name = SmolStr::new_static("  ");
      assert!(matches!(
         config.validate(),
         Err(ChildTagError::InvalidConfig(_))
      ));

      let mut config = Config::default();
      config.monitor.danger_threshold = 0;
      assert!(config.validate().is_err());

      let mut config = Config::default();
      config.tag.manufacturer_data = Some("beef".into());
      assert!(config.validate().is_err());
      config.tag.manufacturer_id = Some(0xFFFF);
      assert!(config.validate().is_ok());
   }

   #[test]
   fn test_role_parses_from_argument() {
      assert_eq!("tag".parse::<Role>().ok(), Some(Role::Tag));
      assert_eq!("MONITOR".parse::<Role>().ok(), Some(Role::Monitor));
      assert!("scanner".parse::<Role>().is_err());
      assert_eq!(Role::Tag.to_string(), "tag");
   }
}
