//! Error types for the child tag service.
//!
//! This module defines all error types that can occur while advertising as a
//! tag or monitoring one, including Bluetooth, D-Bus, I/O, configuration and
//! push delivery errors.

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for the child tag service.
#[derive(Error, Debug)]
pub enum ChildTagError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("HTTP error: {0}")]
   Http(#[from] Box<ureq::Error>),

   #[error("Push rejected with status {status}: {body}")]
   PushRejected { status: u16, body: String },

   #[error("JWT signing error: {0}")]
   Jwt(#[from] jsonwebtoken::errors::Error),

   #[error("Access token unavailable: {0}")]
   AccessToken(String),

   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   #[error("Unknown role: {0}")]
   UnknownRole(String),

   #[error("Task panicked: {0}")]
   TaskPanicked(#[from] JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Monitor has been shut down")]
   ManagerShutdown,

   #[error("Adapter not found")]
   AdapterNotFound,
}

impl From<ureq::Error> for ChildTagError {
   fn from(err: ureq::Error) -> Self {
      Self::Http(Box::new(err))
   }
}

/// Convenience type alias for Results with `ChildTagError`.
pub type Result<T> = std::result::Result<T, ChildTagError>;
