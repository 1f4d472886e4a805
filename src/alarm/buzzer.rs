//! Buzzer output.
//!
//! The monitor drives a piezo buzzer through the Linux sysfs PWM interface.
//! Hosts without a PWM chip fall back to a buzzer that only logs.

use std::{
   fs,
   path::{Path, PathBuf},
   thread,
   time::Duration,
};

use log::{debug, info, warn};

use crate::{
   config::BuzzerConfig,
   error::{ChildTagError, Result},
};

/// Attempts to wait for udev to create the exported channel
const EXPORT_POLL_ATTEMPTS: u32 = 20;
const EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const NANOS_PER_SEC: u64 = 1_000_000_000;

pub trait Buzzer: Send {
   fn on(&mut self) -> Result<()>;
   fn off(&mut self) -> Result<()>;
}

/// Builds the buzzer described by the configuration on the blocking pool,
/// since exporting a PWM channel polls sysfs until udev catches up.
pub async fn open(config: BuzzerConfig) -> Result<Box<dyn Buzzer>> {
   tokio::task::spawn_blocking(move || from_config(&config)).await?
}

fn from_config(config: &BuzzerConfig) -> Result<Box<dyn Buzzer>> {
   match config.pwm_chip {
      Some(chip) => Ok(Box::new(PwmBuzzer::open(
         &config.sysfs_root,
         chip,
         config.pwm_channel,
         config.frequency_hz,
         config.duty_percent,
      )?)),
      None => {
         info!("No PWM chip configured, buzzer output is logged only");
         Ok(Box::new(LogBuzzer::default()))
      },
   }
}

/// Buzzer on a sysfs PWM channel, e.g. `/sys/class/pwm/pwmchip0/pwm0`.
#[derive(Debug)]
pub struct PwmBuzzer {
   channel: PathBuf,
   duty_ns: u64,
   active: bool,
}

impl PwmBuzzer {
   pub fn open(
      root: &Path,
      chip: u32,
      channel: u32,
      frequency_hz: u32,
      duty_percent: u8,
   ) -> Result<Self> {
      if frequency_hz == 0 {
         return Err(ChildTagError::InvalidConfig("PWM frequency is zero".into()));
      }

      let chip_dir = root.join(format!("pwmchip{chip}"));
      let channel_dir = chip_dir.join(format!("pwm{channel}"));

      if !channel_dir.exists() {
         debug!("Exporting PWM channel {channel} on {}", chip_dir.display());
         fs::write(chip_dir.join("export"), channel.to_string())?;
         wait_for(&channel_dir)?;
      }

      let period_ns = NANOS_PER_SEC / u64::from(frequency_hz);
      let duty_ns = period_ns * u64::from(duty_percent.min(100)) / 100;

      // Duty cycle must never exceed the period, so clear it first.
      write_attr(&channel_dir, "duty_cycle", 0)?;
      write_attr(&channel_dir, "period", period_ns)?;
      write_attr(&channel_dir, "enable", 1)?;

      info!(
         "Buzzer on {} at {frequency_hz} Hz ({duty_percent}% duty)",
         channel_dir.display()
      );

      Ok(Self {
         channel: channel_dir,
         duty_ns,
         active: false,
      })
   }
}

impl Buzzer for PwmBuzzer {
   fn on(&mut self) -> Result<()> {
      write_attr(&self.channel, "duty_cycle", self.duty_ns)?;
      self.active = true;
      Ok(())
   }

   fn off(&mut self) -> Result<()> {
      write_attr(&self.channel, "duty_cycle", 0)?;
      self.active = false;
      Ok(())
   }
}

impl Drop for PwmBuzzer {
   fn drop(&mut self) {
      if self.active
         && let Err(e) = self.off()
      {
         warn!("Failed to silence buzzer on shutdown: {e}");
      }
      if let Err(e) = write_attr(&self.channel, "enable", 0) {
         warn!("Failed to disable PWM channel {}: {e}", self.channel.display());
      }
   }
}

fn write_attr(channel: &Path, attr: &str, value: u64) -> Result<()> {
   fs::write(channel.join(attr), value.to_string())?;
   Ok(())
}

fn wait_for(path: &Path) -> Result<()> {
   for _ in 0..EXPORT_POLL_ATTEMPTS {
      if path.exists() {
         return Ok(());
      }
      thread::sleep(EXPORT_POLL_INTERVAL);
   }
   Err(ChildTagError::InvalidConfig(format!(
      "PWM channel {} did not appear after export",
      path.display()
   )))
}

/// Buzzer that only logs state changes.
#[derive(Debug, Default)]
pub struct LogBuzzer {
   active: bool,
}

impl Buzzer for LogBuzzer {
   fn on(&mut self) -> Result<()> {
      if !self.active {
         info!("Buzzer ON");
      }
      self.active = true;
      Ok(())
   }

   fn off(&mut self) -> Result<()> {
      if self.active {
         info!("Buzzer OFF");
      }
      self.active = false;
      Ok(())
   }
}
