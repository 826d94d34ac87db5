//! Configuration management for the battery reporting service.
//!
//! This module handles loading and saving configuration from disk,
//! including known headsets, arbitration timing and metadata options.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{Result, ServiceError};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Silence tolerated before failing over to a weaker advertiser
   #[serde(default = "default_grace_window")]
   pub grace_window_ms: u64,

   /// Scan batch flush interval
   #[serde(default = "default_report_delay")]
   pub report_delay_ms: u64,

   #[serde(default = "default_health_check_interval")]
   pub health_check_interval_sec: u64,

   /// Percent written to the low battery threshold fields
   #[serde(default = "default_low_battery_threshold")]
   pub low_battery_threshold: u8,

   #[serde(default = "default_icon_base_uri")]
   pub icon_base_uri: SmolStr,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub metadata_db_path: Option<PathBuf>,
}

/// Represents a known headset.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_grace_window() -> u64 {
   5000
}

const fn default_report_delay() -> u64 {
   500
}

const fn default_health_check_interval() -> u64 {
   5
}

const fn default_low_battery_threshold() -> u8 {
   20
}

fn default_icon_base_uri() -> SmolStr {
   SmolStr::new_static("file:///usr/share/podbattery/icons")
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         grace_window_ms: default_grace_window(),
         report_delay_ms: default_report_delay(),
         health_check_interval_sec: default_health_check_interval(),
         low_battery_threshold: default_low_battery_threshold(),
         icon_base_uri: default_icon_base_uri(),
         metadata_db_path: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Self::parse(&contents)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   fn parse(contents: &str) -> Result<Self> {
      let mut config: Self = toml::from_str(contents)?;
      config.low_battery_threshold = config.low_battery_threshold.min(100);
      if config.icon_base_uri.ends_with('/') {
         config.icon_base_uri = config.icon_base_uri.trim_end_matches('/').into();
      }
      Ok(config)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("PODBATTERY_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(ServiceError::ConfigDirNotFound);
      };

      Ok(config_dir.join("podbattery").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_empty_file_uses_defaults() {
      let config = Config::parse("").unwrap();
      assert!(config.known_devices.is_empty());
      assert_eq!(config.grace_window_ms, 5000);
      assert_eq!(config.report_delay_ms, 500);
      assert_eq!(config.health_check_interval_sec, 5);
      assert_eq!(config.low_battery_threshold, 20);
      assert!(config.metadata_db_path.is_none());
   }

   #[test]
   fn test_partial_file() {
      let config = Config::parse(
         r#"
grace_window_ms = 2500
low_battery_threshold = 250
icon_base_uri = "res://icons/"

[[known_devices]]
address = "AA:BB:CC:DD:EE:FF"
name = "Desk AirPods"
"#,
      )
      .unwrap();
      assert_eq!(config.grace_window_ms, 2500);
      assert_eq!(config.report_delay_ms, 500);
      assert_eq!(config.low_battery_threshold, 100);
      assert_eq!(config.icon_base_uri, "res://icons");
      assert_eq!(
         config.is_known_device("aa:bb:cc:dd:ee:ff"),
         Some("Desk AirPods")
      );
      assert_eq!(config.is_known_device("11:22:33:44:55:66"), None);
   }

   #[test]
   fn test_invalid_toml_is_an_error() {
      assert!(matches!(
         Config::parse("grace_window_ms = \"soon\""),
         Err(ServiceError::TomlParse(_))
      ));
   }

   #[test]
   fn test_defaults_round_trip() {
      let text = toml::to_string_pretty(&Config::default()).unwrap();
      let config = Config::parse(&text).unwrap();
      assert_eq!(config.icon_base_uri, Config::default().icon_base_uri);
      assert_eq!(config.grace_window_ms, 5000);
   }
}
