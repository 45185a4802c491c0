//! Configuration management for the AVRCP link layer.
//!
//! This module handles loading and saving configuration from disk, including
//! the absolute-volume switch and the per-device interoperability blocklist.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::{address::Address, sdp::DEFAULT_DB_SIZE},
   error::{AvrcpError, Result},
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Whether peers advertising category 2 get absolute volume at all.
   #[serde(default = "default_absolute_volume")]
   pub absolute_volume_enabled: bool,

   /// Peers known to misbehave with absolute volume.
   #[serde(default)]
   pub volume_blocklist: Vec<Address>,

   #[serde(default = "default_sdp_db_size")]
   pub sdp_db_size: usize,
}

const fn default_absolute_volume() -> bool {
   true
}

const fn default_sdp_db_size() -> usize {
   DEFAULT_DB_SIZE
}

impl Default for Config {
   fn default() -> Self {
      Self {
         absolute_volume_enabled: default_absolute_volume(),
         volume_blocklist: vec![],
         sdp_db_size: default_sdp_db_size(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      Ok(toml::from_str(&contents)?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(avrcp_home) = env::var("AVRCP_HOME") {
         PathBuf::from(avrcp_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(AvrcpError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("avrcp-link").join("config.toml"))
   }

   pub fn is_volume_blocked(&self, address: &Address) -> bool {
      self.volume_blocklist.contains(address)
   }
}
