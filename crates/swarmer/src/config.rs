//! Tunables of the download core, read from a TOML file.
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::warn;

use crate::error::Error;

/// All knobs, grouped by the component that reads them.
///
/// Every field has a default, so a partial file is valid.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub selection: SelectionConfig,
    pub verifying: VerifyingConfig,
    pub ranker: RankerConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    /// Files are downloaded in order until at least this many bytes
    /// are on disk.
    pub min_preview_bytes: u64,
    /// Same as `min_preview_bytes`, as a fraction of the file size.
    /// The larger of the two wins.
    pub min_preview_fraction: f64,
    /// How many random locations are cached by the random strategy.
    pub random_locations: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_preview_bytes: 1024 * 1024,
            min_preview_fraction: 0.1,
            random_locations: 8,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VerifyingConfig {
    /// Fraction of the file that may be lost to corruption before
    /// the download is declared hopeless.
    pub max_corruption: f64,
    /// Capacity of the write queue, in write requests.
    pub write_buffers: usize,
    /// Largest write request queued by [`crate::verifying::VerifyingFile::write_all`].
    pub buffer_unit: usize,
    /// Download corrupt chunks again rather than keeping them.
    pub discard_unverified: bool,
    /// How many times a chunk is read back from storage before it is
    /// considered corrupt.
    pub verify_read_retries: usize,
    /// A different hash tree replaces the current one only while at most
    /// this many chunks were verified against the current one.
    pub tree_swap_leaves: usize,
}

impl Default for VerifyingConfig {
    fn default() -> Self {
        Self {
            max_corruption: 0.9,
            write_buffers: 8,
            buffer_unit: 16 * 1024,
            discard_unverified: true,
            verify_read_retries: 3,
            tree_swap_leaves: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RankerConfig {
    /// Probing stops once this many sources answered positively and
    /// were not handed out yet.
    pub max_verified_hosts: usize,
    /// Sources probed per round.
    pub ping_batch: usize,
    /// Minimum delay between two probe rounds.
    pub ping_interval_ms: u64,
    /// How long a busy source is left alone before it is probed again.
    pub busy_retry_secs: u64,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            max_verified_hosts: 8,
            ping_batch: 10,
            ping_interval_ms: 1000,
            busy_retry_secs: 60,
        }
    }
}

impl Config {
    /// Path of the configuration file inside the user's config folder.
    ///
    /// # Errors
    ///
    /// Fails when the user has no home folder.
    pub fn default_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "Swarmer").ok_or(Error::HomeInvalid)?;
        let mut path = dotfile.config_dir().to_path_buf();
        path.push("config.toml");
        Ok(path)
    }

    /// Load the configuration from the user's config folder.
    /// If the file does not exist, or cannot be parsed, the default
    /// configuration is written to it.
    pub async fn load() -> Result<Self, Error> {
        Self::load_from(Self::default_path()?).await
    }

    /// Same as [`Config::load`] but for an arbitrary path.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        if let Some(dir) = path.parent() {
            if !dir.exists() {
                create_dir_all(dir).await.map_err(|_| {
                    Error::ConfigError(format!(
                        "could not create the folder {}",
                        dir.display()
                    ))
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match Self::parse(&dst) {
            Ok(config) if !dst.trim().is_empty() => Ok(config),
            result => {
                if let Err(e) = result {
                    warn!("invalid config at {}: {e}", path.display());
                }
                let config = Config::default();
                let mut file = OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .await?;
                file.write_all(toml::to_string(&config)?.as_bytes()).await?;
                Ok(config)
            }
        }
    }

    /// Parse and validate a TOML document.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Config>(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let v = &self.verifying;
        if !(0.0..=1.0).contains(&v.max_corruption) {
            return Err(Error::ConfigError(
                "verifying.max_corruption must be within 0 and 1".into(),
            ));
        }
        if v.write_buffers == 0 || v.buffer_unit == 0 {
            return Err(Error::ConfigError(
                "verifying.write_buffers and buffer_unit must be at least 1"
                    .into(),
            ));
        }
        let s = &self.selection;
        if !(0.0..=1.0).contains(&s.min_preview_fraction) {
            return Err(Error::ConfigError(
                "selection.min_preview_fraction must be within 0 and 1".into(),
            ));
        }
        if s.random_locations == 0 {
            return Err(Error::ConfigError(
                "selection.random_locations must be at least 1".into(),
            ));
        }
        if self.ranker.ping_batch == 0 {
            return Err(Error::ConfigError(
                "ranker.ping_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
