//! Configuration for firmware image management.
//!
//! `ImgConfig` carries everything an [`ImageManager`](crate::ImageManager)
//! needs: the staging location, the probe order for control targets, and
//! the remote call timeouts. Defaults match the values devices ship with;
//! deployments override them programmatically or through an INI file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;
use tracing::warn;

use crate::remote::{TARGET_FWUPGRADE, TARGET_SYSTEM};

/// Default location where a completed image is staged for flashing.
pub const DEFAULT_IMAGE_PATH: &str = "/tmp/upgrade/firmware.img";

/// Default image file name passed to the remote flash operation.
pub const DEFAULT_IMAGE_NAME: &str = "firmware.img";

/// Control targets probed at startup, in order.
pub const DEFAULT_PROBE_TARGETS: [&str; 2] = [TARGET_FWUPGRADE, TARGET_SYSTEM];

/// Default timeout for ordinary remote calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the remote flash call. Writing a bank is slow.
pub const DEFAULT_FLASH_TIMEOUT: Duration = Duration::from_secs(60);

/// Default lifetime of a refreshed variable snapshot.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2);

/// Default location of the configuration file on the device.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/onubank/onubank.conf";

/// Configuration for an [`ImageManager`](crate::ImageManager).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImgConfig {
    /// Location where downloaded images are staged.
    pub image_path: PathBuf,

    /// Image file name passed to the remote flash operation.
    pub image_name: String,

    /// Control targets probed at startup, in order.
    pub probe_targets: Vec<String>,

    /// Timeout for ordinary remote calls.
    pub call_timeout: Duration,

    /// Timeout for the remote flash call.
    pub flash_timeout: Duration,

    /// Lifetime of a refreshed variable snapshot.
    pub cache_ttl: Duration,
}

impl Default for ImgConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from(DEFAULT_IMAGE_PATH),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            probe_targets: DEFAULT_PROBE_TARGETS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            flash_timeout: DEFAULT_FLASH_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl ImgConfig {
    /// Creates a config with the device defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image staging location.
    pub fn with_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = path.into();
        self
    }

    /// Sets the image name passed to the remote flash operation.
    pub fn with_image_name(mut self, name: impl Into<String>) -> Self {
        self.image_name = name.into();
        self
    }

    /// Sets the control targets probed at startup.
    pub fn with_probe_targets(mut self, targets: Vec<String>) -> Self {
        self.probe_targets = targets;
        self
    }

    /// Sets the timeout for ordinary remote calls.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the timeout for the remote flash call.
    pub fn with_flash_timeout(mut self, timeout: Duration) -> Self {
        self.flash_timeout = timeout;
        self
    }

    /// Sets the lifetime of a refreshed variable snapshot.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("failed to load {path}: {source}")]
    LoadFailed { path: PathBuf, source: ini::Error },

    /// A value could not be interpreted.
    #[error("invalid value for {key} in [{section}]: {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Loader for the INI configuration file.
///
/// Recognized sections and keys, all optional:
///
/// ```ini
/// [image]
/// path = /tmp/upgrade/firmware.img
/// name = firmware.img
///
/// [remote]
/// targets = fwupgrade,system
/// call_timeout_secs = 10
/// flash_timeout_secs = 60
///
/// [cache]
/// ttl_secs = 2
/// ```
///
/// Absent keys keep their defaults.
pub struct ConfigFile;

impl ConfigFile {
    /// Loads settings from `path`, layered over the defaults.
    pub fn load(path: &Path) -> Result<ImgConfig, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut config = ImgConfig::default();

        if let Some(section) = ini.section(Some("image")) {
            if let Some(value) = section.get("path") {
                config.image_path = PathBuf::from(value);
            }
            if let Some(value) = section.get("name") {
                config.image_name = value.to_string();
            }
        }

        if let Some(section) = ini.section(Some("remote")) {
            if let Some(value) = section.get("targets") {
                config.probe_targets = value
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
            }
            if let Some(value) = section.get("call_timeout_secs") {
                config.call_timeout =
                    Duration::from_secs(parse_secs("remote", "call_timeout_secs", value)?);
            }
            if let Some(value) = section.get("flash_timeout_secs") {
                config.flash_timeout =
                    Duration::from_secs(parse_secs("remote", "flash_timeout_secs", value)?);
            }
        }

        if let Some(section) = ini.section(Some("cache")) {
            if let Some(value) = section.get("ttl_secs") {
                config.cache_ttl = Duration::from_secs(parse_secs("cache", "ttl_secs", value)?);
            }
        }

        Ok(config)
    }

    /// Loads the device configuration if present, falling back to defaults.
    ///
    /// A malformed file is reported and ignored rather than refusing to run,
    /// since the tool must stay usable on a misconfigured device.
    pub fn load_or_default() -> ImgConfig {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if !path.exists() {
            return ImgConfig::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring configuration file");
                ImgConfig::default()
            }
        }
    }
}

fn parse_secs(section: &str, key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ImgConfig::default();
        assert_eq!(config.image_path, PathBuf::from("/tmp/upgrade/firmware.img"));
        assert_eq!(config.image_name, "firmware.img");
        assert_eq!(config.probe_targets, vec!["fwupgrade", "system"]);
        assert_eq!(config.call_timeout.as_secs(), 10);
        assert_eq!(config.flash_timeout.as_secs(), 60);
        assert_eq!(config.cache_ttl.as_secs(), 2);
    }

    #[test]
    fn test_config_builder() {
        let config = ImgConfig::new()
            .with_image_path("/var/upgrade/fw.bin")
            .with_image_name("fw.bin")
            .with_call_timeout(Duration::from_secs(5))
            .with_flash_timeout(Duration::from_secs(120))
            .with_cache_ttl(Duration::from_secs(1));

        assert_eq!(config.image_path, PathBuf::from("/var/upgrade/fw.bin"));
        assert_eq!(config.image_name, "fw.bin");
        assert_eq!(config.call_timeout.as_secs(), 5);
        assert_eq!(config.flash_timeout.as_secs(), 120);
        assert_eq!(config.cache_ttl.as_secs(), 1);
    }

    #[test]
    fn test_load_overrides() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("onubank.conf");
        fs::write(
            &path,
            "[image]\n\
             path = /data/fw.img\n\
             name = fw.img\n\
             \n\
             [remote]\n\
             targets = upgraded, system\n\
             flash_timeout_secs = 90\n\
             \n\
             [cache]\n\
             ttl_secs = 5\n",
        )
        .unwrap();

        let config = ConfigFile::load(&path).unwrap();
        assert_eq!(config.image_path, PathBuf::from("/data/fw.img"));
        assert_eq!(config.image_name, "fw.img");
        assert_eq!(config.probe_targets, vec!["upgraded", "system"]);
        assert_eq!(config.flash_timeout.as_secs(), 90);
        assert_eq!(config.cache_ttl.as_secs(), 5);
        // Untouched keys keep their defaults.
        assert_eq!(config.call_timeout.as_secs(), 10);
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = ConfigFile::load(&temp.path().join("absent.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }

    #[test]
    fn test_load_invalid_number() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("onubank.conf");
        fs::write(&path, "[cache]\nttl_secs = soon\n").unwrap();

        let err = ConfigFile::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("ttl_secs"));
    }
}
