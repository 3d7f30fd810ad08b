//! Device-level firmware image management.
//!
//! `ImageManager` owns everything one device needs for a firmware upgrade:
//! the control target selected by the startup probe, the cached variable
//! store, the windowed download session, and the remote flash, activation
//! and reboot calls.
//!
//! # Bank state
//!
//! "Active" and "committed" are each backed by one shared variable whose
//! value is the bank letter, so at most one bank can hold either role;
//! activating a bank implicitly deactivates the other. Validity flags and
//! versions are stored per bank.
//!
//! # Degraded devices
//!
//! Some devices expose only a reboot method. The startup probe detects this
//! and the manager comes up in reboot-only mode, where every upgrade
//! operation fails with [`ManagerError::Unsupported`] without touching the
//! bus. Rebooting keeps working.
//!
//! # Example
//!
//! ```ignore
//! use onubank::{ImageManager, ImgConfig, BankId};
//!
//! let manager = ImageManager::start(transport, ImgConfig::default())?;
//! let staged = receive_image(&mut manager)?; // download_start/handle_window/download_end
//! manager.upgrade(BankId::B, &staged.path)?;
//! manager.active_set(BankId::B)?;
//! manager.reboot()?;
//! ```

mod error;

pub use error::{ManagerError, ManagerResult};

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bank::BankId;
use crate::config::ImgConfig;
use crate::download::{DownloadProgressCallback, DownloadSession, StagedImage};
use crate::remote::{
    check_status, RemoteCall, RemoteError, METHOD_GET_ENV, METHOD_IMG_ACTIVATE, METHOD_REBOOT,
    METHOD_WRITE_IMG, TARGET_SYSTEM,
};
use crate::store::{valid_var, version_var, StoreError, VarStore, VAR_ACTIVE_BANK, VAR_COMMIT_BANK};

/// Version field width fixed by the management protocol.
pub const VERSION_LEN: usize = 14;

/// Version reported for a bank with no stored version information.
///
/// Some devices never write a version variable, and some management peers
/// reject an empty version field, so reads fall back to this value.
pub const DEFAULT_VERSION: &str = "00000000000000";

/// Attributes of one bank in a status report.
#[derive(Debug, Clone, Serialize)]
pub struct BankStatus {
    /// Bank identifier.
    pub bank: BankId,
    /// Whether this bank boots next.
    pub active: bool,
    /// Whether this bank is permanently selected.
    pub committed: bool,
    /// Whether the stored image passed validation.
    pub valid: bool,
    /// Stored image version.
    pub version: String,
}

impl fmt::Display for BankStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bank {}: {}, {}, {}, version {}",
            self.bank,
            if self.active { "active" } else { "inactive" },
            if self.committed {
                "committed"
            } else {
                "not committed"
            },
            if self.valid { "valid" } else { "invalid" },
            self.version
        )
    }
}

/// Snapshot of both banks' attributes.
#[derive(Debug, Clone, Serialize)]
pub struct BankReport {
    /// Status of banks A and B, in order.
    pub banks: [BankStatus; 2],
}

impl fmt::Display for BankReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.banks[0])?;
        write!(f, "{}", self.banks[1])
    }
}

/// Firmware image manager for one device.
///
/// Construction probes the device's control targets in the configured order
/// and selects the first one answering the variable query. Session-owning
/// operations (the download methods) take `&mut self`; bank state reads and
/// writes take `&self` and serialize on the store's internal lock.
pub struct ImageManager {
    remote: Arc<dyn RemoteCall>,
    config: ImgConfig,
    target: String,
    reboot_only: bool,
    store: VarStore,
    session: DownloadSession,
}

impl fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageManager")
            .field("config", &self.config)
            .field("target", &self.target)
            .field("reboot_only", &self.reboot_only)
            .finish_non_exhaustive()
    }
}

impl ImageManager {
    /// Probes the device and builds a manager over the given transport.
    ///
    /// Fails with [`ManagerError::Remote`] when no target answers for a
    /// reason other than the query method being unknown; an unknown method
    /// on the last target selects reboot-only mode instead.
    pub fn start(remote: Arc<dyn RemoteCall>, config: ImgConfig) -> ManagerResult<Self> {
        let (target, reboot_only) = Self::probe(remote.as_ref(), &config)?;

        let store = VarStore::new(Arc::clone(&remote), target.clone())
            .with_reboot_only(reboot_only)
            .with_ttl(config.cache_ttl)
            .with_call_timeout(config.call_timeout);
        let session = DownloadSession::with_path(config.image_path.clone());

        Ok(Self {
            remote,
            config,
            target,
            reboot_only,
            store,
            session,
        })
    }

    fn probe(remote: &dyn RemoteCall, config: &ImgConfig) -> ManagerResult<(String, bool)> {
        let mut last_error = None;

        for target in &config.probe_targets {
            match remote.call(target, METHOD_GET_ENV, None, config.call_timeout) {
                Ok(_) => {
                    info!(service = %target, "upgrade service detected");
                    return Ok((target.clone(), false));
                }
                Err(e) => {
                    debug!(service = %target, error = %e, "probe failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(RemoteError::MethodNotFound { .. }) => {
                // Reboot is expected to work even without the upgrade service.
                warn!("only system reboot supported");
                Ok((TARGET_SYSTEM.to_string(), true))
            }
            Some(e) => Err(ManagerError::Remote(e)),
            None => Err(ManagerError::InvalidConfig(
                "no probe targets configured".to_string(),
            )),
        }
    }

    /// Control target selected by the startup probe.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the device supports rebooting only.
    pub fn is_reboot_only(&self) -> bool {
        self.reboot_only
    }

    /// Whether an image transfer is currently open.
    pub fn download_active(&self) -> bool {
        self.session.is_active()
    }

    /// Sets the callback invoked as download MiBs arrive.
    pub fn set_download_progress(&mut self, callback: DownloadProgressCallback) {
        self.session.set_progress(callback);
    }

    /// Opens a windowed download expecting `size` bytes.
    pub fn download_start(&mut self, size: u32) -> ManagerResult<()> {
        self.session.begin(size)?;
        Ok(())
    }

    /// Appends one window to the open download.
    pub fn handle_window(&mut self, window_nr: u32, data: &[u8]) -> ManagerResult<()> {
        self.session.write_window(window_nr, data)?;
        Ok(())
    }

    /// Validates and closes the open download, returning the staged image.
    pub fn download_end(&mut self, size: u32, crc: u32) -> ManagerResult<StagedImage> {
        Ok(self.session.finalize(size, crc)?)
    }

    /// Aborts any open download. Safe to call in any state.
    pub fn download_stop(&mut self) {
        self.session.abort();
    }

    /// Whether `bank` boots next.
    ///
    /// Devices that never initialize the shared variable treat bank A as
    /// inactive and bank B as active.
    pub fn active_get(&self, bank: BankId) -> ManagerResult<bool> {
        match self.store.get(VAR_ACTIVE_BANK) {
            Ok(value) => Ok(value == bank.as_str()),
            Err(StoreError::NotFound { .. }) => Ok(bank == BankId::B),
            Err(e) => Err(e.into()),
        }
    }

    /// Makes `bank` the one booted next.
    ///
    /// The remote activation call rewrites the shared variable itself; the
    /// local snapshot is dropped so the next read observes the device's
    /// view.
    pub fn active_set(&self, bank: BankId) -> ManagerResult<()> {
        if self.reboot_only {
            return Err(ManagerError::Unsupported);
        }

        let args = serde_json::json!({ "bank": bank.as_str() });
        let reply = self.remote.call(
            &self.target,
            METHOD_IMG_ACTIVATE,
            Some(&args),
            self.config.call_timeout,
        )?;
        check_status(&self.target, METHOD_IMG_ACTIVATE, &reply)?;

        self.store.invalidate();
        info!(bank = %bank, "bank activated");
        Ok(())
    }

    /// Whether `bank` is the permanently selected one.
    pub fn commit_get(&self, bank: BankId) -> ManagerResult<bool> {
        let value = self.store.get(VAR_COMMIT_BANK)?;
        Ok(value == bank.as_str())
    }

    /// Permanently selects `bank` across future activations.
    pub fn commit_set(&self, bank: BankId) -> ManagerResult<()> {
        self.store.set_str(VAR_COMMIT_BANK, bank.as_str())?;
        info!(bank = %bank, "bank committed");
        Ok(())
    }

    /// Whether the image stored in `bank` passed validation.
    pub fn valid_get(&self, bank: BankId) -> ManagerResult<bool> {
        let value = self.store.get(&valid_var(bank))?;
        Ok(value == "true")
    }

    /// Records whether the image stored in `bank` passed validation.
    pub fn valid_set(&self, bank: BankId, valid: bool) -> ManagerResult<()> {
        self.store.set_bool(&valid_var(bank), valid)?;
        Ok(())
    }

    /// Version of the image stored in `bank`.
    ///
    /// Returns [`DEFAULT_VERSION`] when the device has no stored version.
    pub fn version_get(&self, bank: BankId) -> ManagerResult<String> {
        match self.store.get(&version_var(bank)) {
            Ok(value) => Ok(truncate_version(&value).to_string()),
            Err(StoreError::NotFound { .. }) => Ok(DEFAULT_VERSION.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores the version string for `bank`, truncated to [`VERSION_LEN`].
    pub fn version_set(&self, bank: BankId, version: &str) -> ManagerResult<()> {
        self.store
            .set_str(&version_var(bank), truncate_version(version))?;
        Ok(())
    }

    /// Flashes the staged image into `bank`.
    ///
    /// The image is copied to the configured staging location first when the
    /// caller supplies a different path. The remote flash call runs with the
    /// long flash timeout, must report a zero status, and never reboots the
    /// device itself. Afterwards the variable snapshot is dropped, since
    /// flashing rewrites version and validity variables on the device. A
    /// failed flash call leaves bank state untouched.
    pub fn upgrade(&self, bank: BankId, image: &Path) -> ManagerResult<()> {
        if self.reboot_only {
            return Err(ManagerError::Unsupported);
        }

        if image != self.config.image_path {
            self.stage_copy(image)?;
        }

        info!(
            bank = %bank,
            image = %self.config.image_path.display(),
            "flashing image"
        );
        let args = serde_json::json!({
            "noreboot": true,
            "bank": bank.as_str(),
            "image_name": self.config.image_name,
        });
        let reply = self.remote.call(
            &self.target,
            METHOD_WRITE_IMG,
            Some(&args),
            self.config.flash_timeout,
        )?;
        check_status(&self.target, METHOD_WRITE_IMG, &reply)?;

        self.store.invalidate();
        info!(bank = %bank, "image flashed");
        Ok(())
    }

    fn stage_copy(&self, image: &Path) -> ManagerResult<()> {
        let copy_failed = |source| ManagerError::CopyFailed {
            from: image.to_path_buf(),
            to: self.config.image_path.clone(),
            source,
        };

        if let Some(parent) = self.config.image_path.parent() {
            fs::create_dir_all(parent).map_err(copy_failed)?;
        }
        fs::copy(image, &self.config.image_path).map_err(copy_failed)?;
        debug!(
            from = %image.display(),
            to = %self.config.image_path.display(),
            "image staged"
        );
        Ok(())
    }

    /// Reboots the device through the control target.
    ///
    /// Works in reboot-only mode as well. Scheduling a delayed reboot is
    /// the caller's concern.
    pub fn reboot(&self) -> ManagerResult<()> {
        warn!(service = %self.target, "requesting device reboot");
        self.remote
            .call(&self.target, METHOD_REBOOT, None, self.config.call_timeout)?;
        Ok(())
    }

    /// Snapshot of both banks' attributes.
    ///
    /// Banks with no stored committed or valid flag report `false`; a bank
    /// with no stored version reports [`DEFAULT_VERSION`].
    pub fn report(&self) -> ManagerResult<BankReport> {
        Ok(BankReport {
            banks: [
                self.bank_status(BankId::A)?,
                self.bank_status(BankId::B)?,
            ],
        })
    }

    fn bank_status(&self, bank: BankId) -> ManagerResult<BankStatus> {
        Ok(BankStatus {
            bank,
            active: self.active_get(bank)?,
            committed: flag_or_absent(self.commit_get(bank))?,
            valid: flag_or_absent(self.valid_get(bank))?,
            version: self.version_get(bank)?,
        })
    }
}

/// Treats an absent flag variable as `false` for reporting purposes.
fn flag_or_absent(result: ManagerResult<bool>) -> ManagerResult<bool> {
    match result {
        Err(ManagerError::Store(StoreError::NotFound { .. })) => Ok(false),
        other => other,
    }
}

fn truncate_version(version: &str) -> &str {
    match version.char_indices().nth(VERSION_LEN) {
        Some((offset, _)) => &version[..offset],
        None => version,
    }
}
