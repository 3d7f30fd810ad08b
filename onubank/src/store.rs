//! Cached client for the device's persisted variable service.
//!
//! Bank state lives in a handful of named bootloader variables on the
//! device. Reading them costs a full bus round trip, and the management
//! layer polls several of them in quick succession, so reads go through a
//! short-lived snapshot: one bulk query refreshes every known variable at
//! once and stays fresh for a small TTL. Writes go straight to the device
//! and drop the snapshot, because the service normalizes values and updates
//! derived variables on its side; the next read always observes the
//! device's view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::bank::BankId;
use crate::config::{DEFAULT_CACHE_TTL, DEFAULT_CALL_TIMEOUT};
use crate::remote::{check_status, RemoteCall, RemoteError, METHOD_GET_ENV, METHOD_SET_ENV};

/// Shared variable naming the bank booted next.
pub const VAR_ACTIVE_BANK: &str = "active_bank";

/// Shared variable naming the permanently selected bank.
pub const VAR_COMMIT_BANK: &str = "commit_bank";

/// Variable driving the bootloader's activation handling.
pub const VAR_IMG_ACTIVATE: &str = "img_activate";

/// Per-bank validity flag prefix, completed with the bank letter.
pub const VAR_IMG_VALID: &str = "img_valid";

/// Per-bank version prefix, completed with the bank letter.
pub const VAR_IMG_VERSION: &str = "img_version";

/// Longest value retained for any variable; longer values are truncated.
pub const VAL_LEN_MAX: usize = 64;

/// Name of the validity flag variable for one bank.
pub fn valid_var(bank: BankId) -> String {
    format!("{}{}", VAR_IMG_VALID, bank.letter())
}

/// Name of the version variable for one bank.
pub fn version_var(bank: BankId) -> String {
    format!("{}{}", VAR_IMG_VERSION, bank.letter())
}

/// How a variable's reply value is decoded during a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarKind {
    /// Plain text value.
    Text,
    /// Boolean flag; numeric and boolean replies render as "true"/"false".
    Flag,
}

/// Variables mirrored by the snapshot, with their decoding rules.
const KNOWN_VARS: [(&str, VarKind); 7] = [
    (VAR_ACTIVE_BANK, VarKind::Text),
    ("img_validA", VarKind::Flag),
    ("img_validB", VarKind::Flag),
    ("img_versionA", VarKind::Text),
    ("img_versionB", VarKind::Text),
    (VAR_COMMIT_BANK, VarKind::Text),
    (VAR_IMG_ACTIVATE, VarKind::Text),
];

/// Errors returned by the variable store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The device offers no variable service (reboot-only operation).
    #[error("variable service not supported by this device")]
    Unsupported,

    /// The variable is not present in the device environment.
    #[error("variable {name:?} not found")]
    NotFound { name: String },

    /// The underlying remote call failed.
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Default)]
struct Snapshot {
    values: HashMap<String, String>,
    refreshed_at: Option<Instant>,
}

/// Client for the persisted variable service with a short-lived read cache.
pub struct VarStore {
    remote: Arc<dyn RemoteCall>,
    target: String,
    reboot_only: bool,
    call_timeout: Duration,
    ttl: Duration,
    snapshot: Mutex<Snapshot>,
}

impl VarStore {
    /// Creates a store talking to `target` over the given transport.
    pub fn new(remote: Arc<dyn RemoteCall>, target: impl Into<String>) -> Self {
        Self {
            remote,
            target: target.into(),
            reboot_only: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ttl: DEFAULT_CACHE_TTL,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Marks the device as supporting reboot only; all reads and writes
    /// fail with [`StoreError::Unsupported`] without touching the bus.
    pub fn with_reboot_only(mut self, reboot_only: bool) -> Self {
        self.reboot_only = reboot_only;
        self
    }

    /// Sets the snapshot lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the timeout for remote calls.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Reads one variable, refreshing the snapshot if it is stale.
    ///
    /// Variables absent from the device environment, and variables stored
    /// with an empty value, report [`StoreError::NotFound`].
    pub fn get(&self, name: &str) -> Result<String, StoreError> {
        if self.reboot_only {
            return Err(StoreError::Unsupported);
        }

        let mut snapshot = self.snapshot.lock();
        self.refresh_if_stale(&mut snapshot)?;
        snapshot
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    /// Writes one string variable and drops the snapshot.
    pub fn set_str(&self, name: &str, value: &str) -> Result<(), StoreError> {
        debug!(name, value, "setting variable");
        self.write(name, Value::String(value.to_string()))
    }

    /// Writes one boolean variable and drops the snapshot.
    pub fn set_bool(&self, name: &str, value: bool) -> Result<(), StoreError> {
        debug!(name, value, "setting variable");
        self.write(name, Value::Bool(value))
    }

    /// Drops the snapshot; the next read performs a fresh bulk query.
    ///
    /// Called internally after every successful write, and by callers whose
    /// remote operations mutate variables as a side effect.
    pub fn invalidate(&self) {
        self.snapshot.lock().refreshed_at = None;
        debug!("variable snapshot dropped");
    }

    fn refresh_if_stale(&self, snapshot: &mut Snapshot) -> Result<(), StoreError> {
        if let Some(refreshed_at) = snapshot.refreshed_at {
            if refreshed_at.elapsed() < self.ttl {
                return Ok(());
            }
        }

        let reply = self
            .remote
            .call(&self.target, METHOD_GET_ENV, None, self.call_timeout)
            .map_err(|e| match e {
                RemoteError::MethodNotFound { .. } => StoreError::Unsupported,
                other => StoreError::Remote(other),
            })?;

        snapshot.values.clear();
        for (name, kind) in KNOWN_VARS {
            let Some(value) = reply.get(name) else {
                continue;
            };
            let Some(rendered) = render_value(value, kind) else {
                continue;
            };
            // An empty value means the variable was never written.
            if rendered.is_empty() {
                continue;
            }
            snapshot
                .values
                .insert(name.to_string(), truncate_value(&rendered));
        }
        // Only a successful refresh arms the TTL; a failed one is retried
        // on the next read.
        snapshot.refreshed_at = Some(Instant::now());
        debug!(
            service = %self.target,
            vars = snapshot.values.len(),
            "variable snapshot refreshed"
        );
        Ok(())
    }

    fn write(&self, name: &str, value: Value) -> Result<(), StoreError> {
        if self.reboot_only {
            return Err(StoreError::Unsupported);
        }

        let mut args = serde_json::Map::new();
        args.insert(name.to_string(), value);

        let reply = self.remote.call(
            &self.target,
            METHOD_SET_ENV,
            Some(&Value::Object(args)),
            self.call_timeout,
        )?;
        check_status(&self.target, METHOD_SET_ENV, &reply)?;

        self.invalidate();
        Ok(())
    }
}

fn render_value(value: &Value, kind: VarKind) -> Option<String> {
    match (kind, value) {
        (_, Value::String(text)) => Some(text.clone()),
        (VarKind::Flag, Value::Bool(flag)) => Some(flag.to_string()),
        (VarKind::Flag, Value::Number(number)) => {
            Some((number.as_u64().unwrap_or(0) != 0).to_string())
        }
        _ => None,
    }
}

fn truncate_value(value: &str) -> String {
    if value.len() <= VAL_LEN_MAX {
        return value.to_string();
    }
    // Back up to a char boundary so truncation cannot split a code point.
    let mut end = VAL_LEN_MAX;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
