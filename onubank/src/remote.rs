//! Remote call abstraction for the device control bus.
//!
//! Every interaction with the device outside this process - reading and
//! writing persisted variables, flashing a bank, switching the active bank,
//! rebooting - is one synchronous request/reply round trip on a message bus.
//! The [`RemoteCall`] trait captures exactly that contract so the library
//! never links a bus implementation and tests can script the device side.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Bus target of the firmware upgrade service.
pub const TARGET_FWUPGRADE: &str = "fwupgrade";

/// Bus target of the base system service.
pub const TARGET_SYSTEM: &str = "system";

/// Method returning the full persisted variable environment.
pub const METHOD_GET_ENV: &str = "get_uboot_env";

/// Method writing one persisted variable.
pub const METHOD_SET_ENV: &str = "set_uboot_env";

/// Method flashing the staged image into a bank.
pub const METHOD_WRITE_IMG: &str = "write_img";

/// Method switching the bank booted next.
pub const METHOD_IMG_ACTIVATE: &str = "img_activate";

/// Method rebooting the device.
pub const METHOD_REBOOT: &str = "reboot";

/// Reply fields that may carry the remote completion code, in lookup order.
const STATUS_FIELDS: [&str; 3] = ["retval", "write_retval", "img_write_retval"];

/// Errors raised by a remote call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The target does not implement the method.
    #[error("method {method:?} not found on {target:?}")]
    MethodNotFound { target: String, method: String },

    /// The call did not complete within its timeout.
    #[error("call to {target} {method} timed out after {timeout_secs}s")]
    Timeout {
        target: String,
        method: String,
        timeout_secs: u64,
    },

    /// The bus transport failed.
    #[error("transport failure calling {target} {method}: {reason}")]
    Transport {
        target: String,
        method: String,
        reason: String,
    },

    /// The call completed but the service reported a nonzero status.
    #[error("{target} {method} failed with status {status}")]
    Status {
        target: String,
        method: String,
        status: u32,
    },
}

/// Trait for synchronous request/reply calls on the device control bus.
///
/// This abstraction allows for dependency injection and easier testing
/// by enabling scripted transports in tests.
pub trait RemoteCall: Send + Sync {
    /// Invokes `method` on `target` with optional JSON arguments.
    ///
    /// # Arguments
    ///
    /// * `target` - Bus object to address
    /// * `method` - Method name on that object
    /// * `args` - JSON argument record, if the method takes any
    /// * `timeout` - How long to wait for the reply
    ///
    /// # Returns
    ///
    /// The JSON reply record or an error. Methods replying with no payload
    /// return [`Value::Null`].
    fn call(
        &self,
        target: &str,
        method: &str,
        args: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, RemoteError>;
}

/// Extracts the completion code from a reply.
///
/// Services report their result under one of several field names; the first
/// present field wins. A reply carrying none of them counts as success.
pub fn completion_status(reply: &Value) -> u32 {
    for field in STATUS_FIELDS {
        if let Some(status) = reply.get(field).and_then(Value::as_u64) {
            return status as u32;
        }
    }
    0
}

/// Checks a reply's completion code, mapping nonzero codes to
/// [`RemoteError::Status`].
pub fn check_status(target: &str, method: &str, reply: &Value) -> Result<(), RemoteError> {
    let status = completion_status(reply);
    if status != 0 {
        return Err(RemoteError::Status {
            target: target.to_string(),
            method: method.to_string(),
            status,
        });
    }
    Ok(())
}
