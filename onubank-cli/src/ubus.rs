//! Remote transport shelling out to the `ubus` command line client.
//!
//! The upgrade and system services live on the device message bus. Instead
//! of linking a bus client, the operator tool invokes the stock `ubus`
//! binary, passes the call timeout through, and parses the JSON reply from
//! stdout. Bus-level failures come back as process exit codes.

use std::process::Command;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use onubank::{RemoteCall, RemoteError};

/// Exit code for a method unknown to the addressed object.
const UBUS_STATUS_METHOD_NOT_FOUND: i32 = 3;

/// Exit code for an object absent from the bus.
const UBUS_STATUS_NOT_FOUND: i32 = 4;

/// Exit code for a call that timed out.
const UBUS_STATUS_TIMEOUT: i32 = 7;

/// [`RemoteCall`] transport invoking the `ubus` client per call.
#[derive(Debug, Default)]
pub struct UbusShell;

impl UbusShell {
    /// Create a new shell-based transport.
    pub fn new() -> Self {
        Self
    }
}

/// Argument vector for one `ubus call` invocation.
fn ubus_args(target: &str, method: &str, args: Option<&Value>, timeout: Duration) -> Vec<String> {
    let mut argv = vec![
        "-t".to_string(),
        timeout.as_secs().max(1).to_string(),
        "call".to_string(),
        target.to_string(),
        method.to_string(),
    ];
    if let Some(args) = args {
        argv.push(args.to_string());
    }
    argv
}

impl RemoteCall for UbusShell {
    fn call(
        &self,
        target: &str,
        method: &str,
        args: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, RemoteError> {
        let argv = ubus_args(target, method, args, timeout);
        debug!(service = target, method, "invoking ubus");

        let output = Command::new("ubus").args(&argv).output().map_err(|e| {
            RemoteError::Transport {
                target: target.to_string(),
                method: method.to_string(),
                reason: format!("failed to run ubus: {}", e),
            }
        })?;

        if !output.status.success() {
            // Both an absent object and an unknown method are name lookup
            // failures; the probe treats them the same.
            return Err(match output.status.code() {
                Some(UBUS_STATUS_METHOD_NOT_FOUND) | Some(UBUS_STATUS_NOT_FOUND) => {
                    RemoteError::MethodNotFound {
                        target: target.to_string(),
                        method: method.to_string(),
                    }
                }
                Some(UBUS_STATUS_TIMEOUT) => RemoteError::Timeout {
                    target: target.to_string(),
                    method: method.to_string(),
                    timeout_secs: timeout.as_secs(),
                },
                code => RemoteError::Transport {
                    target: target.to_string(),
                    method: method.to_string(),
                    reason: format!(
                        "ubus exited with {:?}: {}",
                        code,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                },
            });
        }

        // Some methods reply with no payload at all.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&output.stdout).map_err(|e| RemoteError::Transport {
            target: target.to_string(),
            method: method.to_string(),
            reason: format!("invalid JSON reply: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_ubus_args_without_payload() {
        let argv = ubus_args("fwupgrade", "get_uboot_env", None, Duration::from_secs(10));
        assert_eq!(argv, ["-t", "10", "call", "fwupgrade", "get_uboot_env"]);
    }

    #[test]
    fn test_ubus_args_with_payload() {
        let args = json!({ "commit_bank": "B" });
        let argv = ubus_args(
            "fwupgrade",
            "set_uboot_env",
            Some(&args),
            Duration::from_secs(10),
        );
        assert_eq!(argv.len(), 6);
        assert_eq!(argv[5], r#"{"commit_bank":"B"}"#);
    }

    #[test]
    fn test_ubus_args_timeout_floor() {
        // Sub-second timeouts still pass at least one second through.
        let argv = ubus_args("system", "reboot", None, Duration::from_millis(200));
        assert_eq!(argv[1], "1");
    }
}
