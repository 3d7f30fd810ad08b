//! Integration tests for the managed firmware upgrade flow.
//!
//! These tests drive the public API end to end against a scripted device:
//! - windowed download with CRC validation producing a staged image file
//! - flash, validity, version, commit and activation calls in upgrade order
//! - status reporting before and after the bank switch
//! - reboot-only devices without an upgrade service
//!
//! Run with: `cargo test --test upgrade_flow`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use onubank::remote::{
    METHOD_GET_ENV, METHOD_IMG_ACTIVATE, METHOD_REBOOT, METHOD_SET_ENV, METHOD_WRITE_IMG,
};
use onubank::{BankId, ImageManager, ImgConfig, ManagerError, RemoteCall, RemoteError};

// ============================================================================
// Scripted Device
// ============================================================================

/// One recorded flash request.
#[derive(Debug, Clone)]
struct FlashRequest {
    bank: String,
    image_name: String,
    noreboot: bool,
}

/// Scripted device standing in for the remote upgrade and system services.
///
/// Mirrors the device side of each call: the bulk query answers from an
/// in-memory variable map, variable writes merge into it, activation rewrites
/// the shared active bank variable, and flash and reboot requests are
/// recorded for assertions.
struct FakeDevice {
    env: Mutex<serde_json::Map<String, Value>>,
    env_reads: AtomicUsize,
    flashes: Mutex<Vec<FlashRequest>>,
    reboots: AtomicUsize,
    degraded: bool,
}

impl FakeDevice {
    /// Device freshly booted from bank A, with bank B still empty.
    fn booted_from_a() -> Self {
        let mut env = serde_json::Map::new();
        env.insert("message".to_string(), json!("OK"));
        env.insert("active_bank".to_string(), json!("A"));
        env.insert("commit_bank".to_string(), json!("A"));
        env.insert("img_validA".to_string(), json!("true"));
        env.insert("img_versionA".to_string(), json!("7.9.0"));
        Self {
            env: Mutex::new(env),
            env_reads: AtomicUsize::new(0),
            flashes: Mutex::new(Vec::new()),
            reboots: AtomicUsize::new(0),
            degraded: false,
        }
    }

    /// Device exposing only the system reboot method.
    fn reboot_only() -> Self {
        Self {
            env: Mutex::new(serde_json::Map::new()),
            env_reads: AtomicUsize::new(0),
            flashes: Mutex::new(Vec::new()),
            reboots: AtomicUsize::new(0),
            degraded: true,
        }
    }

    fn env_reads(&self) -> usize {
        self.env_reads.load(Ordering::SeqCst)
    }

    fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl RemoteCall for FakeDevice {
    fn call(
        &self,
        target: &str,
        method: &str,
        args: Option<&Value>,
        _timeout: Duration,
    ) -> Result<Value, RemoteError> {
        match method {
            METHOD_GET_ENV => {
                if self.degraded {
                    return Err(RemoteError::MethodNotFound {
                        target: target.to_string(),
                        method: method.to_string(),
                    });
                }
                self.env_reads.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Object(self.env.lock().clone()))
            }
            METHOD_SET_ENV => {
                if let Some(Value::Object(fields)) = args {
                    let mut env = self.env.lock();
                    for (name, value) in fields {
                        env.insert(name.clone(), value.clone());
                    }
                }
                Ok(json!({ "retval": 0 }))
            }
            METHOD_IMG_ACTIVATE => {
                if let Some(bank) = args.and_then(|a| a.get("bank")).and_then(Value::as_str) {
                    self.env
                        .lock()
                        .insert("active_bank".to_string(), json!(bank));
                }
                Ok(json!({ "retval": 0 }))
            }
            METHOD_WRITE_IMG => {
                let args = args.cloned().unwrap_or(Value::Null);
                self.flashes.lock().push(FlashRequest {
                    bank: args["bank"].as_str().unwrap_or("").to_string(),
                    image_name: args["image_name"].as_str().unwrap_or("").to_string(),
                    noreboot: args["noreboot"].as_bool().unwrap_or(false),
                });
                Ok(json!({ "write_retval": 0 }))
            }
            METHOD_REBOOT => {
                self.reboots.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
            _ => Ok(json!({ "retval": 0 })),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Window payload size used by the transfer tests.
const WINDOW_LEN: usize = 992;

/// Deterministic image contents of the given length.
fn image_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Manager staging downloads under the given temporary directory.
fn start_manager(device: Arc<FakeDevice>, temp: &TempDir) -> ImageManager {
    let config = ImgConfig::default().with_image_path(temp.path().join("firmware.img"));
    ImageManager::start(device, config).expect("manager should start against the scripted device")
}

/// Feeds the whole image through the windowed download, in order.
fn send_windows(manager: &mut ImageManager, image: &[u8]) {
    for (nr, window) in image.chunks(WINDOW_LEN).enumerate() {
        manager
            .handle_window(nr as u32, window)
            .expect("in-order window should be accepted");
    }
}

// ============================================================================
// Integration Tests
// ============================================================================

/// Full managed upgrade: download an image, flash it into the inactive bank,
/// mark it valid, record its version, commit and activate it, and check the
/// final report.
#[test]
fn test_full_upgrade_flow() {
    let temp = TempDir::new().unwrap();
    let device = Arc::new(FakeDevice::booted_from_a());
    let mut manager = start_manager(Arc::clone(&device), &temp);

    assert!(!manager.is_reboot_only());

    // The device boots from bank A, so B is the upgrade target.
    assert!(manager.active_get(BankId::A).unwrap());
    assert!(!manager.active_get(BankId::B).unwrap());

    // Receive the image over windows and validate it.
    let image = image_bytes(5 * WINDOW_LEN + 137);
    manager.download_start(image.len() as u32).unwrap();
    send_windows(&mut manager, &image);
    let staged = manager
        .download_end(image.len() as u32, onubank::crc::checksum(&image))
        .unwrap();

    assert_eq!(staged.size as usize, image.len());
    assert_eq!(std::fs::read(&staged.path).unwrap(), image);

    // Flash, record the new image's attributes, commit and switch.
    manager.upgrade(BankId::B, &staged.path).unwrap();
    manager.valid_set(BankId::B, true).unwrap();
    manager.version_set(BankId::B, "7.10.1").unwrap();
    manager.commit_set(BankId::B).unwrap();
    manager.active_set(BankId::B).unwrap();

    let flashes = device.flashes.lock();
    assert_eq!(flashes.len(), 1, "exactly one flash request should be made");
    assert_eq!(flashes[0].bank, "B");
    assert_eq!(flashes[0].image_name, "firmware.img");
    assert!(flashes[0].noreboot, "flashing must not reboot the device");
    drop(flashes);

    let report = manager.report().unwrap();
    let [a, b] = &report.banks;

    assert!(!a.active, "bank A should be inactive after the switch");
    assert!(a.valid);
    assert_eq!(a.version, "7.9.0");

    assert!(b.active, "bank B should be active after the switch");
    assert!(b.committed);
    assert!(b.valid);
    assert_eq!(b.version, "7.10.1");

    manager.reboot().unwrap();
    assert_eq!(device.reboots(), 1);
}

/// A full report is served from a single bulk variable read.
#[test]
fn test_report_uses_one_bulk_read() {
    let temp = TempDir::new().unwrap();
    let device = Arc::new(FakeDevice::booted_from_a());
    let manager = start_manager(Arc::clone(&device), &temp);

    let after_probe = device.env_reads();
    manager.report().unwrap();

    // Eight attribute lookups, one query.
    assert_eq!(device.env_reads(), after_probe + 1);
}

/// An interrupted transfer can be abandoned and restarted from scratch.
#[test]
fn test_interrupted_download_restarts() {
    let temp = TempDir::new().unwrap();
    let device = Arc::new(FakeDevice::booted_from_a());
    let mut manager = start_manager(device, &temp);

    let image = image_bytes(3 * WINDOW_LEN);
    manager.download_start(image.len() as u32).unwrap();
    manager.handle_window(0, &image[..WINDOW_LEN]).unwrap();

    // The peer gives up mid-transfer.
    manager.download_stop();
    assert!(!manager.download_active());

    // A fresh attempt transfers the whole image again.
    manager.download_start(image.len() as u32).unwrap();
    send_windows(&mut manager, &image);
    let staged = manager
        .download_end(image.len() as u32, onubank::crc::checksum(&image))
        .unwrap();
    assert_eq!(std::fs::read(&staged.path).unwrap(), image);
}

/// A download failing validation leaves the session free for a retry.
#[test]
fn test_rejected_download_frees_session() {
    let temp = TempDir::new().unwrap();
    let device = Arc::new(FakeDevice::booted_from_a());
    let mut manager = start_manager(device, &temp);

    let image = image_bytes(2 * WINDOW_LEN);
    manager.download_start(image.len() as u32).unwrap();
    send_windows(&mut manager, &image);

    let err = manager
        .download_end(image.len() as u32, 0xDEAD_BEEF)
        .unwrap_err();
    assert!(matches!(err, ManagerError::Download(_)));
    assert!(!manager.download_active());

    // The rejected transfer does not block the next attempt.
    manager.download_start(image.len() as u32).unwrap();
    send_windows(&mut manager, &image);
    manager
        .download_end(image.len() as u32, onubank::crc::checksum(&image))
        .unwrap();
}

/// Download progress is reported once per received MiB.
#[test]
fn test_download_progress_reported() {
    let temp = TempDir::new().unwrap();
    let device = Arc::new(FakeDevice::booted_from_a());
    let mut manager = start_manager(device, &temp);

    let reports = Arc::new(AtomicUsize::new(0));
    let reports_clone = Arc::clone(&reports);
    manager.set_download_progress(Box::new(move |_, _| {
        reports_clone.fetch_add(1, Ordering::SeqCst);
    }));

    let image = image_bytes(3 * 1024 * 1024);
    manager.download_start(image.len() as u32).unwrap();
    for (nr, window) in image.chunks(64 * 1024).enumerate() {
        manager.handle_window(nr as u32, window).unwrap();
    }
    manager
        .download_end(image.len() as u32, onubank::crc::checksum(&image))
        .unwrap();

    assert_eq!(reports.load(Ordering::SeqCst), 3);
}

/// Devices without an upgrade service still probe successfully, refuse every
/// upgrade operation and keep the reboot path working.
#[test]
fn test_reboot_only_device() {
    let temp = TempDir::new().unwrap();
    let device = Arc::new(FakeDevice::reboot_only());
    let manager = start_manager(Arc::clone(&device), &temp);

    assert!(manager.is_reboot_only());
    assert_eq!(manager.target(), "system");

    assert!(matches!(
        manager.active_get(BankId::A),
        Err(ManagerError::Unsupported)
    ));
    assert!(matches!(
        manager.upgrade(BankId::B, &temp.path().join("any.img")),
        Err(ManagerError::Unsupported)
    ));
    assert!(matches!(manager.report(), Err(ManagerError::Unsupported)));

    manager.reboot().unwrap();
    assert_eq!(device.reboots(), 1);
}
