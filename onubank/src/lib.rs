//! OnuBank - Dual-bank firmware image management for PON optical network units.
//!
//! This library implements the device side of a managed firmware upgrade:
//! receiving an image over a windowed, CRC-checked download, flashing it into
//! one of two firmware banks, and steering which bank the device boots,
//! commits to and considers valid. Bank state is persisted in bootloader
//! variables owned by a remote upgrade service; all device interaction goes
//! through the [`remote::RemoteCall`] trait so the library never links a
//! concrete bus transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ImageManager                         │
//! │                                                           │
//! │  DownloadSession ──► staged image file                    │
//! │  (windows + CRC32)                                        │
//! │                                                           │
//! │  VarStore ─────────► active / commit / valid / version    │
//! │  (2s read cache)     variables                            │
//! │                                                           │
//! │  flash / activate / reboot calls                          │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ RemoteCall
//!                             ▼
//!                     device control bus
//! ```
//!
//! # Example
//!
//! ```ignore
//! use onubank::{BankId, ImageManager, ImgConfig};
//!
//! let manager = ImageManager::start(transport, ImgConfig::default())?;
//! manager.download_start(image_size)?;
//! for (nr, window) in windows.enumerate() {
//!     manager.handle_window(nr as u32, window)?;
//! }
//! let staged = manager.download_end(image_size, image_crc)?;
//!
//! manager.upgrade(BankId::B, &staged.path)?;
//! manager.valid_set(BankId::B, true)?;
//! manager.active_set(BankId::B)?;
//! manager.reboot()?;
//! ```

pub mod bank;
pub mod config;
pub mod crc;
pub mod download;
pub mod manager;
pub mod remote;
pub mod store;

pub use bank::{BankId, BankIdError};
pub use config::{ConfigError, ConfigFile, ImgConfig};
pub use download::{DownloadError, DownloadSession, StagedImage};
pub use manager::{BankReport, BankStatus, ImageManager, ManagerError, ManagerResult};
pub use remote::{RemoteCall, RemoteError};
pub use store::{StoreError, VarStore};
