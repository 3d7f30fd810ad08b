//! Windowed firmware image download.
//!
//! The management protocol transfers an image as a sequence of numbered
//! windows that must arrive strictly in order; there is no reordering or
//! retransmission buffering at this layer. This module provides:
//! - the per-device transfer state machine (open, append, validate, abort)
//! - incremental CRC32 accumulation, one fold per window
//! - size and checksum validation before an image is released for flashing
//! - progress reporting once per completed MiB

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::DEFAULT_IMAGE_PATH;
use crate::crc;

/// Progress callback for image downloads.
/// Arguments: (bytes_received, expected_size)
pub type DownloadProgressCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

/// Errors returned by the windowed download state machine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// A transfer is already open; it must finish or be stopped first.
    #[error("a download is already in progress")]
    Busy,

    /// No transfer is open.
    #[error("no download in progress")]
    NotStarted,

    /// All expected bytes have already been received.
    #[error("image already complete: {received} of {expected} bytes")]
    TransferComplete { received: u32, expected: u32 },

    /// The window does not fit into the remaining image space.
    #[error("window of {length} bytes exceeds the {remaining} bytes left")]
    WindowOverflow { length: usize, remaining: u32 },

    /// The window arrived out of sequence.
    #[error("wrong window number: {got} (expected: {expected})")]
    WindowOutOfOrder { got: u32, expected: u32 },

    /// The size declared at the end differs from the size declared at start.
    #[error("incorrect image size definition: declared {declared}, expected {expected}")]
    SizeMismatch { declared: u32, expected: u32 },

    /// The transfer ended before all bytes arrived.
    #[error("incomplete image: received {received} of {expected} bytes")]
    Incomplete { received: u32, expected: u32 },

    /// The transferred bytes do not match the declared checksum.
    #[error("incorrect CRC: declared {declared:#010x}, calculated {calculated:#010x}")]
    CrcMismatch { declared: u32, calculated: u32 },

    /// Failed to create the staging directory.
    #[error("failed to create directory {path}: {source}")]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// Failed to create or write the staged image file.
    #[error("failed to write {path}: {source}")]
    WriteFailed { path: PathBuf, source: io::Error },
}

/// A fully transferred and validated image, ready to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    /// Path of the staged image file.
    pub path: PathBuf,

    /// Image size in bytes.
    pub size: u32,

    /// CRC32 of the image in transmitted (complemented) form.
    pub crc: u32,
}

struct Transfer {
    file: File,
    expected_size: u32,
    bytes_received: u32,
    next_window: u32,
    crc: u32,
}

/// Windowed download state machine staging one image at a time.
///
/// A session owns the staged file for the duration of a transfer. Only one
/// transfer may be open at a time; opening a second fails with
/// [`DownloadError::Busy`] and leaves the running one untouched.
/// [`finalize`](Self::finalize) closes the transfer whether or not its
/// checks pass, and [`abort`](Self::abort) is safe in any state.
pub struct DownloadSession {
    path: PathBuf,
    transfer: Option<Transfer>,
    on_progress: Option<DownloadProgressCallback>,
}

impl Default for DownloadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadSession {
    /// Creates a session staging images at the default location.
    pub fn new() -> Self {
        Self::with_path(DEFAULT_IMAGE_PATH)
    }

    /// Creates a session staging images at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            transfer: None,
            on_progress: None,
        }
    }

    /// Sets the progress callback invoked as whole MiBs arrive.
    pub fn with_progress(mut self, callback: DownloadProgressCallback) -> Self {
        self.set_progress(callback);
        self
    }

    /// Replaces the progress callback.
    pub fn set_progress(&mut self, callback: DownloadProgressCallback) {
        self.on_progress = Some(callback);
    }

    /// Location where images are staged.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a transfer is currently open.
    pub fn is_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Opens a new transfer expecting `size` bytes.
    ///
    /// Creates the staging file, truncating any previous image, and resets
    /// the window counter and checksum accumulator.
    pub fn begin(&mut self, size: u32) -> Result<(), DownloadError> {
        if self.transfer.is_some() {
            return Err(DownloadError::Busy);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| DownloadError::CreateDirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file = File::create(&self.path).map_err(|e| DownloadError::WriteFailed {
            path: self.path.clone(),
            source: e,
        })?;

        self.transfer = Some(Transfer {
            file,
            expected_size: size,
            bytes_received: 0,
            next_window: 0,
            crc: crc::INIT,
        });
        info!(size, path = %self.path.display(), "image download started");
        Ok(())
    }

    /// Appends one window at the given sequence number.
    ///
    /// Windows are accepted only in order and only while bytes remain; a
    /// rejected window leaves the transfer state untouched so the peer can
    /// retry it.
    pub fn write_window(&mut self, window_nr: u32, data: &[u8]) -> Result<(), DownloadError> {
        let transfer = self.transfer.as_mut().ok_or(DownloadError::NotStarted)?;

        if transfer.bytes_received >= transfer.expected_size {
            return Err(DownloadError::TransferComplete {
                received: transfer.bytes_received,
                expected: transfer.expected_size,
            });
        }
        let remaining = transfer.expected_size - transfer.bytes_received;
        if data.len() as u64 > remaining as u64 {
            return Err(DownloadError::WindowOverflow {
                length: data.len(),
                remaining,
            });
        }
        if window_nr != transfer.next_window {
            return Err(DownloadError::WindowOutOfOrder {
                got: window_nr,
                expected: transfer.next_window,
            });
        }

        transfer
            .file
            .write_all(data)
            .map_err(|e| DownloadError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })?;

        let before = transfer.bytes_received;
        transfer.bytes_received += data.len() as u32;
        transfer.next_window += 1;
        transfer.crc = crc::update(transfer.crc, data);

        // Report once per completed whole MiB.
        if (transfer.bytes_received >> 20) > (before >> 20) {
            info!(
                received_mib = transfer.bytes_received >> 20,
                total_mib = transfer.expected_size >> 20,
                "image download progress"
            );
            if let Some(ref callback) = self.on_progress {
                callback(transfer.bytes_received, transfer.expected_size);
            }
        }
        Ok(())
    }

    /// Validates the finished transfer against the peer's declared size and
    /// checksum, returning the staged image on success.
    ///
    /// The transfer closes whichever way the checks go; a rejected image
    /// must not leave the session busy. The staged file stays on disk for
    /// inspection after a failure.
    pub fn finalize(
        &mut self,
        declared_size: u32,
        declared_crc: u32,
    ) -> Result<StagedImage, DownloadError> {
        let transfer = self.transfer.take().ok_or(DownloadError::NotStarted)?;

        if transfer.expected_size != declared_size {
            let err = DownloadError::SizeMismatch {
                declared: declared_size,
                expected: transfer.expected_size,
            };
            warn!(%err, "image download rejected");
            return Err(err);
        }
        if transfer.bytes_received != transfer.expected_size {
            let err = DownloadError::Incomplete {
                received: transfer.bytes_received,
                expected: transfer.expected_size,
            };
            warn!(%err, "image download rejected");
            return Err(err);
        }
        let calculated = crc::finalize(transfer.crc);
        if calculated != declared_crc {
            let err = DownloadError::CrcMismatch {
                declared: declared_crc,
                calculated,
            };
            warn!(%err, "image download rejected");
            return Err(err);
        }

        info!(
            size = declared_size,
            crc = format_args!("{calculated:#010x}"),
            path = %self.path.display(),
            "image download complete"
        );
        Ok(StagedImage {
            path: self.path.clone(),
            size: declared_size,
            crc: calculated,
        })
    }

    /// Aborts any open transfer, closing the staged file.
    ///
    /// Idempotent; safe to call before the first transfer and after a
    /// finalized one.
    pub fn abort(&mut self) {
        if self.transfer.take().is_some() {
            info!(path = %self.path.display(), "image download aborted");
        }
    }
}
