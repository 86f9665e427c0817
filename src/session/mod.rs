//! Session persistence
//!
//! A session is the set of devices, nodes and samples captured in one run,
//! together with the sampling period. Sessions are saved as text (see
//! [`codec`]) under an automatically numbered filename (`data.txt`,
//! `data_1.txt`, ...) so earlier captures are never overwritten.
//!
//! After writing, the file length on disk is compared with the encoded
//! length; a mismatch removes the file and reports
//! [`DaqError::WriteVerification`].

pub mod codec;

pub use codec::{decode, encode};

use crate::config::SessionSettings;
use crate::error::{DaqError, Result, ResultExt};
use crate::types::DeviceInfo;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Saved or loaded capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Sampling period in milliseconds
    pub sampling_period_ms: u32,
    /// Devices in capture order
    pub devices: Vec<DeviceInfo>,
}

impl Session {
    pub fn new(sampling_period_ms: u32, devices: Vec<DeviceInfo>) -> Self {
        Self {
            sampling_period_ms,
            devices,
        }
    }

    /// Total number of samples across all devices
    pub fn total_samples(&self) -> usize {
        self.devices.iter().map(DeviceInfo::total_samples).sum()
    }
}

/// Candidate filename for attempt `n` (`base.ext`, then `base_n.ext`)
pub fn numbered_file_name(base_name: &str, extension: &str, n: u32) -> String {
    let suffix = if n == 0 {
        String::new()
    } else {
        format!("_{}", n)
    };
    if extension.is_empty() {
        format!("{}{}", base_name, suffix)
    } else {
        format!("{}{}.{}", base_name, suffix, extension)
    }
}

/// Create the first numbered file in `dir` that does not exist yet
pub fn create_unique_file(dir: &Path, base_name: &str, extension: &str) -> Result<(PathBuf, File)> {
    for n in 0..=u32::MAX {
        let path = dir.join(numbered_file_name(base_name, extension, n));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(DaqError::Io(e).with_context(format!("Failed to create {:?}", path)))
            }
        }
    }
    Err(DaqError::InvalidState(format!(
        "no free filename for '{}' in {:?}",
        base_name, dir
    )))
}

/// Check that the file at `path` holds exactly `expected` bytes
pub fn verify_written(path: &Path, expected: u64) -> Result<()> {
    let actual = std::fs::metadata(path)
        .with_context(|| format!("Failed to read back {:?}", path))?
        .len();
    if actual != expected {
        return Err(DaqError::WriteVerification {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Encode and save a session, returning the path written
pub fn save_session(session: &Session, settings: &SessionSettings) -> Result<PathBuf> {
    let contents = encode(session)?;

    std::fs::create_dir_all(&settings.save_dir)
        .with_context(|| format!("Failed to create {:?}", settings.save_dir))?;
    let (path, mut file) =
        create_unique_file(&settings.save_dir, &settings.base_name, &settings.extension)?;

    tracing::info!("Saving data to {:?}", path);
    let written = file
        .write_all(contents.as_bytes())
        .and_then(|_| file.sync_all())
        .with_context(|| format!("Failed to write {:?}", path));
    drop(file);

    let result = written.and_then(|_| verify_written(&path, contents.len() as u64));
    if let Err(e) = result {
        if let Err(remove_err) = std::fs::remove_file(&path) {
            tracing::warn!("Failed to remove incomplete file {:?}: {}", path, remove_err);
        }
        return Err(e);
    }

    tracing::info!("Successfully written {} bytes to {:?}", contents.len(), path);
    Ok(path)
}

/// Read and decode a saved session
pub fn load_session(path: impl AsRef<Path>) -> Result<Session> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    decode(&text).map_err(|e| e.with_context(format!("Invalid session file {:?}", path)))
}
