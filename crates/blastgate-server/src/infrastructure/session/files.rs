//! Per-device session directories on disk.
//!
//! Each device gets `<root>/<instance_key>/`, handed to the transport for its
//! credentials.  A directory holding credential files marks a device whose
//! session can be restored without pairing again.

use std::io;
use std::path::{Path, PathBuf};

use blastgate_core::DeviceKey;
use tracing::debug;

/// File-name fragments the transport uses for credential state.
const CREDENTIAL_MARKERS: [&str; 2] = ["creds", "app-state"];

#[derive(Debug, Clone)]
pub struct SessionFiles {
    root: PathBuf,
}

impl SessionFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, key: &DeviceKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Creates the device directory if needed and returns it.
    pub fn prepare(&self, key: &DeviceKey) -> io::Result<PathBuf> {
        let dir = self.dir_for(key);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// `true` if the device directory holds any credential file.
    pub fn has_credentials(&self, key: &DeviceKey) -> bool {
        let Ok(entries) = std::fs::read_dir(self.dir_for(key)) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            CREDENTIAL_MARKERS.iter().any(|marker| name.contains(marker))
        })
    }

    /// Deletes the device directory.  Returns whether anything was removed.
    pub fn purge(&self, key: &DeviceKey) -> io::Result<bool> {
        let dir = self.dir_for(key);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("purged session files for {key}");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
