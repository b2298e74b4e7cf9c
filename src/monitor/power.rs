//! Platform power-state polling.
//!
//! Reads a sysfs-style indicator file when the platform provides one.
//! Best-effort: an absent or unreadable file degrades to `Unavailable` and
//! the supervisor periodically reinitializes the handle.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Mutex;

/// Indicator values from the platform PM driver: 0 = none, 1 = on,
/// anything else = heading into / in suspend.
const STATE_NONE: i32 = 0;
const STATE_ON: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Active,
    Suspended,
    Unavailable,
}

pub struct PowerMonitor {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl PowerMonitor {
    pub fn new(path: &str) -> Self {
        let path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// (Re)open the indicator file.
    pub fn init(&self) {
        let Some(path) = &self.path else { return };
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            match File::open(path) {
                Ok(f) => *guard = Some(f),
                Err(_) => {
                    tracing::debug!(path = %path.display(), "power management not available");
                }
            }
        }
    }

    pub fn close(&self) {
        self.file.lock().unwrap().take();
    }

    /// Read the current state. A read failure drops the handle so the next
    /// `init` starts fresh.
    pub fn read(&self) -> PowerState {
        let mut guard = self.file.lock().unwrap();
        let Some(file) = guard.as_mut() else {
            return PowerState::Unavailable;
        };
        let mut text = String::new();
        let ok = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut text))
            .is_ok();
        if !ok || text.trim().is_empty() {
            tracing::warn!("power state read failed, dropping handle");
            guard.take();
            return PowerState::Unavailable;
        }
        match text.trim().parse::<i32>() {
            Ok(STATE_NONE) | Ok(STATE_ON) => PowerState::Active,
            Ok(_) => PowerState::Suspended,
            Err(_) => PowerState::Active,
        }
    }
}
