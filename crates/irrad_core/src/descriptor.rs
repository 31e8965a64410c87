//! Discovery-descriptor file and orphan detection.
//!
//! The descriptor (pid, name, channel ports) is written as YAML when a
//! process starts and removed on clean shutdown. A descriptor left behind by
//! a dead process is cleaned up silently; one whose pid is still alive marks
//! an orphaned previous instance of the same role.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use irrad_types::ProcessDescriptor;

use crate::error::{CoreError, CoreResult};

pub struct DescriptorFile {
    path: PathBuf,
}

impl DescriptorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the pid of a live previous instance recorded at this path.
    ///
    /// A stale or unreadable descriptor is removed and `None` is returned.
    pub fn check_orphan(&self) -> Option<u32> {
        if !self.path.exists() {
            return None;
        }
        match Self::read(&self.path) {
            Ok(descriptor) if is_process_alive(descriptor.pid) => Some(descriptor.pid),
            Ok(descriptor) => {
                info!(
                    pid = descriptor.pid,
                    "removing stale descriptor of dead process"
                );
                let _ = fs::remove_file(&self.path);
                None
            }
            Err(e) => {
                warn!(error = %e, "removing unreadable descriptor");
                let _ = fs::remove_file(&self.path);
                None
            }
        }
    }

    pub fn write(&self, descriptor: &ProcessDescriptor) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(descriptor)
            .map_err(|e| CoreError::Descriptor(e.to_string()))?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    pub fn read(path: &Path) -> CoreResult<ProcessDescriptor> {
        let raw = fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| CoreError::Descriptor(e.to_string()))
    }

    pub fn remove(&self) -> CoreResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Check a pid with signal 0; no signal is delivered.
pub fn is_process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // Permission denied and friends mean the process exists.
        Err(_) => true,
    }
}

/// Ask a live orphan to terminate.
pub fn terminate_process(pid: u32) -> CoreResult<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| CoreError::Descriptor(format!("could not terminate pid {pid}: {e}")))
}
