//! Per-process configuration, constructed once at start and passed down.

use std::path::PathBuf;
use std::time::Duration;

/// What to do when a live previous instance of the same role is found on
/// this host at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Refuse to start; the launcher asks the operator and retries.
    #[default]
    Refuse,
    /// Terminate the previous instance, then start.
    Kill,
    /// Start anyway. Logged as a risk.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Process name, used in the descriptor, replies and telemetry.
    pub name: String,
    /// Inclusive port range the four channels bind into.
    pub min_port: u16,
    pub max_port: u16,
    /// Bind attempts per channel before giving up.
    pub max_bind_tries: u16,
    /// High-water mark: bounded outstanding messages per publish queue.
    pub hwm: usize,
    /// Directory holding the discovery descriptor.
    pub run_dir: PathBuf,
    pub orphan_policy: OrphanPolicy,
    /// Upstream `data` channel addresses (`host:port`) to subscribe to.
    pub upstream_data: Vec<String>,
    /// Upstream `event` channel addresses to subscribe to.
    pub upstream_events: Vec<String>,
    /// Worker supervision poll interval.
    pub watch_interval: Duration,
}

impl CoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_port: 8000,
            max_port: 9000,
            max_bind_tries: 100,
            hwm: 100,
            run_dir: std::env::temp_dir(),
            orphan_policy: OrphanPolicy::default(),
            upstream_data: Vec::new(),
            upstream_events: Vec::new(),
            watch_interval: Duration::from_secs(1),
        }
    }

    /// Well-known per-host location of this role's discovery descriptor.
    pub fn descriptor_path(&self) -> PathBuf {
        self.run_dir.join(format!(".irrad-{}.pid.yaml", self.name))
    }
}
