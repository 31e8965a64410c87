//! Process-discovery descriptor.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The four independent message channels every process exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Log,
    Cmd,
    Data,
    Event,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Log,
        ChannelKind::Cmd,
        ChannelKind::Data,
        ChannelKind::Event,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Log => "log",
            ChannelKind::Cmd => "cmd",
            ChannelKind::Data => "data",
            ChannelKind::Event => "event",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published to a well-known per-host location while a process is alive so
/// launchers and consoles can find its ports and detect orphaned instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub pid: u32,
    pub name: String,
    pub ports: BTreeMap<ChannelKind, u16>,
}

impl ProcessDescriptor {
    pub fn port(&self, kind: ChannelKind) -> Option<u16> {
        self.ports.get(&kind).copied()
    }
}
