//! Command, reply, telemetry and event message shapes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command addressed to one device/role of a process.
///
/// `target` names the device or role the command is meant for, `cmd` the
/// operation. At most one command is processed at a time per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub target: String,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Command {
    pub fn new(target: impl Into<String>, cmd: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            target: target.into(),
            cmd: cmd.into(),
            data,
        }
    }
}

/// Raw decode of an incoming command line.
///
/// `target` and `cmd` stay optional here so the dispatch loop can validate
/// their presence and answer with an error reply before any handler runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommand {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyType {
    Standard,
    Error,
}

/// The single reply produced for every received command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Echo of the command string this reply answers.
    pub reply: String,
    #[serde(rename = "type")]
    pub kind: ReplyType,
    /// The target the command addressed.
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Reply {
    pub fn standard(
        reply: impl Into<String>,
        sender: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            reply: reply.into(),
            kind: ReplyType::Standard,
            sender: sender.into(),
            data,
        }
    }

    pub fn error(reply: impl Into<String>, sender: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            reply: reply.into(),
            kind: ReplyType::Error,
            sender: sender.into(),
            data,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ReplyType::Error
    }
}

/// Metadata attached to every published data packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketMeta {
    /// Unix timestamp in seconds.
    pub timestamp: f64,
    /// Name of the publishing process.
    pub name: String,
    /// Payload discriminator, e.g. `raw_data` or `stage`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// One telemetry packet on the `data` channel. Packets are immutable once
/// published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPacket {
    pub meta: PacketMeta,
    pub data: Value,
}

impl DataPacket {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, data: Value) -> Self {
        Self {
            meta: PacketMeta {
                timestamp: unix_timestamp(),
                name: name.into(),
                kind: kind.into(),
            },
            data,
        }
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Broadcast on the `event` channel whenever an event entity changes state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Server whose registry owns the event.
    pub server: String,
    /// Event name, e.g. `BeamOff`.
    pub event: String,
    pub active: bool,
    pub disabled: bool,
}

/// Tag distinguishing a numbered full-raster pass from an ad-hoc single-row
/// re-scan. On the wire the single-row case keeps the established `-1`
/// sentinel in the `scan` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPass {
    Full(u32),
    SingleRow,
}

impl ScanPass {
    pub fn number(self) -> i64 {
        match self {
            ScanPass::Full(n) => i64::from(n),
            ScanPass::SingleRow => -1,
        }
    }
}

/// Scan progress payloads published as `stage` packets on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanProgress {
    ScanInit {
        n_rows: u32,
        /// Row separation in mm.
        row_sep: f64,
    },
    ScanStart {
        /// Pass number, `-1` for a standalone single-row scan.
        scan: i64,
        row: u32,
        /// Horizontal axis speed in mm/s.
        speed: f64,
        /// Horizontal axis acceleration in mm/s^2.
        accel: f64,
        x_start: f64,
        y_start: f64,
    },
    ScanStop {
        x_stop: f64,
        y_stop: f64,
    },
    ScanFinished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_type_uses_wire_spelling() {
        let reply = Reply::standard("move_abs", "stage", None);
        let encoded = serde_json::to_value(&reply).unwrap();
        assert_eq!(encoded["type"], "STANDARD");
        assert_eq!(encoded["reply"], "move_abs");

        let err = Reply::error("move_abs", "stage", Some(json!("boom")));
        assert_eq!(serde_json::to_value(&err).unwrap()["type"], "ERROR");
    }

    #[test]
    fn raw_command_tolerates_missing_fields() {
        let raw: RawCommand = serde_json::from_str(r#"{"cmd": "start"}"#).unwrap();
        assert!(raw.target.is_none());
        assert_eq!(raw.cmd.as_deref(), Some("start"));

        let raw: RawCommand = serde_json::from_str("{}").unwrap();
        assert!(raw.target.is_none() && raw.cmd.is_none());
    }

    #[test]
    fn scan_pass_keeps_single_row_sentinel() {
        assert_eq!(ScanPass::Full(3).number(), 3);
        assert_eq!(ScanPass::SingleRow.number(), -1);
    }

    #[test]
    fn scan_progress_is_tagged_by_status() {
        let progress = ScanProgress::ScanStart {
            scan: -1,
            row: 4,
            speed: 20.0,
            accel: 100.0,
            x_start: 0.0,
            y_start: -16.0,
        };
        let encoded = serde_json::to_value(&progress).unwrap();
        assert_eq!(encoded["status"], "scan_start");
        assert_eq!(encoded["scan"], -1);

        let decoded: ScanProgress = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, progress);
    }
}
