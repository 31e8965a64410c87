//! Error types for the process core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no free port in range {min}-{max} after {tries} attempts")]
    PortsExhausted { min: u16, max: u16, tries: u16 },

    #[error("descriptor error: {0}")]
    Descriptor(String),

    #[error("a previous '{name}' instance is still alive with pid {pid}")]
    OrphanAlive { name: String, pid: u32 },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid address '{0}', expected 'host:port'")]
    BadAddress(String),

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

pub type CoreResult<T> = Result<T, CoreError>;
