//! Shared wire types for the irradiation-control processes.
//!
//! Every process exposes four channels (`log`, `cmd`, `data`, `event`) that
//! carry newline-delimited JSON. The payload shapes live here so that
//! servers, interpreters and consoles agree on them without depending on
//! each other.

pub mod descriptor;
pub mod message;

pub use descriptor::{ChannelKind, ProcessDescriptor};
pub use message::{
    Command, DataPacket, EventRecord, PacketMeta, RawCommand, Reply, ReplyType, ScanPass,
    ScanProgress,
};
