//! Process core of the irradiation-control framework.
//!
//! Every node (device server, data interpreter, console) runs a
//! [`ProcessCore`] that binds the four per-process channels, dispatches
//! commands to a [`RoleHandler`], bridges telemetry from producer tasks onto
//! the externally bound sockets, and supervises its workers until a
//! cooperative shutdown completes.

pub mod client;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fanout;
pub mod logpub;
pub mod net;
pub mod process;
pub mod role;
pub mod signals;
pub mod stream;

pub use client::{Commander, Subscription};
pub use config::{CoreConfig, OrphanPolicy};
pub use descriptor::DescriptorFile;
pub use dispatch::ReplyHandle;
pub use error::{CoreError, CoreResult};
pub use events::{EventKind, EventRegistry};
pub use fanout::Publisher;
pub use logpub::LogPublisher;
pub use process::ProcessCore;
pub use role::RoleHandler;
