//! Role seam between the generic process core and a concrete process.

use async_trait::async_trait;
use serde_json::Value;

use irrad_types::{DataPacket, EventRecord};

use crate::dispatch::ReplyHandle;

/// Behavior a concrete process plugs into its [`crate::ProcessCore`].
///
/// The core guarantees `handle_cmd` runs for at most one command at a time.
/// Handlers reply through the consumed-by-value `reply` handle; dropping it
/// lets the core send a generic success reply instead.
#[async_trait]
pub trait RoleHandler: Send + Sync + 'static {
    /// Handle one command addressed to `target`. Returning an error turns
    /// into an error reply carrying the error's message.
    async fn handle_cmd(
        &self,
        target: &str,
        cmd: &str,
        data: Option<Value>,
        reply: ReplyHandle,
    ) -> anyhow::Result<()>;

    /// Handle one packet from an upstream `data` subscription. Returned
    /// packets are re-published on this process' own data channel.
    async fn handle_data(&self, _packet: DataPacket) -> Vec<DataPacket> {
        Vec::new()
    }

    /// Handle one record from an upstream `event` subscription.
    async fn handle_event(&self, _record: EventRecord) {}

    /// Runs exactly once after all workers have stopped, before the process
    /// exits.
    async fn clean_up(&self) {}
}
