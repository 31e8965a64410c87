//! Command channel: request/reply dispatch loop.
//!
//! The command listener serves one connection at a time and one command at a
//! time. Every decoded line produces exactly one reply line; while a command
//! is in flight the busy flag is set and no further line is read. A handler
//! that does not send an explicit reply gets a generic success reply echoing
//! the command name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use irrad_types::{RawCommand, Reply};

use crate::error::CoreResult;
use crate::role::RoleHandler;

/// One-shot reply capability handed to a command handler.
///
/// Consumed by value, so a handler can reply at most once. The handler may
/// move it into a spawned task and reply later; the dispatcher stays busy
/// until the reply arrives or the handle is dropped.
pub struct ReplyHandle {
    cmd: String,
    sender: String,
    tx: mpsc::Sender<Reply>,
}

impl ReplyHandle {
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Reply with success and an optional payload.
    pub fn standard(self, data: Option<Value>) {
        let _ = self.tx.try_send(Reply::standard(&self.cmd, &self.sender, data));
    }

    /// Reply with an error description.
    pub fn error(self, desc: impl Into<String>) {
        let reply = Reply::error(
            &self.cmd,
            &self.sender,
            Some(Value::String(desc.into())),
        );
        let _ = self.tx.try_send(reply);
    }
}

/// Serve the command channel until the stop token fires.
///
/// A transport failure on one commander connection only ends that
/// connection; the accept loop keeps serving. Only listener-level failures
/// end the worker.
pub async fn serve_commands(
    listener: TcpListener,
    name: String,
    busy: Arc<AtomicBool>,
    role: Arc<dyn RoleHandler>,
    token: CancellationToken,
) -> CoreResult<()> {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "commander connected");
                (stream, peer)
            }
        };

        if let Err(e) = serve_connection(stream, &name, &busy, &role, &token).await {
            warn!(%peer, error = %e, "commander connection lost");
        }
    }

    debug!("command dispatch stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    name: &str,
    busy: &AtomicBool,
    role: &Arc<dyn RoleHandler>,
    token: &CancellationToken,
) -> CoreResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        busy.store(true, Ordering::SeqCst);
        let reply = dispatch_line(&line, name, role).await;
        busy.store(false, Ordering::SeqCst);

        let mut encoded = serde_json::to_string(&reply)?;
        encoded.push('\n');
        write_half.write_all(encoded.as_bytes()).await?;
    }

    Ok(())
}

/// Decode one command line and produce its single reply.
async fn dispatch_line(line: &str, name: &str, role: &Arc<dyn RoleHandler>) -> Reply {
    let raw: RawCommand = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "undecodable command line");
            return Reply::error(
                "invalid",
                name,
                Some(Value::String(format!("undecodable command: {e}"))),
            );
        }
    };

    let (Some(target), Some(cmd)) = (raw.target, raw.cmd) else {
        warn!("command line missing target or cmd field");
        return Reply::error(
            "invalid",
            name,
            Some(Value::String("missing 'target' or 'cmd' field".into())),
        );
    };

    let (tx, mut rx) = mpsc::channel::<Reply>(1);
    let handle = ReplyHandle {
        cmd: cmd.clone(),
        sender: name.to_string(),
        tx,
    };

    match role.handle_cmd(&target, &cmd, raw.data, handle).await {
        // Deferred replies are awaited here; a dropped handle closes the
        // channel and yields the generic success reply.
        Ok(()) => rx
            .recv()
            .await
            .unwrap_or_else(|| Reply::standard(&cmd, name, None)),
        Err(e) => {
            warn!(%target, %cmd, error = %e, "command handler failed");
            Reply::error(&cmd, name, Some(Value::String(e.to_string())))
        }
    }
}
