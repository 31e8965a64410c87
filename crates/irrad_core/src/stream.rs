//! Upstream subscriptions: per-address reader tasks feeding one consumer.
//!
//! Each configured upstream address gets its own reader task connecting to
//! the remote channel and pushing decoded lines into a shared queue. A
//! single consumer task invokes the role handler, so handler calls for one
//! channel kind are serialized. A reader that cannot connect retries with a
//! fixed backoff until the stop token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use irrad_types::{ChannelKind, DataPacket, EventRecord};

use crate::error::CoreResult;
use crate::fanout::Publisher;
use crate::role::RoleHandler;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Consume upstream `data` channels, re-publishing whatever the role
/// returns on this process' own data channel.
pub async fn receive_data(
    addrs: Vec<String>,
    role: Arc<dyn RoleHandler>,
    publisher: Publisher,
    hwm: usize,
    token: CancellationToken,
) -> CoreResult<()> {
    let mut rx = spawn_readers(addrs, ChannelKind::Data, hwm, &token);

    loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            line = rx.recv() => line,
        };
        let Some(line) = line else { break };

        let packet: DataPacket = match serde_json::from_str(&line) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "dropping undecodable upstream data line");
                continue;
            }
        };
        for outgoing in role.handle_data(packet).await {
            publisher.publish_json(&outgoing)?;
        }
    }

    Ok(())
}

/// Consume upstream `event` channels, handing each record to the role.
pub async fn receive_events(
    addrs: Vec<String>,
    role: Arc<dyn RoleHandler>,
    hwm: usize,
    token: CancellationToken,
) -> CoreResult<()> {
    let mut rx = spawn_readers(addrs, ChannelKind::Event, hwm, &token);

    loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            line = rx.recv() => line,
        };
        let Some(line) = line else { break };

        match serde_json::from_str::<EventRecord>(&line) {
            Ok(record) => role.handle_event(record).await,
            Err(e) => warn!(error = %e, "dropping undecodable upstream event line"),
        }
    }

    Ok(())
}

fn spawn_readers(
    addrs: Vec<String>,
    kind: ChannelKind,
    hwm: usize,
    token: &CancellationToken,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(hwm);
    for addr in addrs {
        tokio::spawn(read_channel(addr, kind, tx.clone(), token.clone()));
    }
    rx
}

/// Reader task for one upstream address. Reconnects on disconnect.
async fn read_channel(
    addr: String,
    kind: ChannelKind,
    tx: mpsc::Sender<String>,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            connected = TcpStream::connect(&addr) => connected,
        };

        let stream = match stream {
            Ok(stream) => {
                debug!(channel = %kind, %addr, "subscribed to upstream channel");
                stream
            }
            Err(e) => {
                warn!(channel = %kind, %addr, error = %e, "upstream connect failed, retrying");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(channel = %kind, %addr, error = %e, "upstream read failed");
                    break;
                }
            }
        }

        warn!(channel = %kind, %addr, "upstream channel disconnected, reconnecting");
    }
}
