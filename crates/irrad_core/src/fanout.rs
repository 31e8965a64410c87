//! Publish channels: internal publisher handles and the bridge task.
//!
//! The outbound socket of a publish channel is owned by exactly one task,
//! the bridge. Producer tasks never write to it; they publish through cloned
//! [`Publisher`] handles feeding a bounded in-process queue the bridge
//! drains in FIFO order. Each connected subscriber gets its own bounded
//! queue drained by a dedicated writer task; a full subscriber queue drops
//! the message for that subscriber only. Telemetry is best-effort; the
//! `cmd` channel does not go through here and never drops.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use irrad_types::ChannelKind;

use crate::error::{CoreError, CoreResult};

/// Cloneable producer-side handle onto one publish channel.
#[derive(Clone)]
pub struct Publisher {
    kind: ChannelKind,
    tx: mpsc::Sender<String>,
}

impl Publisher {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Serialize `msg` and queue it for the bridge.
    pub fn publish_json<T: Serialize>(&self, msg: &T) -> CoreResult<()> {
        self.publish_line(serde_json::to_string(msg)?)
    }

    /// Queue a raw line for the bridge. A full internal queue drops the
    /// message with a warning.
    pub fn publish_line(&self, line: String) -> CoreResult<()> {
        match self.tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(channel = %self.kind, "internal publish queue full, dropping message");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(CoreError::ChannelClosed(self.kind.as_str())),
        }
    }

    /// Like [`Publisher::publish_line`] but silent on overflow. Used by the
    /// log forwarder, which must never log about itself.
    pub fn try_publish_line(&self, line: String) {
        let _ = self.tx.try_send(line);
    }
}

/// The externally bound side of one publish channel, run as the bridge task.
pub struct FanoutEndpoint {
    kind: ChannelKind,
    port: u16,
    listener: TcpListener,
    rx: mpsc::Receiver<String>,
    hwm: usize,
}

/// Create the producer handle / bridge pair for one bound listener.
pub fn fanout_channel(
    kind: ChannelKind,
    listener: TcpListener,
    port: u16,
    hwm: usize,
) -> (Publisher, FanoutEndpoint) {
    let (tx, rx) = mpsc::channel(hwm);
    (
        Publisher { kind, tx },
        FanoutEndpoint {
            kind,
            port,
            listener,
            rx,
            hwm,
        },
    )
}

impl FanoutEndpoint {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bridge loop: accept subscribers and forward every queued line to all
    /// of them until the stop token fires.
    pub async fn run(mut self, token: CancellationToken) -> CoreResult<()> {
        let mut subscribers: Vec<Subscriber> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(channel = %self.kind, %peer, "subscriber connected");
                    subscribers.push(Subscriber::spawn(stream, peer, self.hwm));
                }
                line = self.rx.recv() => {
                    let Some(line) = line else { break };
                    self.forward(&mut subscribers, line);
                }
            }
        }

        debug!(channel = %self.kind, "bridge stopped");
        Ok(())
    }

    fn forward(&self, subscribers: &mut Vec<Subscriber>, line: String) {
        subscribers.retain(|sub| match sub.tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    channel = %self.kind,
                    subscriber = %sub.peer,
                    "subscriber queue full, dropping message"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(channel = %self.kind, subscriber = %sub.peer, "subscriber gone");
                false
            }
        });
    }
}

struct Subscriber {
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
}

impl Subscriber {
    /// Per-subscriber writer task; the socket has exactly one writer.
    fn spawn(stream: TcpStream, peer: SocketAddr, hwm: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(hwm);
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if stream.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        Self { peer, tx }
    }
}
