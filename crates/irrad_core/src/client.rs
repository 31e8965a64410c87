//! Client-side helpers: send commands and subscribe to publish channels.

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use irrad_types::{Command, DataPacket, EventRecord, Reply};

use crate::error::{CoreError, CoreResult};

/// Request/reply connection to a process' command channel.
pub struct Commander {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Commander {
    pub async fn connect(addr: &str) -> CoreResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    /// Send one command and wait for its single reply.
    pub async fn request(&mut self, command: &Command) -> CoreResult<Reply> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        match self.lines.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(CoreError::ChannelClosed("cmd")),
        }
    }
}

/// Read-only connection to a publish channel.
pub struct Subscription {
    lines: Lines<BufReader<TcpStream>>,
}

impl Subscription {
    pub async fn connect(addr: &str) -> CoreResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            lines: BufReader::new(stream).lines(),
        })
    }

    /// Next raw line, `None` once the publisher is gone.
    pub async fn next_line(&mut self) -> CoreResult<Option<String>> {
        Ok(self.lines.next_line().await?)
    }

    pub async fn next_packet(&mut self) -> CoreResult<Option<DataPacket>> {
        self.next_decoded().await
    }

    pub async fn next_event(&mut self) -> CoreResult<Option<EventRecord>> {
        self.next_decoded().await
    }

    async fn next_decoded<T: DeserializeOwned>(&mut self) -> CoreResult<Option<T>> {
        match self.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}
