//! Minimal relay client: connect, send raw text, read whatever comes back.
//!
//! Shares the relay's wire format, which is to say none: one write is
//! intended as one message, but the stream may coalesce.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{RelayError, RelayResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER_SIZE: usize = 4096;

/// A single connection to a relay server.
pub struct RelayClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RelayClient {
    /// Connect with a bounded wait.
    pub async fn connect(addr: SocketAddr) -> RelayResult<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RelayError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })??;
        debug!("connected to relay at {}", addr);
        Ok(Self {
            stream,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Send one message (one write call).
    pub async fn send(&mut self, payload: &[u8]) -> RelayResult<()> {
        self.stream.write_all(payload).await?;
        Ok(())
    }

    /// Receive the next chunk. `None` means the server closed cleanly.
    pub async fn recv(&mut self) -> RelayResult<Option<Bytes>> {
        let n = self.stream.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    /// Receive with a deadline; `Err` on timeout, `Ok(None)` on clean close.
    pub async fn recv_timeout(&mut self, wait: Duration) -> RelayResult<Option<Bytes>> {
        timeout(wait, self.recv()).await.map_err(|_| {
            RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "recv timed out",
            ))
        })?
    }

    /// Split into read and write halves for concurrent pumping.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
