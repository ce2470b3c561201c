//! Timeout-bounded socket halves for TETHER pipes.
//!
//! Each half carries the socket's kill switch: when the owning pipe shuts
//! the socket down, any read or write in flight on either half returns
//! [`TransportError::Aborted`] immediately instead of waiting on the peer.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use super::error::{TransportError, TransportResult};

/// Shutdown handle for one socket. Held by the pipe.
#[derive(Debug)]
pub struct SocketKill {
    tx: watch::Sender<bool>,
}

impl SocketKill {
    /// Create a kill switch and a receiver for the socket halves.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Abort every in-flight and future operation on the socket.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the socket has been shut down.
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

async fn killed(kill: &mut watch::Receiver<bool>) {
    // A dropped sender means the pipe went away; treat it as a shutdown.
    let _ = kill.wait_for(|down| *down).await;
}

async fn bounded<T, F>(
    timeout: Option<Duration>,
    kill: &mut watch::Receiver<bool>,
    op: F,
) -> TransportResult<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    if *kill.borrow() {
        return Err(TransportError::Aborted);
    }
    let op = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(TransportError::from),
            None => op.await.map_err(TransportError::from),
        }
    };
    tokio::select! {
        res = op => res,
        _ = killed(kill) => Err(TransportError::Aborted),
    }
}

/// Read half of a pipe socket.
#[derive(Debug)]
pub struct SocketReader<R = OwnedReadHalf> {
    inner: R,
    timeout: Option<Duration>,
    kill: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin + Send> SocketReader<R> {
    /// Wrap a readable stream.
    pub fn new(inner: R, timeout: Option<Duration>, kill: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            timeout,
            kill,
        }
    }

    /// Fill `buf` completely, honoring the timeout and kill switch.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        let inner = &mut self.inner;
        let res = bounded(self.timeout, &mut self.kill, inner.read_exact(buf)).await;
        match res {
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(TransportError::Closed)
            }
            other => other.map(|_| ()),
        }
    }

    /// Read a single byte.
    pub async fn read_u8(&mut self) -> TransportResult<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    /// Read a little-endian u64.
    pub async fn read_le64(&mut self) -> TransportResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read exactly `len` bytes into a new buffer.
    pub async fn read_vec(&mut self, len: usize) -> TransportResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Write half of a pipe socket.
#[derive(Debug)]
pub struct SocketWriter<W = OwnedWriteHalf> {
    inner: W,
    timeout: Option<Duration>,
    kill: watch::Receiver<bool>,
}

impl<W: AsyncWrite + Unpin + Send> SocketWriter<W> {
    /// Wrap a writable stream.
    pub fn new(inner: W, timeout: Option<Duration>, kill: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            timeout,
            kill,
        }
    }

    /// Write all of `buf` and flush.
    pub async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()> {
        let inner = &mut self.inner;
        bounded(self.timeout, &mut self.kill, async move {
            inner.write_all(buf).await?;
            inner.flush().await
        })
        .await
    }

    /// Write a single tag byte.
    pub async fn write_tag(&mut self, tag: u8) -> TransportResult<()> {
        self.write_all(&[tag]).await
    }

    /// Write a tag followed by a little-endian u64.
    pub async fn write_tag_le64(&mut self, tag: u8, value: u64) -> TransportResult<()> {
        let mut buf = [0u8; 9];
        buf[0] = tag;
        buf[1..].copy_from_slice(&value.to_le_bytes());
        self.write_all(&buf).await
    }

    /// Write a little-endian u64.
    pub async fn write_le64(&mut self, value: u64) -> TransportResult<()> {
        self.write_all(&value.to_le_bytes()).await
    }

    /// Best-effort shutdown of the write direction.
    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Split a connected stream into bounded halves sharing one kill switch.
pub fn split_stream(
    stream: TcpStream,
    timeout: Option<Duration>,
) -> (SocketKill, SocketReader, SocketWriter) {
    let (kill, rx) = SocketKill::new();
    let (read, write) = stream.into_split();
    (
        kill,
        SocketReader::new(read, timeout, rx.clone()),
        SocketWriter::new(write, timeout, rx),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let (_kill, rx) = SocketKill::new();
        let mut writer = SocketWriter::new(a, None, rx.clone());
        let mut reader = SocketReader::new(b, None, rx);

        writer.write_tag_le64(8, 77).await.unwrap();
        assert_eq!(reader.read_u8().await.unwrap(), 8);
        assert_eq!(reader.read_le64().await.unwrap(), 77);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_a, b) = tokio::io::duplex(64);
        let (_kill, rx) = SocketKill::new();
        let mut reader = SocketReader::new(b, Some(Duration::from_millis(20)), rx);
        assert!(matches!(reader.read_u8().await, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_kill_aborts_pending_read() {
        let (_a, b) = tokio::io::duplex(64);
        let (kill, rx) = SocketKill::new();
        let mut reader = SocketReader::new(b, None, rx);

        let pending = tokio::spawn(async move { reader.read_u8().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        kill.shutdown();
        assert!(kill.is_shutdown());
        assert!(matches!(pending.await.unwrap(), Err(TransportError::Aborted)));
    }

    #[tokio::test]
    async fn test_peer_close_is_closed() {
        let (a, b) = tokio::io::duplex(64);
        let (_kill, rx) = SocketKill::new();
        let mut reader = SocketReader::new(b, None, rx);
        drop(a);
        assert!(matches!(reader.read_u8().await, Err(TransportError::Closed)));
    }
}
