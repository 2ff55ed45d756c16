//! TCP transport

use super::{RemoteTransport, TransportConfig, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// TCP connection to one remote address
pub struct TcpRemote {
    addr: String,
    config: TransportConfig,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl TcpRemote {
    /// Create a new TCP transport; nothing is connected until `open`
    pub fn new(addr: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(true),
            shutdown: Notify::new(),
        }
    }

    /// Create with default configuration
    pub fn new_default(addr: impl Into<String>) -> Self {
        Self::new(addr, TransportConfig::default())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("connect {} timed out", self.addr)))?
            .map_err(TransportError::Io)?;

        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

#[async_trait]
impl RemoteTransport for TcpRemote {
    async fn open(&self, iv: u64) -> Result<(), TransportError> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();

        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.closed.store(false, Ordering::Release);

        debug!(addr = %self.addr, iv = format_args!("{:016x}", iv), "tcp connection opened");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        // Registered before the closed check so a concurrent close cannot be missed.
        let shutdown = self.shutdown.notified();

        let mut reader = self.reader.lock().await;
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let stream = reader.as_mut().ok_or(TransportError::Closed)?;

        let timeout = Duration::from_secs(self.config.read_timeout);
        let n = tokio::select! {
            res = tokio::time::timeout(timeout, stream.read(buf)) => {
                res.map_err(|_| TransportError::Timeout)?
                    .map_err(TransportError::Io)?
            }
            _ = shutdown => return Err(TransportError::Closed),
        };

        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::Closed)?;

        let timeout = Duration::from_secs(self.config.write_timeout);
        tokio::time::timeout(timeout, stream.write_all(data))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        Ok(data.len())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();

        if let Some(mut stream) = self.writer.lock().await.take() {
            stream.shutdown().await.ok();
        }
        self.reader.lock().await.take();
        debug!(addr = %self.addr, "tcp connection closed");
    }

    async fn request(&self, data: &[u8]) -> Result<Bytes, TransportError> {
        let mut stream = self.connect().await?;
        let timeout = Duration::from_secs(self.config.read_timeout);

        stream.write_all(data).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        tokio::time::timeout(timeout, stream.read_to_end(&mut response))
            .await
            .map_err(|_| TransportError::Timeout)??;

        Ok(Bytes::from(response))
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.config.read_timeout)
    }
}
