use crate::packet::MAX_PACKET_SIZE;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

/// The transport capability the engine consumes: a connected, reliable byte
/// stream with independent send/receive teardown. Abstracted behind a trait
/// to keep the I/O mockable for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
    /// Completes once at least one byte is available, returning the chunk
    /// that was read (at most [`MAX_PACKET_SIZE`] bytes). An empty chunk
    /// signals end-of-stream.
    async fn receive(&self) -> io::Result<Vec<u8>>;

    /// Writes the whole buffer. Concurrent callers are serialized.
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Shuts down both directions.
    async fn shutdown(&self);

    /// Sends FIN; the peer's reads will see end-of-stream.
    async fn shutdown_send(&self);

    /// Stops the receive direction; a pending or future `receive` completes
    /// with an error.
    fn shutdown_receive(&self);

    /// Releases the transport. Further operations fail.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// [`StreamSocket`] over a tokio `TcpStream`.
///
/// The stream is split on construction; the read half belongs to whoever
/// calls `receive` (the engine's receive task), writes are serialized by the
/// write-half mutex. There is no OS-level way to interrupt a read on a split
/// stream, so `shutdown_receive` works through a `Notify` that any pending
/// `receive` races against.
pub struct TcpStreamSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer: Option<SocketAddr>,
    recv_shutdown: Notify,
    recv_open: AtomicBool,
    open: AtomicBool,
}

impl TcpStreamSocket {
    pub fn new(stream: TcpStream) -> TcpStreamSocket {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        TcpStreamSocket {
            reader: Mutex::new(read_half),
            writer: Mutex::new(Some(write_half)),
            peer,
            recv_shutdown: Notify::new(),
            recv_open: AtomicBool::new(true),
            open: AtomicBool::new(true),
        }
    }

    pub async fn connect(addr: SocketAddr) -> io::Result<TcpStreamSocket> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    fn receive_shut_down_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "receive direction is shut down")
    }
}

#[async_trait]
impl StreamSocket for TcpStreamSocket {
    async fn receive(&self) -> io::Result<Vec<u8>> {
        // create the future before the flag check so a concurrent shutdown
        // between check and await cannot be missed
        let shut_down = self.recv_shutdown.notified();
        if !self.recv_open.load(Ordering::Acquire) {
            return Err(Self::receive_shut_down_error());
        }

        let mut guard = self.reader.lock().await;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        tokio::select! {
            _ = shut_down => Err(Self::receive_shut_down_error()),
            result = guard.read(&mut buf) => {
                let n = result?;
                trace!(bytes = n, "received chunk");
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        match self.writer.lock().await.as_mut() {
            Some(write_half) => write_half.write_all(data).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed")),
        }
    }

    async fn shutdown(&self) {
        self.shutdown_send().await;
        self.shutdown_receive();
    }

    async fn shutdown_send(&self) {
        if let Some(write_half) = self.writer.lock().await.as_mut() {
            let _ = write_half.shutdown().await;
        }
    }

    fn shutdown_receive(&self) {
        self.recv_open.store(false, Ordering::Release);
        self.recv_shutdown.notify_waiters();
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.shutdown_receive();
        // dropping the write half releases the fd's send side right away;
        // if a write is in flight the half goes away with the socket instead
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
