/*!
 * Byte transports for hardware links.
 */
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::device::Result;

/// A bidirectional byte pipe owned by one link loop
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write every byte
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Append whatever is available to `buf`; 0 means the peer closed.
    ///
    /// Must be cancel safe: the loop drops a pending read on poll timeout.
    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize>;
}

/// A transport over any tokio stream
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a stream
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Unwrap the stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to a network-attached link, such as a serial-to-IP bridge
    pub async fn tcp<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<Self> {
        debug!("Connecting link to {:?}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl StreamTransport<DuplexStream> {
    /// An in-memory link; the returned stream is the hardware side
    pub fn memory(capacity: usize) -> (Self, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(capacity);
        (Self::new(ours), theirs)
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize> {
        Ok(self.stream.read_buf(buf).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (mut link, mut hardware) = StreamTransport::memory(64);

        link.write(b"A1 ON\n").await.unwrap();
        let mut seen = [0u8; 6];
        hardware.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"A1 ON\n");

        hardware.write_all(b"A1 OFF\n").await.unwrap();
        let mut buf = BytesMut::new();
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(&buf[..], b"A1 OFF\n");
    }

    #[tokio::test]
    async fn test_scripted_stream() {
        let mock = tokio_test::io::Builder::new()
            .write(b"A1 ON\n")
            .read(b"OK A1 ON\n")
            .build();
        let mut link = StreamTransport::new(mock);

        link.write(b"A1 ON\n").await.unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(link.read(&mut buf).await.unwrap(), 9);
        assert_eq!(&buf[..], b"OK A1 ON\n");
    }

    #[tokio::test]
    async fn test_closed_peer_reads_zero() {
        let (mut link, hardware) = StreamTransport::memory(64);
        drop(hardware);
        let mut buf = BytesMut::new();
        assert_eq!(link.read(&mut buf).await.unwrap(), 0);
    }
}
