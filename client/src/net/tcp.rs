use comms::{OnoReceiver, OnoSender, msg::Msg};
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::{
    error::TransportFailure,
    net::{Connection, Connector},
};

/// A `Connection` over any pair of byte streams, framed with `comms`.
pub struct FramedConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
}

impl<R, W> FramedConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(rx: OnoReceiver<R>, tx: OnoSender<W>) -> Self {
        Self { rx, tx }
    }

    /// Frames the two halves of a stream.
    pub fn from_halves(rx: R, tx: W) -> Self {
        let (rx, tx) = comms::channel(rx, tx);
        Self::new(rx, tx)
    }
}

impl<R, W> Connection for FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &Msg) -> Result<(), TransportFailure> {
        self.tx.send(msg).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Msg>, TransportFailure> {
        Ok(self.rx.try_recv().await?)
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        self.tx.shutdown().await?;
        Ok(())
    }
}

/// Connects to the coordinator over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    max_frame_len: usize,
}

impl TcpConnector {
    /// # Args
    /// * `addr` - A `host:port` pair, names are resolved on every connect.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_frame_len: comms::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    type Conn = FramedConnection<OwnedReadHalf, OwnedWriteHalf>;

    async fn connect(&mut self) -> Result<Self::Conn, TransportFailure> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = self.addr.as_str(); "connected to coordinator");

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Ok(FramedConnection::new(
            rx.with_max_frame_len(self.max_frame_len),
            tx,
        ))
    }
}
