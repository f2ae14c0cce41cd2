use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{DEFAULT_MAX_FRAME_LEN, Deserialize, LEN_TYPE_SIZE, LenType};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Overrides the largest frame this receiver accepts.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// # Returns
    /// The deserialized message, or an `UnexpectedEof` io error if the peer
    /// closed the stream.
    pub async fn recv<T: Deserialize>(&mut self) -> io::Result<T> {
        match self.try_recv().await? {
            Some(msg) => Ok(msg),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "the peer closed the stream",
            )),
        }
    }

    /// Waits to receive a new message, telling a clean close apart from a
    /// broken one.
    ///
    /// # Returns
    /// `Ok(None)` if the stream ended exactly at a frame boundary, `Ok(Some(msg))`
    /// on a complete frame and an io error otherwise, including when the stream
    /// ends in the middle of a frame.
    pub async fn try_recv<T: Deserialize>(&mut self) -> io::Result<Option<T>> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        let mut filled = 0;

        while filled < LEN_TYPE_SIZE {
            let n = self.rx.read(&mut size_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }

                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside a frame length prefix",
                ));
            }
            filled += n;
        }

        let len = LenType::from_be_bytes(size_buf);
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.max_frame_len)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame of {len} bytes exceeds the limit of {} bytes",
                        self.max_frame_len
                    ),
                )
            })?;

        self.buf.clear();
        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        T::deserialize(&self.buf).map(Some)
    }
}
