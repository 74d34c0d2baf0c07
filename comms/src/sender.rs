//! The sending end of the length-prefixed framing.

use std::{io, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time,
};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes frames to one peer.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
    frames: u64,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    /// Creates a new `FrameSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
            frames: 0,
        }
    }

    /// The amount of frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Writes `msg` as a single frame and flushes it.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An `io::Error` if the frame is too big for the receiver or the writer fails.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.buf.clear();
        self.buf.resize(LEN_TYPE_SIZE, 0);

        let trailer = msg.serialize(&mut self.buf);
        let body = self.buf.len() - LEN_TYPE_SIZE + trailer.map_or(0, <[_]>::len);
        if body > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {body} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        self.buf[..LEN_TYPE_SIZE].copy_from_slice(&(body as LenType).to_be_bytes());
        self.tx.write_all(&self.buf).await?;
        if let Some(trailer) = trailer {
            self.tx.write_all(trailer).await?;
        }

        self.tx.flush().await?;
        self.frames += 1;
        Ok(())
    }

    /// Like `send`, giving up once `bound` elapses.
    ///
    /// A frame cut short by the bound leaves the stream unusable, only use it for a last
    /// message before dropping the link.
    pub async fn send_within<'a, T: Serialize<'a>>(
        &mut self,
        msg: &'a T,
        bound: Duration,
    ) -> io::Result<()> {
        time::timeout(bound, self.send(msg))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send bound elapsed"))?
    }
}
