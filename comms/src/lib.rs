mod deserialize;
mod error;
mod mesh;
pub mod msg;
mod receiver;
mod role;
mod sender;
mod serialize;
mod transport;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use error::{MeshErr, Result};
pub use mesh::{InMemoryMesh, Mesh, TcpMesh, Timeouts};
pub use receiver::FrameReceiver;
pub use role::{InvalidRole, PartyRole};
pub use sender::FrameSender;
pub use serialize::Serialize;
pub use transport::Transport;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames bigger than this are rejected before allocating a receive buffer.
const MAX_FRAME_LEN: usize = 1 << 30;

/// Creates both `FrameReceiver` and `FrameSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a frame receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
