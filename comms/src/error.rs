use std::{error::Error, fmt, io, time::Duration};

use crate::PartyRole;

/// The mesh module's result type.
pub type Result<T> = std::result::Result<T, MeshErr>;

/// Failures of the three-party mesh.
///
/// Every variant except `Io` on a single send leaves the mesh poisoned: once one role
/// fails, no further share exchange or barrier succeeds on this process.
#[derive(Debug)]
pub enum MeshErr {
    Io(io::Error),
    /// A peer did not answer within the configured bound.
    Timeout {
        peer: PartyRole,
        waited: Duration,
    },
    /// A peer broadcast an abort.
    Aborted {
        by: PartyRole,
        reason: String,
    },
    /// A peer closed its link in the middle of a computation.
    PeerLeft(PartyRole),
    UnexpectedMessage {
        peer: PartyRole,
        expected: &'static str,
        got: &'static str,
    },
    /// A peer sent a share for a different layer than the one being computed.
    LayerMismatch {
        peer: PartyRole,
        expected: u32,
        got: u32,
    },
    /// A peer arrived at the barrier of a different batch.
    BarrierMismatch {
        peer: PartyRole,
        expected: (usize, usize),
        got: (usize, usize),
    },
    NotConnected(PartyRole),
    /// A previous failure already stopped this mesh.
    Poisoned,
}

impl MeshErr {
    /// Whether this error means the roles lost their lockstep, rather than a local I/O
    /// problem.
    pub fn is_sync_failure(&self) -> bool {
        matches!(
            self,
            MeshErr::Timeout { .. }
                | MeshErr::Aborted { .. }
                | MeshErr::PeerLeft(_)
                | MeshErr::BarrierMismatch { .. }
                | MeshErr::Poisoned
        )
    }
}

impl fmt::Display for MeshErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshErr::Io(e) => write!(f, "io error: {e}"),
            MeshErr::Timeout { peer, waited } => {
                write!(f, "{peer} did not answer within {waited:?}")
            }
            MeshErr::Aborted { by, reason } => write!(f, "aborted by {by}: {reason}"),
            MeshErr::PeerLeft(peer) => write!(f, "{peer} disconnected mid computation"),
            MeshErr::UnexpectedMessage {
                peer,
                expected,
                got,
            } => write!(f, "unexpected message from {peer}: expected {expected}, got {got}"),
            MeshErr::LayerMismatch {
                peer,
                expected,
                got,
            } => write!(
                f,
                "share from {peer} belongs to layer {got}, expected layer {expected}"
            ),
            MeshErr::BarrierMismatch {
                peer,
                expected,
                got,
            } => write!(
                f,
                "{peer} arrived at barrier (epoch, batch) {got:?}, expected {expected:?}"
            ),
            MeshErr::NotConnected(peer) => write!(f, "no link to {peer}"),
            MeshErr::Poisoned => f.write_str("the mesh was stopped by an earlier failure"),
        }
    }
}

impl Error for MeshErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MeshErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MeshErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<MeshErr> for io::Error {
    fn from(value: MeshErr) -> Self {
        match value {
            MeshErr::Io(e) => e,
            MeshErr::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, value),
            other => io::Error::other(other),
        }
    }
}
