use std::{error::Error, fmt, io};

use comms::MeshErr;
use secure_nn::NnErr;

use crate::coordinator::Phase;

/// The party module's result type.
pub type Result<T> = std::result::Result<T, PartyErr>;

/// Party runtime failures.
#[derive(Debug)]
pub enum PartyErr {
    Io(io::Error),
    Config(String),
    Nn(NnErr),
    /// The batch rendezvous failed, every role stops.
    Sync(MeshErr),
    InvalidTransition {
        from: Phase,
        to: Phase,
    },
    Data(String),
}

impl PartyErr {
    /// Whether this error comes from a peer failing or leaving the lockstep.
    pub fn is_sync_failure(&self) -> bool {
        match self {
            PartyErr::Sync(e) => e.is_sync_failure(),
            PartyErr::Nn(e) => e.is_sync_failure(),
            _ => false,
        }
    }
}

impl fmt::Display for PartyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyErr::Io(e) => write!(f, "io error: {e}"),
            PartyErr::Config(detail) => write!(f, "invalid configuration: {detail}"),
            PartyErr::Nn(e) => write!(f, "{e}"),
            PartyErr::Sync(e) => write!(f, "synchronization failed: {e}"),
            PartyErr::InvalidTransition { from, to } => {
                write!(f, "invalid transition from {from} to {to}")
            }
            PartyErr::Data(detail) => write!(f, "dataset error: {detail}"),
        }
    }
}

impl Error for PartyErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PartyErr::Io(e) => Some(e),
            PartyErr::Nn(e) => Some(e),
            PartyErr::Sync(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PartyErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<NnErr> for PartyErr {
    fn from(value: NnErr) -> Self {
        Self::Nn(value)
    }
}

impl From<MeshErr> for PartyErr {
    fn from(value: MeshErr) -> Self {
        Self::Sync(value)
    }
}

impl From<serde_json::Error> for PartyErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<PartyErr> for io::Error {
    fn from(value: PartyErr) -> Self {
        match value {
            PartyErr::Io(e) => e,
            PartyErr::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::other(other),
        }
    }
}
