use std::{error::Error, fmt, io};

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// Failures of the collective communication layer.
///
/// Every variant is fatal for the group: once one member observes an error the
/// collective sequence can no longer be kept in lockstep.
#[derive(Debug)]
pub enum CommsErr {
    Io(io::Error),
    /// A peer left the group (or the group was torn down) mid-operation.
    Closed,
    /// The rank is outside of `0..size` or already taken.
    InvalidRank { rank: usize, size: usize },
    /// A frame arrived that doesn't fit the current operation.
    UnexpectedMessage { expected: &'static str, got: &'static str },
    /// A peer reported an error in place of a payload.
    Remote(String),
    /// The group couldn't be formed.
    Rendezvous(String),
    /// A payload couldn't be encoded or decoded.
    Codec(serde_json::Error),
    /// The operation was issued after `finalize`.
    Finalized,
}

impl fmt::Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsErr::Io(e) => write!(f, "io error: {e}"),
            CommsErr::Closed => write!(f, "the process group was closed by a peer"),
            CommsErr::InvalidRank { rank, size } => {
                write!(f, "invalid rank {rank} for a group of size {size}")
            }
            CommsErr::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: expected {expected}, got {got}")
            }
            CommsErr::Remote(detail) => write!(f, "peer failure: {detail}"),
            CommsErr::Rendezvous(detail) => write!(f, "rendezvous failed: {detail}"),
            CommsErr::Codec(e) => write!(f, "codec error: {e}"),
            CommsErr::Finalized => write!(f, "collective issued after finalize"),
        }
    }
}

impl Error for CommsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommsErr::Io(e) => Some(e),
            CommsErr::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommsErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for CommsErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}
