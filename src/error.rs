use std::{error::Error, fmt, io};

use comms::CommsErr;

use crate::config::ConfigErr;

/// The crate's result type.
pub type Result<T> = std::result::Result<T, OrchestraErr>;

/// Failures of the training driver.
///
/// Divergence is not an error, it's reported through the run outcome.
#[derive(Debug)]
pub enum OrchestraErr {
    /// The topology was used before `initialize` or after `finalize`.
    NotInitialized,
    /// The process group couldn't be formed or its layout is inconsistent.
    Topology(String),
    /// No free port was found for the master endpoint.
    PortAllocation { attempts: usize },
    Config(ConfigErr),
    /// A barrier, broadcast or reduction failed. Always fatal.
    Collective(CommsErr),
    Io(io::Error),
    /// The evaluator didn't report a metric the engine depends on.
    MissingMetric(&'static str),
}

impl fmt::Display for OrchestraErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "the process topology is not initialized"),
            Self::Topology(msg) => write!(f, "topology error: {msg}"),
            Self::PortAllocation { attempts } => {
                write!(f, "couldn't find a free port after {attempts} attempts")
            }
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Collective(e) => write!(f, "collective operation failed: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::MissingMetric(name) => write!(f, "the evaluator didn't report `{name}`"),
        }
    }
}

impl Error for OrchestraErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Collective(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigErr> for OrchestraErr {
    fn from(e: ConfigErr) -> Self {
        Self::Config(e)
    }
}

impl From<CommsErr> for OrchestraErr {
    fn from(e: CommsErr) -> Self {
        Self::Collective(e)
    }
}

impl From<io::Error> for OrchestraErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
