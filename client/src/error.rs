use std::{error::Error, fmt, io, time::Duration};

use engine::{EngineError, FormatError};

use crate::{metrics::RoundStats, session::Phase};

/// The client module's result type.
pub type Result<T> = std::result::Result<T, ClientErr>;

/// Failures local to one round.
///
/// None of them ends the session: they are turned into a degenerate reply
/// carrying the error marker and the client moves on to the next round.
#[derive(Debug)]
pub enum RoundError {
    /// The instruction's parameters do not fit the local model, or the
    /// trained state does not fit the wire layout.
    Format(FormatError),
    /// The trainer or evaluator failed.
    LocalCompute(EngineError),
    /// The compute did not finish within the configured compute timeout.
    ComputeTimeout(Duration),
    /// A round was dispatched while another one was in flight.
    ConcurrentRound { phase: Phase },
}

impl RoundError {
    /// The value stored under the error marker key of a degenerate reply.
    pub fn kind(&self) -> &'static str {
        match self {
            RoundError::Format(_) => "format",
            RoundError::LocalCompute(_) | RoundError::ComputeTimeout(_) => "local_compute",
            RoundError::ConcurrentRound { .. } => "concurrent_round",
        }
    }
}

impl fmt::Display for RoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundError::Format(e) => write!(f, "format error: {e}"),
            RoundError::LocalCompute(e) => write!(f, "local compute failed: {e}"),
            RoundError::ComputeTimeout(after) => {
                write!(f, "local compute still running after {}ms", after.as_millis())
            }
            RoundError::ConcurrentRound { phase } => {
                write!(f, "a round is already in flight (session is {phase})")
            }
        }
    }
}

impl Error for RoundError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RoundError::Format(e) => Some(e),
            RoundError::LocalCompute(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FormatError> for RoundError {
    fn from(value: FormatError) -> Self {
        Self::Format(value)
    }
}

impl From<EngineError> for RoundError {
    fn from(value: EngineError) -> Self {
        Self::LocalCompute(value)
    }
}

/// A failed exchange with the coordinator. Recovered by reconnecting.
#[derive(Debug)]
pub enum TransportFailure {
    Io(io::Error),
    Timeout {
        op: &'static str,
    },
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    RoundMismatch {
        expected: u64,
        got: u64,
    },
    /// The coordinator closed the stream while a reply was still owed.
    Closed,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Io(e) => write!(f, "io error: {e}"),
            TransportFailure::Timeout { op } => write!(f, "timed out while waiting to {op}"),
            TransportFailure::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: got {got}, expected {expected}")
            }
            TransportFailure::RoundMismatch { expected, got } => {
                write!(f, "ack for round {got}, expected round {expected}")
            }
            TransportFailure::Closed => write!(f, "connection closed by the coordinator"),
        }
    }
}

impl Error for TransportFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportFailure::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportFailure {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Client process failures.
#[derive(Debug)]
pub enum ClientErr {
    /// The startup configuration is unusable.
    Config(String),
    Io(io::Error),
    /// Local data or engine setup failed at startup.
    Engine(EngineError),
    /// The coordinator stayed unreachable for too many consecutive attempts.
    TransportExhausted {
        failures: usize,
        last: TransportFailure,
        /// What the loop got done before giving up.
        stats: RoundStats,
    },
}

impl fmt::Display for ClientErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            ClientErr::Io(e) => write!(f, "io error: {e}"),
            ClientErr::Engine(e) => write!(f, "engine setup failed: {e}"),
            ClientErr::TransportExhausted { failures, last, .. } => write!(
                f,
                "giving up after {failures} consecutive transport failures, last: {last}"
            ),
        }
    }
}

impl Error for ClientErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientErr::Io(e) => Some(e),
            ClientErr::Engine(e) => Some(e),
            ClientErr::TransportExhausted { last, .. } => Some(last),
            ClientErr::Config(_) => None,
        }
    }
}

impl From<io::Error> for ClientErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EngineError> for ClientErr {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

impl From<engine::DataError> for ClientErr {
    fn from(value: engine::DataError) -> Self {
        Self::Engine(EngineError::Data(value))
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<ClientErr> for io::Error {
    fn from(value: ClientErr) -> Self {
        match value {
            ClientErr::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
