use std::{error::Error, fmt};

use crate::{DType, DataError};

/// Errors produced by local compute engines.
#[derive(Debug)]
pub enum EngineError {
    /// An input is invalid for semantic or domain reasons.
    InvalidInput(String),

    /// A shape invariant was violated (e.g. mismatched lengths).
    ShapeMismatch {
        /// Human-readable context for the mismatch (e.g. "params", "batch").
        what: &'static str,
        /// Observed value.
        got: usize,
        /// Expected value.
        expected: usize,
    },

    /// The local dataset could not serve the request.
    Data(DataError),

    /// Any other engine specific failure.
    Other(Box<dyn Error + Send + Sync>),
}

impl EngineError {
    /// Wraps an arbitrary engine failure.
    pub fn other<E: Into<Box<dyn Error + Send + Sync>>>(err: E) -> Self {
        Self::Other(err.into())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::ShapeMismatch {
                what,
                got,
                expected,
            } => {
                write!(f, "shape mismatch for {what}: got {got}, expected {expected}")
            }
            EngineError::Data(e) => write!(f, "data error: {e}"),
            EngineError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Data(e) => Some(e),
            EngineError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<DataError> for EngineError {
    fn from(value: DataError) -> Self {
        Self::Data(value)
    }
}

/// A `Parameters` value does not fit the local model, or a model state does
/// not fit the layout it should be encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    TagMismatch {
        expected: &'static str,
        got: String,
    },
    TensorCountMismatch {
        expected: usize,
        got: usize,
    },
    BlobSizeMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    DTypeMismatch {
        index: usize,
        expected: DType,
        got: DType,
    },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::TagMismatch { expected, got } => {
                write!(f, "tensor type mismatch: got {got:?}, expected {expected:?}")
            }
            FormatError::TensorCountMismatch { expected, got } => {
                write!(f, "tensor count mismatch: got {got}, expected {expected}")
            }
            FormatError::BlobSizeMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "tensor {index} has {got} bytes, expected {expected}"
            ),
            FormatError::ShapeMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "tensor {index} has shape {got:?}, expected {expected:?}"
            ),
            FormatError::DTypeMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "tensor {index} holds {} elements, expected {}",
                got.tag(),
                expected.tag()
            ),
        }
    }
}

impl Error for FormatError {}
