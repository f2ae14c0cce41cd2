//! Local compute side of a federated client.
//!
//! Holds the in-memory model representation, its conversion to and from wire
//! `Parameters`, and the boundary the client calls to train or evaluate.

mod codec;
mod compute;
mod data;
mod error;
pub mod linear;
mod options;
mod tensor;

pub use codec::ParameterCodec;
pub use compute::{Evaluated, Fitted, LocalEvaluator, LocalTrainer};
pub use data::{DataError, InMemoryDataset};
pub use error::{EngineError, FormatError};
pub use linear::LinearEngine;
pub use options::{EvaluateOptions, FitOptions};
pub use tensor::{DType, ModelState, Tensor, TensorData};

pub use half::f16;
