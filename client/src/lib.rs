//! Federated-learning client: answers a coordinator's fit and evaluate
//! instructions with a local training engine.

pub mod config;
pub mod error;
mod loop_;
pub mod metrics;
pub mod net;
pub mod retry;
pub mod session;

pub use config::ClientConfig;
pub use error::{ClientErr, RoundError, TransportFailure};
pub use loop_::{LoopConfig, RoundLoop, Termination};
pub use metrics::RoundStats;
pub use retry::RetryPolicy;
pub use session::{ClientSession, Phase};
