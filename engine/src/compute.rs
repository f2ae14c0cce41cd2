use comms::typing::{Config, Metrics, Properties};

use crate::{EngineError, ModelState};

/// Output of one local training pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Fitted {
    pub state: ModelState,
    /// Local samples that actually contributed to `state`.
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// Output of one local evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// Abstraction over a local training computation executed by a client.
///
/// Implementations encapsulate all model-, data-, loss- and optimizer-specific
/// logic. The client treats this trait as a black box mapping a model state
/// and a round configuration to an updated state.
///
/// Calls may block for as long as training takes; the client runs them on a
/// blocking thread and never interrupts them.
pub trait LocalTrainer: Send {
    /// Trains starting from `state`.
    ///
    /// # Args
    /// * `state` - The decoded parameters sent by the coordinator, owned by the
    ///   trainer for the duration of the call.
    /// * `config` - The round configuration. Unknown keys must be ignored.
    ///
    /// # Errors
    /// Any `EngineError`; the client reports it as a failed round.
    fn train(&mut self, state: ModelState, config: &Config) -> Result<Fitted, EngineError>;

    /// Static properties reported when the coordinator asks for them.
    fn properties(&self) -> Properties {
        Properties::new()
    }
}

/// Abstraction over a local evaluation computation executed by a client.
pub trait LocalEvaluator: Send {
    /// Scores `state` on local data.
    ///
    /// Given the same `state`, `config` and data, a deterministic evaluator
    /// must return the same result every time.
    fn evaluate(&mut self, state: &ModelState, config: &Config) -> Result<Evaluated, EngineError>;
}

impl<T: LocalTrainer + ?Sized> LocalTrainer for Box<T> {
    fn train(&mut self, state: ModelState, config: &Config) -> Result<Fitted, EngineError> {
        (**self).train(state, config)
    }

    fn properties(&self) -> Properties {
        (**self).properties()
    }
}

impl<T: LocalEvaluator + ?Sized> LocalEvaluator for Box<T> {
    fn evaluate(&mut self, state: &ModelState, config: &Config) -> Result<Evaluated, EngineError> {
        (**self).evaluate(state, config)
    }
}
