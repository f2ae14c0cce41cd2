use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use comms::{
    task::{Instruction, Reply},
    typing::{
        ClientId, DisconnectRes, ERROR_KEY, ERROR_MESSAGE_KEY, EvaluateIns, EvaluateRes, FitIns,
        FitRes, GetParametersIns, GetParametersRes, GetPropertiesIns, GetPropertiesRes, Metrics,
        Parameters, Properties, Scalar,
    },
};
use engine::{FormatError, LocalEvaluator, LocalTrainer, ModelState, ParameterCodec};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::RoundError;

/// What the session is doing right now.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle = 0,
    Fitting = 1,
    Evaluating = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Fitting,
            2 => Phase::Evaluating,
            _ => Phase::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Fitting => "fitting",
            Phase::Evaluating => "evaluating",
        };
        f.write_str(name)
    }
}

/// Puts the session back to `Idle` when dropped, panics included.
struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(Phase::Idle as u8, Ordering::Release);
    }
}

/// Per-client round state machine.
///
/// Holds the last known model snapshot and runs at most one round at a time:
/// `Idle -> Fitting -> Idle` or `Idle -> Evaluating -> Idle`. The session
/// knows nothing about the transport; the round loop feeds it instructions
/// and ships its replies.
///
/// Every method takes `&self` so an `Arc<ClientSession>` can be handed to a
/// blocking thread for the duration of a round.
pub struct ClientSession {
    client_id: ClientId,
    codec: ParameterCodec,
    trainer: Mutex<Box<dyn LocalTrainer>>,
    evaluator: Mutex<Box<dyn LocalEvaluator>>,
    snapshot: Mutex<ModelState>,
    phase: AtomicU8,
}

impl ClientSession {
    /// Creates a new `ClientSession` instance.
    ///
    /// # Args
    /// * `client_id` - The identity reported in every reply.
    /// * `codec` - Converts between wire parameters and the local model.
    /// * `initial` - The untrained model state, held until the first fit.
    /// * `trainer` - The local training computation.
    /// * `evaluator` - The local evaluation computation.
    ///
    /// # Errors
    /// A `FormatError` if `initial` does not follow the codec's layout.
    pub fn new<T, E>(
        client_id: ClientId,
        codec: ParameterCodec,
        initial: ModelState,
        trainer: T,
        evaluator: E,
    ) -> Result<Self, FormatError>
    where
        T: LocalTrainer + 'static,
        E: LocalEvaluator + 'static,
    {
        codec.encode(&initial)?;

        Ok(Self {
            client_id,
            codec,
            trainer: Mutex::new(Box::new(trainer) as Box<dyn LocalTrainer>),
            evaluator: Mutex::new(Box::new(evaluator) as Box<dyn LocalEvaluator>),
            snapshot: Mutex::new(initial),
            phase: AtomicU8::new(Phase::Idle as u8),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn codec(&self) -> &ParameterCodec {
        &self.codec
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// A copy of the held model snapshot.
    pub fn snapshot(&self) -> ModelState {
        self.snapshot.lock().clone()
    }

    fn enter(&self, to: Phase) -> Result<PhaseGuard<'_>, RoundError> {
        self.phase
            .compare_exchange(
                Phase::Idle as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| RoundError::ConcurrentRound {
                phase: Phase::from_u8(current),
            })?;

        Ok(PhaseGuard { phase: &self.phase })
    }

    /// Trains on local data starting from the instruction's parameters.
    ///
    /// On success the held snapshot becomes the trained state. On failure the
    /// snapshot is left untouched. Either way the session is `Idle` again when
    /// this returns.
    ///
    /// # Errors
    /// `ConcurrentRound` if another round is in flight, `Format` if the
    /// parameters do not fit the local model and `LocalCompute` if the trainer
    /// fails.
    pub fn dispatch_fit(&self, ins: FitIns) -> Result<FitRes, RoundError> {
        let _guard = self.enter(Phase::Fitting)?;

        let state = self.codec.decode(&ins.parameters)?;
        let fitted = self.trainer.lock().train(state, &ins.config)?;
        let parameters = self.codec.encode(&fitted.state)?;

        *self.snapshot.lock() = fitted.state;

        Ok(FitRes {
            parameters,
            num_examples: fitted.num_examples,
            metrics: fitted.metrics,
        })
    }

    /// Scores the instruction's parameters on local data. Never touches the
    /// held snapshot.
    ///
    /// # Errors
    /// Same as [`ClientSession::dispatch_fit`].
    pub fn dispatch_evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes, RoundError> {
        let _guard = self.enter(Phase::Evaluating)?;

        let state = self.codec.decode(&ins.parameters)?;
        let evaluated = self.evaluator.lock().evaluate(&state, &ins.config)?;

        Ok(EvaluateRes {
            loss: evaluated.loss,
            num_examples: evaluated.num_examples,
            metrics: evaluated.metrics,
        })
    }

    /// Encodes the held snapshot.
    pub fn dispatch_get_parameters(
        &self,
        _ins: GetParametersIns,
    ) -> Result<GetParametersRes, RoundError> {
        let parameters = self.codec.encode(&self.snapshot.lock())?;
        Ok(GetParametersRes { parameters })
    }

    pub fn dispatch_get_properties(&self, _ins: GetPropertiesIns) -> GetPropertiesRes {
        GetPropertiesRes {
            properties: self.trainer.lock().properties(),
        }
    }

    /// Answers one instruction, folding every round error into a degenerate
    /// reply that carries the error marker.
    pub fn handle(&self, instruction: Instruction) -> Reply {
        let kind = instruction.kind();

        let result = match instruction {
            Instruction::Fit(ins) => self.dispatch_fit(ins).map(Reply::Fit),
            Instruction::Evaluate(ins) => self.dispatch_evaluate(ins).map(Reply::Evaluate),
            Instruction::GetParameters(ins) => {
                self.dispatch_get_parameters(ins).map(Reply::GetParameters)
            }
            Instruction::GetProperties(ins) => Ok(Reply::GetProperties(
                self.dispatch_get_properties(ins),
            )),
            Instruction::Reconnect(ins) => {
                debug!(seconds = ins.seconds; "coordinator asked to reconnect");
                Ok(disconnect("reconnect"))
            }
            Instruction::Stop => Ok(disconnect("stop")),
        };

        result.unwrap_or_else(|e| {
            warn!(kind = kind, error = e.kind(); "round failed: {e}");
            self.error_reply(kind, &e)
        })
    }

    /// The degenerate reply answering an instruction of `kind` that failed
    /// with `err`.
    pub fn error_reply(&self, kind: &str, err: &RoundError) -> Reply {
        match kind {
            "fit" => Reply::Fit(FitRes {
                parameters: Parameters::empty(self.codec.tag()),
                num_examples: 0,
                metrics: error_metrics(err),
            }),
            "evaluate" => Reply::Evaluate(EvaluateRes {
                loss: 0.0,
                num_examples: 0,
                metrics: error_metrics(err),
            }),
            "get_parameters" => Reply::GetParameters(GetParametersRes {
                parameters: Parameters::empty(self.codec.tag()),
            }),
            "get_properties" => Reply::GetProperties(GetPropertiesRes {
                properties: Properties::new(),
            }),
            _ => disconnect(err.kind()),
        }
    }
}

fn disconnect(reason: &str) -> Reply {
    Reply::Disconnect(DisconnectRes {
        reason: reason.to_string(),
    })
}

fn error_metrics(err: &RoundError) -> Metrics {
    let mut metrics = Metrics::new();
    metrics.insert(ERROR_KEY.into(), Scalar::from(err.kind()));
    metrics.insert(ERROR_MESSAGE_KEY.into(), Scalar::from(err.to_string()));
    metrics
}

#[cfg(test)]
mod tests {
    use comms::typing::Config;
    use engine::{DType, EngineError, Evaluated, Fitted, Tensor};

    use super::*;

    struct Echo;

    impl LocalTrainer for Echo {
        fn train(&mut self, state: ModelState, _: &Config) -> Result<Fitted, EngineError> {
            Ok(Fitted {
                state,
                num_examples: 1,
                metrics: Metrics::new(),
            })
        }
    }

    impl LocalEvaluator for Echo {
        fn evaluate(&mut self, _: &ModelState, _: &Config) -> Result<Evaluated, EngineError> {
            Ok(Evaluated {
                loss: 1.0,
                num_examples: 1,
                metrics: Metrics::new(),
            })
        }
    }

    fn session() -> ClientSession {
        let state = ModelState::new(vec![Tensor::zeros(vec![2], DType::F32)]);
        let codec = ParameterCodec::for_state(&state);
        ClientSession::new(ClientId::new("c"), codec, state, Echo, Echo).unwrap()
    }

    #[test]
    fn guard_resets_the_phase() {
        let session = session();
        {
            let _guard = session.enter(Phase::Fitting).unwrap();
            assert_eq!(session.phase(), Phase::Fitting);
            assert!(matches!(
                session.enter(Phase::Evaluating),
                Err(RoundError::ConcurrentRound {
                    phase: Phase::Fitting
                })
            ));
        }
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn initial_state_must_fit_the_codec() {
        let state = ModelState::new(vec![Tensor::zeros(vec![2], DType::F32)]);
        let codec = ParameterCodec::new(vec![vec![3]], DType::F32);
        assert!(ClientSession::new(ClientId::new("c"), codec, state, Echo, Echo).is_err());
    }

    #[test]
    fn stop_and_reconnect_answer_with_disconnect() {
        let session = session();
        assert_eq!(session.handle(Instruction::Stop), disconnect("stop"));
        assert_eq!(
            session.handle(Instruction::Reconnect(comms::typing::ReconnectIns { seconds: 1 })),
            disconnect("reconnect")
        );
    }

    #[test]
    fn get_parameters_encodes_the_snapshot() {
        let session = session();
        let Reply::GetParameters(res) = session.handle(Instruction::GetParameters(
            GetParametersIns {
                config: Config::new(),
            },
        )) else {
            panic!("expected get_parameters reply");
        };

        assert_eq!(res.parameters.tensor_type, "f32");
        assert_eq!(res.parameters.tensors, vec![vec![0; 8]]);
    }
}
