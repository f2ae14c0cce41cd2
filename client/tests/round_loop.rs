use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use client::{
    ClientErr, ClientSession, LoopConfig, RetryPolicy, RoundLoop, Termination, TransportFailure,
    net::{Connector, FramedConnection},
};
use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
    task::{Instruction, Reply, TaskIns, TaskRes},
    typing::{
        ClientId, Config, DisconnectRes, EvaluateIns, FitIns, Metrics, Parameters, ReconnectIns,
        Scalar,
    },
};
use engine::{
    DType, EngineError, Fitted, InMemoryDataset, LinearEngine, LocalTrainer, ModelState,
    ParameterCodec,
};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    sync::watch,
};

const CLIENT: &str = "client-under-test";
const BUF_SIZE: usize = 1 << 20;

type Conn = FramedConnection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Hands out prepared streams in order. A `None` entry, or an exhausted
/// script, is a refused connection.
struct ScriptedConnector {
    script: VecDeque<Option<DuplexStream>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(script: Vec<Option<DuplexStream>>) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Self {
            script: script.into(),
            attempts: Arc::clone(&attempts),
        };
        (connector, attempts)
    }
}

impl Connector for ScriptedConnector {
    type Conn = Conn;

    async fn connect(&mut self) -> Result<Conn, TransportFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match self.script.pop_front().flatten() {
            Some(stream) => {
                let (rx, tx) = tokio::io::split(stream);
                Ok(FramedConnection::from_halves(rx, tx))
            }
            None => Err(TransportFailure::Io(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            ))),
        }
    }
}

/// The coordinator's end of one connection.
struct Coordinator {
    rx: OnoReceiver<ReadHalf<DuplexStream>>,
    tx: OnoSender<WriteHalf<DuplexStream>>,
}

impl Coordinator {
    async fn recv(&mut self) -> Msg {
        self.rx.recv().await.unwrap()
    }

    async fn send(&mut self, msg: Msg) {
        self.tx.send(&msg).await.unwrap();
    }

    async fn accept(&mut self) {
        match self.recv().await {
            Msg::Control(Command::Hello { client_id }) => assert_eq!(client_id.as_str(), CLIENT),
            other => panic!("expected hello, got {other:?}"),
        }
        self.send(Msg::Control(Command::Welcome)).await;
    }

    async fn expect_pull(&mut self) {
        match self.recv().await {
            Msg::Control(Command::Pull { client_id }) => assert_eq!(client_id.as_str(), CLIENT),
            other => panic!("expected pull, got {other:?}"),
        }
    }

    async fn push(&mut self, round: u64, instruction: Instruction) {
        self.expect_pull().await;
        self.send(Msg::Instruction(TaskIns { round, instruction }))
            .await;
    }

    async fn reply(&mut self) -> TaskRes {
        match self.recv().await {
            Msg::Reply(res) => res,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    async fn ack(&mut self, round: u64) {
        self.send(Msg::Control(Command::Ack { round })).await;
    }

    /// Pushes one instruction and acknowledges its reply.
    async fn round(&mut self, round: u64, instruction: Instruction) -> TaskRes {
        self.push(round, instruction).await;
        let res = self.reply().await;
        assert_eq!(res.round, round);
        assert_eq!(res.client_id.as_str(), CLIENT);
        self.ack(round).await;
        res
    }

    async fn stop(&mut self, round: u64) {
        let res = self.round(round, Instruction::Stop).await;
        assert_eq!(
            res.reply,
            Reply::Disconnect(DisconnectRes {
                reason: "stop".into()
            })
        );
    }
}

fn link() -> (DuplexStream, Coordinator) {
    let (client, coordinator) = tokio::io::duplex(BUF_SIZE);
    let (rx, tx) = tokio::io::split(coordinator);
    let (rx, tx) = comms::channel(rx, tx);
    (client, Coordinator { rx, tx })
}

fn engine() -> LinearEngine {
    LinearEngine::new(Arc::new(InMemoryDataset::synthetic(32, 2, 5).unwrap()))
}

fn codec() -> ParameterCodec {
    ParameterCodec::new(engine().layout(), DType::F32)
}

fn session() -> Arc<ClientSession> {
    let engine = engine();
    Arc::new(
        ClientSession::new(
            ClientId::new(CLIENT),
            codec(),
            engine.initial_state(DType::F32),
            engine.clone(),
            engine,
        )
        .unwrap(),
    )
}

fn loop_config(max_failures: usize) -> LoopConfig {
    LoopConfig {
        network_timeout: Duration::from_secs(2),
        compute_timeout: None,
        poll_interval: Duration::from_millis(10),
        retry: RetryPolicy {
            max_consecutive_failures: max_failures,
            min_delay_ms: 5,
            max_delay_ms: 20,
            factor: 2.0,
            jitter: false,
        },
    }
}

fn zero_params() -> Parameters {
    let codec = codec();
    codec
        .encode(&ModelState::zeros(codec.layout(), DType::F32))
        .unwrap()
}

fn fit(config: Config) -> Instruction {
    Instruction::Fit(FitIns {
        parameters: zero_params(),
        config,
    })
}

fn evaluate(parameters: Parameters) -> Instruction {
    Instruction::Evaluate(EvaluateIns {
        parameters,
        config: Config::new(),
    })
}

#[tokio::test]
async fn serves_rounds_until_stopped() {
    let (stream, mut coord) = link();
    let (connector, _) = ScriptedConnector::new(vec![Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;

        let mut config = Config::new();
        config.insert("epochs".into(), Scalar::Int(2));
        let fitted = coord.round(1, fit(config)).await;
        let Reply::Fit(res) = fitted.reply else {
            panic!("expected a fit reply");
        };
        assert_eq!(res.num_examples, 32);
        assert!(res.metrics.contains_key("loss"));
        assert_eq!(res.parameters.len(), 2);

        let evaluated = coord.round(2, evaluate(res.parameters)).await;
        assert_eq!(evaluated.reply.num_examples(), 32);
        assert_eq!(evaluated.reply.error_kind(), None);

        coord.stop(3).await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(stats.rounds, 3);
    assert_eq!(stats.fit_rounds, 1);
    assert_eq!(stats.evaluate_rounds, 1);
    assert_eq!(stats.failed_rounds, 0);
    assert_eq!(stats.samples, 64);
}

#[tokio::test]
async fn a_closed_channel_ends_the_loop_cleanly() {
    let (stream, mut coord) = link();
    let (connector, attempts) = ScriptedConnector::new(vec![Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;
        coord.round(1, fit(Config::new())).await;
        coord.expect_pull().await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Closed);
    assert_eq!(stats.rounds, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_task_makes_the_client_pull_again() {
    let (stream, mut coord) = link();
    let (connector, _) = ScriptedConnector::new(vec![Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;
        for _ in 0..3 {
            coord.expect_pull().await;
            coord.send(Msg::Control(Command::NoTask)).await;
        }
        coord.expect_pull().await;
        coord
            .send(Msg::Control(Command::Disconnect {
                reason: "training finished".into(),
            }))
            .await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(stats.rounds, 0);
}

#[tokio::test]
async fn local_failures_are_reported_without_dropping_the_connection() {
    let (stream, mut coord) = link();
    let (connector, attempts) = ScriptedConnector::new(vec![Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;

        let mut bad = zero_params();
        bad.tensor_type = "numpy.ndarray".into();
        let res = coord.round(1, evaluate(bad)).await;
        assert_eq!(res.reply.error_kind(), Some("format"));
        assert_eq!(res.reply.num_examples(), 0);

        let mut config = Config::new();
        config.insert("epochs".into(), Scalar::Str("many".into()));
        let res = coord.round(2, fit(config)).await;
        assert_eq!(res.reply.error_kind(), Some("local_compute"));

        let res = coord.round(3, fit(Config::new())).await;
        assert_eq!(res.reply.error_kind(), None);

        coord.stop(4).await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(stats.failed_rounds, 2);
    assert_eq!(stats.transport_failures, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connection_failures_are_retried_with_backoff() {
    let (stream, mut coord) = link();
    let (connector, attempts) = ScriptedConnector::new(vec![None, None, None, Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;
        coord.round(1, fit(Config::new())).await;
        coord.stop(2).await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(5))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(stats.transport_failures, 3);
    assert_eq!(stats.fit_rounds, 1);
}

#[tokio::test]
async fn gives_up_after_max_consecutive_failures() {
    let (connector, attempts) = ScriptedConnector::new(Vec::new());

    let err = RoundLoop::new(session(), connector, loop_config(4))
        .run()
        .await
        .unwrap_err();

    match err {
        ClientErr::TransportExhausted {
            failures,
            last,
            stats,
        } => {
            assert_eq!(failures, 4);
            assert!(matches!(last, TransportFailure::Io(_)));
            assert_eq!(stats.transport_failures, 4);
            assert_eq!(stats.rounds, 0);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn exhaustion_keeps_the_rounds_served_before_it() {
    let (stream, mut coord) = link();
    let (connector, _) = ScriptedConnector::new(vec![Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;
        coord.round(1, fit(Config::new())).await;
        coord.expect_pull().await;
        coord.send(Msg::Err("malformed".into())).await;
    });

    let err = RoundLoop::new(session(), connector, loop_config(2))
        .run()
        .await
        .unwrap_err();
    coordinator.await.unwrap();

    let ClientErr::TransportExhausted { stats, .. } = err else {
        panic!("expected exhaustion, got {err:?}");
    };
    assert_eq!(stats.rounds, 1);
    assert_eq!(stats.fit_rounds, 1);
    assert_eq!(stats.samples, 32);
    assert_eq!(stats.transport_failures, 2);
}

#[tokio::test]
async fn a_welcome_followed_by_garbage_counts_towards_the_limit() {
    let mut script = Vec::new();
    let mut coordinators = Vec::new();
    for _ in 0..5 {
        let (stream, coord) = link();
        script.push(Some(stream));
        coordinators.push(coord);
    }
    let (connector, attempts) = ScriptedConnector::new(script);

    // Only three connections are ever used; the rest stay idle.
    let served: Vec<_> = coordinators
        .drain(..3)
        .map(|mut coord| {
            tokio::spawn(async move {
                coord.accept().await;
                coord.expect_pull().await;
                coord.send(Msg::Err("malformed".into())).await;
            })
        })
        .collect();

    let err = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap_err();
    for task in served {
        task.await.unwrap();
    }

    match err {
        ClientErr::TransportExhausted {
            failures,
            last,
            stats,
        } => {
            assert_eq!(failures, 3);
            assert!(matches!(last, TransportFailure::UnexpectedMessage { .. }));
            assert_eq!(stats.transport_failures, 3);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn an_unacknowledged_reply_is_sent_again_after_reconnecting() {
    let (first, mut coord_a) = link();
    let (second, mut coord_b) = link();
    let (connector, attempts) = ScriptedConnector::new(vec![Some(first), Some(second)]);

    let coordinator = tokio::spawn(async move {
        coord_a.accept().await;
        coord_a.push(1, fit(Config::new())).await;
        let lost = coord_a.reply().await;
        drop(coord_a);

        coord_b.accept().await;
        let resent = coord_b.reply().await;
        assert_eq!(resent, lost);
        coord_b.ack(1).await;

        coord_b.stop(2).await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(stats.transport_failures, 1);
    assert_eq!(stats.fit_rounds, 1);
}

#[tokio::test]
async fn an_ack_for_another_round_is_a_transport_failure() {
    let (first, mut coord_a) = link();
    let (second, mut coord_b) = link();
    let (connector, _) = ScriptedConnector::new(vec![Some(first), Some(second)]);

    let coordinator = tokio::spawn(async move {
        coord_a.accept().await;
        coord_a.push(7, fit(Config::new())).await;
        coord_a.reply().await;
        coord_a.ack(6).await;

        coord_b.accept().await;
        assert_eq!(coord_b.reply().await.round, 7);
        coord_b.ack(7).await;
        coord_b.stop(8).await;
    });

    let (stats, _) = RoundLoop::new(session(), connector, loop_config(3))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(stats.transport_failures, 1);
}

#[tokio::test]
async fn reconnect_does_not_count_as_a_failure() {
    let (first, mut coord_a) = link();
    let (second, mut coord_b) = link();
    let (connector, attempts) = ScriptedConnector::new(vec![Some(first), Some(second)]);

    let coordinator = tokio::spawn(async move {
        coord_a.accept().await;
        let res = coord_a
            .round(1, Instruction::Reconnect(ReconnectIns { seconds: 0 }))
            .await;
        assert_eq!(
            res.reply,
            Reply::Disconnect(DisconnectRes {
                reason: "reconnect".into()
            })
        );

        coord_b.accept().await;
        coord_b.stop(2).await;
    });

    // A single failure would be fatal here.
    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(1))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(stats.transport_failures, 0);
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn a_lost_ack_on_a_reconnect_reply_still_reconnects() {
    let (first, mut coord_a) = link();
    let (second, mut coord_b) = link();
    let (connector, attempts) = ScriptedConnector::new(vec![Some(first), Some(second)]);

    let coordinator = tokio::spawn(async move {
        coord_a.accept().await;
        coord_a
            .push(1, Instruction::Reconnect(ReconnectIns { seconds: 0 }))
            .await;
        coord_a.reply().await;
        drop(coord_a);

        // The next thing on the new connection is a pull, not a resent reply.
        coord_b.accept().await;
        coord_b.stop(2).await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(1))
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(stats.transport_failures, 0);
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn shutdown_is_honored_between_rounds() {
    let (stream, mut coord) = link();
    let (connector, _) = ScriptedConnector::new(vec![Some(stream)]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;
        coord.push(1, fit(Config::new())).await;
        let res = coord.reply().await;
        assert_eq!(res.reply.error_kind(), None);

        shutdown_tx.send(true).unwrap();
        coord.ack(1).await;
    });

    let (stats, termination) = RoundLoop::new(session(), connector, loop_config(3))
        .with_shutdown(shutdown_rx)
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Shutdown);
    assert_eq!(stats.rounds, 1);
}

/// Sleeps well past the compute timeout before echoing its input.
struct SlowTrainer;

impl LocalTrainer for SlowTrainer {
    fn train(&mut self, state: ModelState, _: &Config) -> Result<Fitted, EngineError> {
        thread::sleep(Duration::from_millis(300));
        Ok(Fitted {
            state,
            num_examples: 1,
            metrics: Metrics::new(),
        })
    }
}

#[tokio::test]
async fn an_expired_compute_timeout_fails_only_that_round() {
    let engine = engine();
    let session = Arc::new(
        ClientSession::new(
            ClientId::new(CLIENT),
            codec(),
            engine.initial_state(DType::F32),
            SlowTrainer,
            engine,
        )
        .unwrap(),
    );

    let (stream, mut coord) = link();
    let (connector, _) = ScriptedConnector::new(vec![Some(stream)]);

    let coordinator = tokio::spawn(async move {
        coord.accept().await;
        let res = coord.round(1, fit(Config::new())).await;
        assert_eq!(res.reply.error_kind(), Some("local_compute"));
        coord.stop(2).await;
    });

    let mut cfg = loop_config(3);
    cfg.compute_timeout = Some(Duration::from_millis(20));

    let (stats, termination) = RoundLoop::new(session, connector, cfg)
        .run()
        .await
        .unwrap();
    coordinator.await.unwrap();

    assert_eq!(termination, Termination::Stopped);
    assert_eq!(stats.failed_rounds, 1);
}
