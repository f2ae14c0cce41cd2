use std::{future::Future, sync::Arc, time::Duration};

use comms::{
    msg::{Command, Msg},
    task::{Instruction, Reply, TaskIns, TaskRes},
};
use engine::EngineError;
use log::{debug, info, warn};
use tokio::{
    sync::watch,
    task,
    time::{self, Instant},
};

use crate::{
    error::{ClientErr, RoundError, TransportFailure},
    metrics::RoundStats,
    net::{Connection, Connector},
    retry::RetryPolicy,
    session::ClientSession,
};

/// Timing and retry settings of a `RoundLoop`.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Bound on every network operation: connect, send, awaiting an answer.
    /// The coordinator must answer a pull within this bound, with `NoTask`
    /// if it has nothing to hand out.
    pub network_timeout: Duration,
    /// Bound on one local computation. `None` waits for as long as it takes.
    pub compute_timeout: Option<Duration>,
    /// Pause between pulls while the coordinator has nothing for this client.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(10),
            compute_timeout: None,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why `RoundLoop::run` returned cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The coordinator sent `Stop` or disconnected us explicitly.
    Stopped,
    /// The coordinator closed the channel with nothing pending.
    Closed,
    /// Local shutdown was requested between two rounds.
    Shutdown,
}

/// What to do once a connection stops being served.
enum Step {
    Done(Termination),
    Reconnect(Duration),
}

/// Owns the connection to the coordinator and drives the session round by
/// round.
///
/// Design:
/// - One instruction is serviced at a time: pull, compute, reply, await ack.
/// - Compute is CPU-bound and runs on Tokio's blocking pool via
///   `spawn_blocking`, with no timeout unless one is configured.
/// - Every network operation is bounded by `network_timeout`.
/// - Transport failures reconnect with exponential backoff. A reply whose
///   delivery failed is kept and sent first on the next connection.
pub struct RoundLoop<C> {
    session: Arc<ClientSession>,
    connector: C,
    cfg: LoopConfig,
    stats: RoundStats,
    pending: Option<TaskRes>,
    /// Set once the current connection carried a well-formed exchange.
    progressed: bool,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> RoundLoop<C> {
    pub fn new(session: Arc<ClientSession>, connector: C, cfg: LoopConfig) -> Self {
        let (_, shutdown) = watch::channel(false);

        Self {
            session,
            connector,
            cfg,
            stats: RoundStats::default(),
            pending: None,
            progressed: false,
            shutdown,
        }
    }

    /// Stops the loop at the next round boundary once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stats(&self) -> &RoundStats {
        &self.stats
    }

    /// Runs rounds until the coordinator ends the session.
    ///
    /// # Returns
    /// The accumulated stats and the reason the loop ended.
    ///
    /// # Errors
    /// `ClientErr::TransportExhausted` once `max_consecutive_failures`
    /// transport failures happened in a row. The error carries the stats
    /// accumulated so far.
    pub async fn run(mut self) -> Result<(RoundStats, Termination), ClientErr> {
        let max_failures = self.cfg.retry.max_consecutive_failures;
        let mut backoff = self.cfg.retry.backoff();
        let mut failures = 0;

        loop {
            if self.shutdown_requested() {
                return Ok((self.stats, Termination::Shutdown));
            }

            let result = match self.open().await {
                Ok(mut conn) => {
                    self.progressed = false;
                    let step = self.serve(&mut conn).await;

                    let limit = self.cfg.network_timeout;
                    if let Err(e) = timed(limit, "close", conn.close()).await {
                        debug!("closing the connection failed: {e}");
                    }

                    // Only a well-formed exchange resets the retry budget.
                    if self.progressed {
                        failures = 0;
                        backoff = self.cfg.retry.backoff();
                    }
                    step
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(Step::Done(termination)) => {
                    info!(
                        rounds = self.stats.rounds,
                        failed = self.stats.failed_rounds;
                        "round loop finished: {termination:?}"
                    );
                    return Ok((self.stats, termination));
                }
                Ok(Step::Reconnect(after)) => {
                    info!(seconds = after.as_secs(); "reconnecting on request");
                    self.stats.bump_reconnect();
                    self.pause(after).await;
                }
                Err(e) => {
                    failures += 1;
                    self.stats.bump_transport_failure();

                    if failures >= max_failures {
                        return Err(ClientErr::TransportExhausted {
                            failures,
                            last: e,
                            stats: self.stats,
                        });
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        attempt = failures,
                        max = max_failures,
                        delay_ms = delay.as_millis() as u64;
                        "transport failure: {e}"
                    );
                    self.stats.bump_reconnect();
                    self.pause(delay).await;
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps for `delay`, waking up early on a shutdown request.
    async fn pause(&mut self, delay: Duration) {
        let shutdown = &mut self.shutdown;
        tokio::select! {
            _ = time::sleep(delay) => {}
            Ok(()) = shutdown.changed() => {}
        }
    }

    /// Connects and says hello.
    async fn open(&mut self) -> Result<C::Conn, TransportFailure> {
        let limit = self.cfg.network_timeout;

        let mut conn = timed(limit, "connect", self.connector.connect()).await?;

        let hello = Msg::Control(Command::Hello {
            client_id: self.session.client_id().clone(),
        });
        timed(limit, "send hello", conn.send(&hello)).await?;

        match timed(limit, "await welcome", conn.recv()).await? {
            Some(Msg::Control(Command::Welcome)) => {
                debug!(client_id = self.session.client_id().as_str(); "coordinator welcomed us");
                Ok(conn)
            }
            Some(other) => Err(unexpected("control/welcome", &other)),
            None => Err(TransportFailure::Closed),
        }
    }

    /// Serves instructions over one connection until it must be left.
    async fn serve(&mut self, conn: &mut C::Conn) -> Result<Step, TransportFailure> {
        let limit = self.cfg.network_timeout;

        if let Some(res) = self.pending.take() {
            debug!(round = res.round; "re-sending a reply the coordinator never acknowledged");
            self.deliver(conn, res).await?;
        }

        loop {
            if self.shutdown_requested() {
                return Ok(Step::Done(Termination::Shutdown));
            }

            let pull = Msg::Control(Command::Pull {
                client_id: self.session.client_id().clone(),
            });
            timed(limit, "send pull", conn.send(&pull)).await?;

            let task = match timed(limit, "await instruction", conn.recv()).await? {
                Some(Msg::Instruction(task)) => {
                    self.progressed = true;
                    task
                }
                Some(Msg::Control(Command::NoTask)) => {
                    self.progressed = true;
                    self.pause(self.cfg.poll_interval).await;
                    continue;
                }
                Some(Msg::Control(Command::Disconnect { reason })) => {
                    info!(reason = reason.as_str(); "coordinator ended the session");
                    return Ok(Step::Done(Termination::Stopped));
                }
                Some(other) => return Err(unexpected("instruction", &other)),
                None => return Ok(Step::Done(Termination::Closed)),
            };

            if let Some(step) = self.round(conn, task).await? {
                return Ok(step);
            }
        }
    }

    /// Answers one instruction. Returns the step to take if the instruction
    /// ends this connection.
    async fn round(
        &mut self,
        conn: &mut C::Conn,
        task: TaskIns,
    ) -> Result<Option<Step>, TransportFailure> {
        let TaskIns { round, instruction } = task;
        let after = match &instruction {
            Instruction::Stop => Some(Step::Done(Termination::Stopped)),
            Instruction::Reconnect(ins) => Some(Step::Reconnect(Duration::from_secs(ins.seconds))),
            _ => None,
        };

        let started = Instant::now();
        let reply = self.compute(instruction).await;
        let took = started.elapsed();

        info!(
            round = round,
            kind = reply.kind(),
            outcome = reply.error_kind().unwrap_or("ok"),
            num_examples = reply.num_examples(),
            duration_ms = took.as_millis() as u64;
            "round done"
        );
        self.stats.record(&reply, took);

        let res = TaskRes {
            client_id: self.session.client_id().clone(),
            round,
            reply,
        };

        // The connection is left either way once these are answered.
        let leaves = after.is_some();
        match self.deliver(conn, res).await {
            Ok(()) => Ok(after),
            Err(e) if leaves => {
                debug!("final reply not acknowledged: {e}");
                self.pending = None;
                Ok(after)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the session on the blocking pool.
    async fn compute(&self, instruction: Instruction) -> Reply {
        let kind = instruction.kind();
        let session = Arc::clone(&self.session);
        let handle = task::spawn_blocking(move || session.handle(instruction));

        let joined = match self.cfg.compute_timeout {
            Some(limit) => match time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    let err = RoundError::ComputeTimeout(limit);
                    warn!(kind = kind; "round failed: {err}");
                    return self.session.error_reply(kind, &err);
                }
            },
            None => handle.await,
        };

        joined.unwrap_or_else(|e| {
            let err = RoundError::LocalCompute(EngineError::other(format!(
                "compute task failed: {e}"
            )));
            warn!(kind = kind; "round failed: {err}");
            self.session.error_reply(kind, &err)
        })
    }

    /// Sends `res` and waits for its acknowledgement. On failure the reply is
    /// kept as pending.
    async fn deliver(&mut self, conn: &mut C::Conn, res: TaskRes) -> Result<(), TransportFailure> {
        let round = res.round;
        let msg = Msg::Reply(res);

        let result = self.exchange_reply(conn, &msg, round).await;
        match (&result, msg) {
            (Ok(()), _) => self.progressed = true,
            (Err(_), Msg::Reply(res)) => self.pending = Some(res),
            (Err(_), _) => {}
        }
        result
    }

    async fn exchange_reply(
        &self,
        conn: &mut C::Conn,
        msg: &Msg,
        round: u64,
    ) -> Result<(), TransportFailure> {
        let limit = self.cfg.network_timeout;

        timed(limit, "send reply", conn.send(msg)).await?;

        match timed(limit, "await ack", conn.recv()).await? {
            Some(Msg::Control(Command::Ack { round: acked })) if acked == round => Ok(()),
            Some(Msg::Control(Command::Ack { round: acked })) => Err(TransportFailure::RoundMismatch {
                expected: round,
                got: acked,
            }),
            Some(other) => Err(unexpected("control/ack", &other)),
            None => Err(TransportFailure::Closed),
        }
    }
}

/// Bounds a network operation by `limit`.
async fn timed<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, TransportFailure>
where
    F: Future<Output = Result<T, TransportFailure>>,
{
    time::timeout(limit, fut)
        .await
        .map_err(|_| TransportFailure::Timeout { op })?
}

fn unexpected(expected: &'static str, got: &Msg) -> TransportFailure {
    if let Msg::Err(text) = got {
        warn!("coordinator reported an error: {text}");
    }

    TransportFailure::UnexpectedMessage {
        expected,
        got: got.kind(),
    }
}
