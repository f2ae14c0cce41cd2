use std::time::Duration;

use comms::task::Reply;

/// Counters accumulated by the round loop over the life of the process.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoundStats {
    pub compute_time: Duration,

    pub rounds: u64,
    pub fit_rounds: u64,
    pub evaluate_rounds: u64,
    pub failed_rounds: u64,
    pub samples: u64,

    pub transport_failures: u64,
    pub reconnects: u64,
}

impl RoundStats {
    /// Accounts for one answered instruction.
    pub fn record(&mut self, reply: &Reply, took: Duration) {
        self.rounds += 1;
        self.compute_time += took;
        self.samples += reply.num_examples();

        match reply {
            Reply::Fit(_) => self.fit_rounds += 1,
            Reply::Evaluate(_) => self.evaluate_rounds += 1,
            _ => {}
        }

        if reply.error_kind().is_some() {
            self.failed_rounds += 1;
        }
    }

    #[inline]
    pub fn bump_transport_failure(&mut self) {
        self.transport_failures += 1;
    }

    #[inline]
    pub fn bump_reconnect(&mut self) {
        self.reconnects += 1;
    }
}
