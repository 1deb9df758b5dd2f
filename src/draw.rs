//! Rendezvous gate for the draw.
//!
//! Every agency that finishes submitting calls [`DrawGate::arrive`] and
//! blocks until the expected number of agencies has arrived. The arrival
//! that completes the count is the leader: it performs the draw by marking
//! the round complete, which releases every waiter at once. The gate runs a
//! single round per process; arrivals after it settles observe the settled
//! outcome immediately.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Complete,
    Aborted,
}

struct GateState {
    arrivals: usize,
    phase: Phase,
}

/// How one agency's wait at the gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    /// Every expected agency arrived. The leader is the arrival that
    /// completed the count.
    Released { leader: bool },
    /// This waiter gave up before the round settled.
    TimedOut,
    /// The gate was shut down before the round completed.
    Aborted,
}

pub struct DrawGate {
    expected: usize,
    wait_ceiling: Duration,
    // The channel is both the lock and the broadcast: arrivals mutate the
    // state under its write lock, waiters watch for the phase to leave Open.
    state: watch::Sender<GateState>,
}

impl DrawGate {
    /// `expected` is the number of arrivals that completes the round and
    /// must be at least 1; `wait_ceiling` bounds each individual wait.
    pub fn new(expected: usize, wait_ceiling: Duration) -> Self {
        let (state, _) = watch::channel(GateState {
            arrivals: 0,
            phase: Phase::Open,
        });
        Self {
            expected,
            wait_ceiling,
            state,
        }
    }

    /// Registers one arrival and waits for the round to settle.
    ///
    /// The count check and the phase flip happen under the channel's write
    /// lock, so exactly one arrival becomes the leader no matter how many
    /// agencies finish simultaneously. A timeout expires only this waiter;
    /// the round stays open for the rest.
    pub async fn arrive(&self) -> DrawOutcome {
        let mut watcher = self.state.subscribe();

        let mut settled = None;
        let mut leader = false;
        self.state.send_modify(|state| match state.phase {
            Phase::Open => {
                state.arrivals += 1;
                if state.arrivals == self.expected {
                    state.phase = Phase::Complete;
                    leader = true;
                }
            }
            Phase::Complete => settled = Some(DrawOutcome::Released { leader: false }),
            Phase::Aborted => settled = Some(DrawOutcome::Aborted),
        });
        if let Some(outcome) = settled {
            return outcome;
        }
        if leader {
            info!(agencies = self.expected, "all agencies finished, draw complete");
            return DrawOutcome::Released { leader: true };
        }

        let wait = watcher.wait_for(|state| state.phase != Phase::Open);
        // wait_for's guard borrows the watcher; copy the phase out so the
        // borrow ends inside this statement.
        let phase = match timeout(self.wait_ceiling, wait).await {
            Ok(Ok(state)) => state.phase,
            // The sender lives in self; a closed channel means the gate is
            // being torn down.
            Ok(Err(_)) => return DrawOutcome::Aborted,
            Err(_) => return DrawOutcome::TimedOut,
        };
        if phase == Phase::Aborted {
            DrawOutcome::Aborted
        } else {
            DrawOutcome::Released { leader: false }
        }
    }

    /// Shuts the gate. Waiters are released with [`DrawOutcome::Aborted`];
    /// a round that already completed keeps its outcome.
    pub fn abort(&self) {
        self.state.send_modify(|state| {
            if state.phase == Phase::Open {
                state.phase = Phase::Aborted;
            }
        });
    }
}
