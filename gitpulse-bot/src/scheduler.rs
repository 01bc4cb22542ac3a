//! Background polling task.
//!
//! Runs a cycle as soon as the start delay has passed (zero by default),
//! then one per interval. The interval can be changed while running and
//! takes effect on the next wait. Shutdown interrupts any wait at once; a
//! running cycle stops before its next source.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::poller::Poller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => f.write_str("idle"),
            SchedulerState::Polling => f.write_str("polling"),
        }
    }
}

/// Control side of a running scheduler.
pub struct Scheduler {
    interval: watch::Sender<Duration>,
    state: watch::Receiver<SchedulerState>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Spawn the polling loop with the first cycle due now. Returns the
    /// control handle and the task.
    pub fn spawn(poller: Arc<Poller>, interval: Duration) -> (Self, JoinHandle<()>) {
        Self::spawn_after(poller, interval, Duration::ZERO)
    }

    /// Like [`Scheduler::spawn`], but the first cycle waits `start_delay`.
    pub fn spawn_after(
        poller: Arc<Poller>,
        interval: Duration,
        start_delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (interval_tx, interval_rx) = watch::channel(interval);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(poller, interval_rx, state_tx, shutdown_rx, start_delay));
        let scheduler = Self {
            interval: interval_tx,
            state: state_rx,
            shutdown: shutdown_tx,
        };
        (scheduler, task)
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    /// Change the poll interval. Zero is rejected.
    pub fn set_interval(&self, interval: Duration) -> Result<(), ZeroInterval> {
        if interval.is_zero() {
            return Err(ZeroInterval);
        }
        self.interval.send_replace(interval);
        tracing::info!(secs = interval.as_secs(), "Poll interval changed");
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Receiver for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Ask the loop to stop. Await the task to know when it has.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("poll interval must be positive")]
pub struct ZeroInterval;

async fn run(
    poller: Arc<Poller>,
    interval: watch::Receiver<Duration>,
    state: watch::Sender<SchedulerState>,
    mut shutdown: watch::Receiver<bool>,
    start_delay: Duration,
) {
    tracing::info!(secs = interval.borrow().as_secs(), "Scheduler started");
    let mut wait = start_delay;
    loop {
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        state.send_replace(SchedulerState::Polling);
        let report = poller.poll_cycle(&shutdown).await;
        state.send_replace(SchedulerState::Idle);
        tracing::info!(
            attempted = report.attempted,
            failed = report.failed,
            skipped = report.skipped,
            new_events = report.new_events,
            "Poll cycle finished"
        );
        if report.cancelled {
            break;
        }
        wait = *interval.borrow();
    }
    tracing::info!("Scheduler stopped");
}
