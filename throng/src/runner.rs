//! A single virtual user and the shared gauges that count users per state.
//!
//! Lifecycle: `Starting` (start hook) -> `Running` (task loop) -> `Stopping`
//! (cancellation observed, in-flight action allowed to finish) -> `Stopped`.
//! A failed start hook jumps straight from `Starting` to `Stopped`.
//!
//! States only ever move forward. The transition is a CAS on the user's
//! [`UserSlot`], so the scheduler can mark a user as stopping at the exact
//! moment it decides to retire it, even while the user is in the middle of a
//! request.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    clock::Clock,
    collector::MetricsCollector,
    outcome::Outcome,
    session::Session,
    task::Completion,
    workload::UserClass,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UserState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl UserState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => UserState::Starting,
            1 => UserState::Running,
            2 => UserState::Stopping,
            _ => UserState::Stopped,
        }
    }
}

/// Live counters of the population, one per state.
#[derive(Debug, Default)]
pub struct PopulationGauge {
    target: AtomicUsize,
    spawned: AtomicUsize,
    starting: AtomicUsize,
    running: AtomicUsize,
    stopping: AtomicUsize,
    stopped: AtomicUsize,
    startup_failures: AtomicUsize,
}

impl PopulationGauge {
    fn counter(&self, state: UserState) -> &AtomicUsize {
        match state {
            UserState::Starting => &self.starting,
            UserState::Running => &self.running,
            UserState::Stopping => &self.stopping,
            UserState::Stopped => &self.stopped,
        }
    }

    pub(crate) fn set_target(&self, target: usize) {
        self.target.store(target, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PopulationStats {
        PopulationStats {
            target: self.target.load(Ordering::SeqCst),
            spawned: self.spawned.load(Ordering::SeqCst),
            starting: self.starting.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            stopping: self.stopping.load(Ordering::SeqCst),
            stopped: self.stopped.load(Ordering::SeqCst),
            startup_failures: self.startup_failures.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of a [`PopulationGauge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub target: usize,
    pub spawned: usize,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub startup_failures: usize,
}

/// Shared view of one user's state.
#[derive(Debug)]
pub struct UserSlot {
    index: usize,
    state: AtomicU8,
    gauge: Arc<PopulationGauge>,
}

impl UserSlot {
    /// Registers a new user in `Starting` state.
    pub(crate) fn new(index: usize, gauge: Arc<PopulationGauge>) -> Arc<Self> {
        gauge.spawned.fetch_add(1, Ordering::SeqCst);
        gauge.starting.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            index,
            state: AtomicU8::new(UserState::Starting as u8),
            gauge,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> UserState {
        UserState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves the user forward to `to`. Returns `false` when the user is
    /// already at or past `to`.
    pub(crate) fn advance(&self, to: UserState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.gauge
                        .counter(UserState::from_u8(current))
                        .fetch_sub(1, Ordering::SeqCst);
                    self.gauge.counter(to).fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn fail_startup(&self) {
        self.gauge.startup_failures.fetch_add(1, Ordering::SeqCst);
        self.advance(UserState::Stopped);
    }
}

/// How a user's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserExit {
    /// The start hook failed; no task was executed.
    StartupFailed,
    /// Stopped cooperatively after `iterations` task executions.
    Stopped { iterations: u64 },
}

/// Everything a user needs from the population besides its own state.
#[derive(Clone)]
pub(crate) struct RunnerContext {
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// One simulated user. Owns its session; nothing in it is shared with other
/// users except the metrics sink and the clock.
pub struct VirtualUser {
    class: Arc<UserClass>,
    session: Session,
    rng: StdRng,
    slot: Arc<UserSlot>,
    cancel: CancellationToken,
    ctx: RunnerContext,
}

impl VirtualUser {
    pub(crate) fn new(
        class: Arc<UserClass>,
        session: Session,
        rng: StdRng,
        slot: Arc<UserSlot>,
        cancel: CancellationToken,
        ctx: RunnerContext,
    ) -> Self {
        Self {
            class,
            session,
            rng,
            slot,
            cancel,
            ctx,
        }
    }

    pub async fn run(mut self) -> UserExit {
        let user = self.slot.index();
        debug!(user, class = self.class.name(), "User starting");

        let started = AssertUnwindSafe(self.class.start_session(&mut self.session))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic)))
            });
        if let Err(error) = started {
            warn!(
                user,
                class = self.class.name(),
                error = %format!("{error:#}"),
                "User failed to start, it will not run any task"
            );
            self.ctx.metrics.record_startup_failure(self.class.name());
            self.slot.fail_startup();
            return UserExit::StartupFailed;
        }

        let iterations = if self.slot.advance(UserState::Running) {
            trace!(user, "User running");
            self.run_tasks().await
        } else {
            0
        };

        self.slot.advance(UserState::Stopping);
        self.slot.advance(UserState::Stopped);
        debug!(user, iterations, "User stopped");
        UserExit::Stopped { iterations }
    }

    async fn run_tasks(&mut self) -> u64 {
        let class = Arc::clone(&self.class);
        let mut iterations = 0;

        while !self.cancel.is_cancelled() {
            let task = match class.tasks().select(&mut self.rng) {
                Ok(task) => task,
                Err(e) => {
                    error!(user = self.slot.index(), "No task to run: {e}");
                    break;
                }
            };

            let started = self.ctx.clock.now();
            let session = &mut self.session;
            // panics in the action body or while building it stay local to this iteration
            let action = AssertUnwindSafe(async move { task.execute(session).await });
            let action = action.catch_unwind();
            tokio::pin!(action);
            let finished = tokio::select! {
                biased;
                result = &mut action => Some(result),
                _ = self.cancel.cancelled() => None,
            };
            let result = match finished {
                Some(result) => result,
                None => {
                    // stop requested mid-action: let it complete, start nothing new
                    self.slot.advance(UserState::Stopping);
                    action.await
                }
            };
            let elapsed = self.ctx.clock.now().saturating_duration_since(started);

            let result = result.unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic)))
            });
            match result {
                Ok(Completion::Done) => {
                    self.ctx
                        .metrics
                        .record(&Outcome::success(task.label(), elapsed));
                }
                Ok(Completion::Skipped) => {
                    trace!(user = self.slot.index(), task = task.name(), "Task skipped");
                }
                Err(error) => {
                    let error = format!("{error:#}");
                    debug!(user = self.slot.index(), task = task.name(), %error, "Task failed");
                    self.ctx
                        .metrics
                        .record(&Outcome::failure(task.label(), elapsed, error));
                }
            }
            iterations += 1;

            if self.cancel.is_cancelled() {
                break;
            }
            let wait = class.think_time().sample(&mut self.rng);
            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = self.ctx.clock.sleep(wait) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        iterations
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

impl Drop for VirtualUser {
    fn drop(&mut self) {
        // an aborted user task drops us mid-loop; keep the gauges honest
        if self.slot.state() != UserState::Stopped {
            warn!(user = self.slot.index(), "User dropped before stopping");
            self.slot.advance(UserState::Stopped);
        }
    }
}
