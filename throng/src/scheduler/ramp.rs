//! The population control loop.
//!
//! Every `tick` the loop compares the live population with the target and
//! spawns or retires users, never more than `spawn_rate * elapsed` of them
//! (plus the carried fraction) per tick:
//!
//! ```text
//! budget_f  = spawn_rate * elapsed_seconds + fractional
//! budget    = floor(budget_f)
//! fractional = budget_f - budget
//! ```
//!
//! `elapsed` is measured between ticks, so a late tick never lets the loop
//! catch up with a burst above the configured rate. The first tick of a run
//! counts as a full tick, which puts the first user in place immediately.
//!
//! Ramp-down retires the most recently spawned users first. A retired user
//! finishes its in-flight action and is reaped once its task completes.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use rand::rngs::StdRng;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    runner::{PopulationGauge, RunnerContext, UserExit, UserSlot, UserState, VirtualUser},
    session::Session,
    workload::Workload,
};
use internals::*;

struct UserHandle {
    slot: Arc<UserSlot>,
    cancel: CancellationToken,
    join: JoinHandle<UserExit>,
}

pub(crate) struct Ramp {
    workload: Workload,
    ctx: RunnerContext,
    gauge: Arc<PopulationGauge>,
    seed: Option<u64>,
    spawn_rate: f64,
    tick: Duration,
    target: watch::Receiver<usize>,
    cancel: CancellationToken,
    users: Vec<UserHandle>,
    retiring: Vec<UserHandle>,
    class_rng: StdRng,
    next_index: usize,
}

impl Ramp {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workload: Workload,
        ctx: RunnerContext,
        gauge: Arc<PopulationGauge>,
        seed: Option<u64>,
        spawn_rate: f64,
        tick: Duration,
        target: watch::Receiver<usize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workload,
            ctx,
            gauge,
            seed,
            spawn_rate,
            tick,
            target,
            cancel,
            users: Vec::new(),
            retiring: Vec::new(),
            class_rng: class_rng(seed),
            next_index: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(spawn_rate = self.spawn_rate, tick = ?self.tick, "Ramp started");
        let mut fractional = 0.0;
        let mut last_tick: Option<Instant> = None;
        let mut next_tick = Instant::now();
        let mut settled = false;

        loop {
            let now = Instant::now();
            let elapsed = last_tick.map_or(self.tick, |last| now.duration_since(last));
            last_tick = Some(now);

            let target = *self.target.borrow_and_update();
            let current = self.users.len();
            if current == target {
                fractional = 0.0;
                if !settled {
                    tracing::info!(users = target, "Population reached target");
                    settled = true;
                }
            } else {
                settled = false;
                let (budget, carry) = calc_spawn_budget(self.spawn_rate, elapsed, fractional);
                fractional = carry;
                if current < target {
                    for _ in 0..budget.min(target - current) {
                        self.spawn_user();
                    }
                } else {
                    for _ in 0..budget.min(current - target) {
                        self.retire_user();
                    }
                }
            }
            self.reap_retired().await;

            next_tick += self.tick;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.shutdown().await;
    }

    fn spawn_user(&mut self) {
        let Some(class) = self.workload.pick_class(&mut self.class_rng).cloned() else {
            return;
        };
        let index = self.next_index;
        self.next_index += 1;

        let slot = UserSlot::new(index, Arc::clone(&self.gauge));
        let cancel = self.cancel.child_token();
        let (runner_rng, session_rng) = user_rngs(self.seed, index);
        let session = Session::new(index, class.name(), session_rng);
        tracing::trace!(user = index, class = class.name(), "Spawning user");

        let user = VirtualUser::new(
            class,
            session,
            runner_rng,
            Arc::clone(&slot),
            cancel.clone(),
            self.ctx.clone(),
        );
        let join = tokio::spawn(user.run());
        self.users.push(UserHandle { slot, cancel, join });
    }

    fn retire_user(&mut self) {
        if let Some(user) = self.users.pop() {
            tracing::trace!(user = user.slot.index(), "Retiring user");
            user.slot.advance(UserState::Stopping);
            user.cancel.cancel();
            self.retiring.push(user);
        }
    }

    async fn reap_retired(&mut self) {
        if self.retiring.is_empty() {
            return;
        }
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|user| user.join.is_finished());
        self.retiring = pending;
        for user in done {
            join_user(user).await;
        }
    }

    async fn shutdown(mut self) {
        tracing::info!(
            users = self.users.len() + self.retiring.len(),
            "Stopping population..."
        );
        let users: Vec<UserHandle> = self
            .users
            .drain(..)
            .chain(self.retiring.drain(..))
            .collect();
        for user in &users {
            user.slot.advance(UserState::Stopping);
            user.cancel.cancel();
        }
        join_all(users.into_iter().map(join_user)).await;
        tracing::info!("Population stopped");
    }
}

async fn join_user(user: UserHandle) {
    let index = user.slot.index();
    match user.join.await {
        Ok(exit) => tracing::trace!(user = index, ?exit, "User finished"),
        // the runner's drop guard already moved the slot to stopped
        Err(e) => tracing::error!(user = index, "User task failed: {e}"),
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Arithmetic of the control loop, kept pure so it can be tested without a
/// runtime.
mod internals {
    use super::*;
    use rand::SeedableRng;

    /// Upper bound of users spawned or retired in a single tick.
    pub const MAX_BUDGET: usize = u32::MAX as usize;

    /// Number of users the loop may spawn (or retire) after `elapsed` at
    /// `spawn_rate` users per second, carrying the fractional part over to
    /// the next tick.
    ///
    /// Returns `(budget, next_fractional_part)`.
    pub fn calc_spawn_budget(spawn_rate: f64, elapsed: Duration, fractional: f64) -> (usize, f64) {
        let add_f = spawn_rate * elapsed.as_secs_f64();

        let budget_f = (add_f + fractional).floor();
        let fractional = (add_f + fractional) - budget_f;

        let budget = if budget_f >= MAX_BUDGET as f64 {
            MAX_BUDGET
        } else if budget_f < 0.0 {
            0
        } else {
            budget_f as usize
        };

        (budget, fractional)
    }

    /// The two independent random streams of user `index`: one drives task
    /// and think time selection, the other is handed to the user's session.
    /// Seeded runs are reproducible per user regardless of spawn timing.
    pub fn user_rngs(seed: Option<u64>, index: usize) -> (StdRng, StdRng) {
        match seed {
            Some(seed) => {
                let base = seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                (
                    StdRng::seed_from_u64(base),
                    StdRng::seed_from_u64(base.rotate_left(32) ^ 0x5EED),
                )
            }
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        }
    }

    /// Random stream picking the class of every spawned user.
    pub fn class_rng(seed: Option<u64>) -> StdRng {
        seed.map_or_else(StdRng::from_entropy, |seed| {
            StdRng::seed_from_u64(seed.wrapping_add(0xC1A55))
        })
    }
}
