//! Population control: grows the number of concurrent virtual users to a
//! target at a bounded spawn rate, holds it there, adjusts it on request and
//! stops everyone cooperatively.
//!
//! A [`Scheduler`] owns one background control loop per run. The loop
//! spawns each user as its own tokio task, linked to the run through a child
//! [`CancellationToken`], so stopping the run is a single cancellation that
//! reaches every user at its next checkpoint.

mod ramp;

#[cfg(feature = "internals")]
pub use ramp::{calc_spawn_budget, class_rng, user_rngs, MAX_BUDGET};

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    clock::{Clock, TokioClock},
    collector::{MetricsCollector, MetricsSnapshot},
    error::{SchedulerError, WorkloadError},
    runner::{PopulationGauge, PopulationStats, RunnerContext},
    workload::Workload,
};
use ramp::Ramp;

struct Control {
    target: watch::Sender<usize>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Default)]
enum State {
    #[default]
    Idle,
    Running(Control),
    Stopped,
}

/// Drives a [`Workload`] with a population of virtual users.
///
/// ```no_run
/// # use std::time::Duration;
/// # use futures::FutureExt;
/// # use throng::{Completion, Scheduler, Task, TaskRegistry, UserClass, Workload};
/// # async fn demo() -> anyhow::Result<()> {
/// let tasks = TaskRegistry::new().with_task(Task::new("ping", 1, |_| {
///     async { Ok(Completion::Done) }.boxed()
/// }))?;
/// let workload = Workload::new().with_class(UserClass::new("pinger", tasks))?;
///
/// let mut scheduler = Scheduler::builder().workload(workload).seed(7).build();
/// let snapshot = scheduler.run_for(50, 10.0, Duration::from_secs(30)).await?;
/// println!("{} requests", snapshot.count());
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Scheduler {
    /// User classes to draw spawned users from.
    workload: Workload,
    /// Sink of every outcome recorded by the users.
    #[builder(default = Arc::new(MetricsCollector::new()))]
    metrics: Arc<MetricsCollector>,
    /// Time source of think times and latency measurement.
    #[builder(default = Arc::new(TokioClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
    /// Makes class picks and every user's random choices reproducible.
    #[builder(default, setter(strip_option))]
    seed: Option<u64>,
    /// Granularity of the control loop.
    #[builder(default = Duration::from_millis(100))]
    tick: Duration,
    #[builder(default, setter(skip))]
    gauge: Arc<PopulationGauge>,
    #[builder(default, setter(skip))]
    state: State,
}

impl Scheduler {
    /// Starts ramping towards `target` users, `spawn_rate` users per second.
    ///
    /// Must be called from within a tokio runtime. Returns immediately; the
    /// population grows in the background.
    pub fn start(&mut self, target: usize, spawn_rate: f64) -> Result<(), SchedulerError> {
        match self.state {
            State::Idle => {}
            State::Running(_) => return Err(SchedulerError::AlreadyStarted),
            State::Stopped => return Err(SchedulerError::Stopped),
        }
        if !spawn_rate.is_finite() || spawn_rate <= 0.0 {
            return Err(SchedulerError::InvalidSpawnRate(spawn_rate));
        }
        if self.workload.is_empty() {
            return Err(WorkloadError::NoUserClasses.into());
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let (target_tx, target_rx) = watch::channel(target);
        let cancel = CancellationToken::new();
        self.gauge.set_target(target);

        let ramp = Ramp::new(
            self.workload.clone(),
            RunnerContext {
                metrics: Arc::clone(&self.metrics),
                clock: Arc::clone(&self.clock),
            },
            Arc::clone(&self.gauge),
            self.seed,
            spawn_rate,
            self.tick,
            target_rx,
            cancel.clone(),
        );
        tracing::info!(users = target, spawn_rate, "Starting population");
        self.metrics.begin_run(Arc::clone(&self.clock));
        let join = runtime.spawn(ramp.run());

        self.state = State::Running(Control {
            target: target_tx,
            cancel,
            join,
        });
        Ok(())
    }

    /// Changes the target of a running population. The control loop ramps
    /// towards it at the configured spawn rate.
    pub fn set_target(&self, target: usize) -> Result<(), SchedulerError> {
        let control = match &self.state {
            State::Running(control) => control,
            State::Idle => return Err(SchedulerError::NotStarted),
            State::Stopped => return Err(SchedulerError::Stopped),
        };
        tracing::info!(users = target, "Changing population target");
        self.gauge.set_target(target);
        // the loop only goes away through `stop`, which also consumes the sender
        let _ = control.target.send(target);
        Ok(())
    }

    /// Stops every user and waits for all of them to finish their in-flight
    /// action. Once this returns no further outcome is recorded.
    ///
    /// Stopping an already stopped scheduler does nothing.
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        let control = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(control) => control,
            State::Idle => {
                self.state = State::Idle;
                return Err(SchedulerError::NotStarted);
            }
            State::Stopped => return Ok(()),
        };
        control.cancel.cancel();
        if let Err(e) = control.join.await {
            tracing::error!("Population control loop failed: {e}");
        }
        self.metrics.finish_run();
        Ok(())
    }

    /// Runs `target` users for `duration` (ramp-up included), stops them and
    /// returns the collected metrics.
    pub async fn run_for(
        &mut self,
        target: usize,
        spawn_rate: f64,
        duration: Duration,
    ) -> Result<MetricsSnapshot, SchedulerError> {
        self.start(target, spawn_rate)?;
        tokio::time::sleep(duration).await;
        self.stop().await?;
        Ok(self.metrics.snapshot())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    pub fn population(&self) -> PopulationStats {
        self.gauge.stats()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let State::Running(control) = &self.state {
            tracing::warn!("Scheduler dropped while running, cancelling users");
            control.cancel.cancel();
        }
    }
}
