//! Process-wide outcome collection.
//!
//! Writers spread over a fixed set of shards, each guarded by its own
//! `parking_lot::Mutex`, picked round-robin through an atomic counter. A
//! record holds exactly one shard lock for the duration of a map lookup and a
//! histogram update; a snapshot takes the shard locks one at a time, clones
//! the shard and merges outside the lock. Writers therefore never wait on
//! more than one short critical section and nothing is ever lost.
//!
//! Elapsed time is measured on the run's [`Clock`], from the moment the
//! scheduler starts the run until it stops it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    aggregate::{ActionAggregate, Aggregate},
    clock::Clock,
    outcome::Outcome,
};

type Shard = HashMap<String, ActionAggregate>;

/// Upper bound of the default shard count.
const MAX_DEFAULT_SHARDS: usize = 16;

struct RunWindow {
    clock: Arc<dyn Clock>,
    started: Instant,
    finished: Option<Instant>,
}

impl RunWindow {
    fn elapsed(&self) -> Duration {
        let end = self.finished.unwrap_or_else(|| self.clock.now());
        end.saturating_duration_since(self.started)
    }
}

impl std::fmt::Debug for RunWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWindow")
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MetricsCollector {
    shards: Box<[Mutex<Shard>]>,
    next_shard: AtomicUsize,
    recorded: AtomicU64,
    startup_failures: Mutex<BTreeMap<String, u64>>,
    window: Mutex<Option<RunWindow>>,
}

impl MetricsCollector {
    /// One shard per CPU, up to 16.
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get().min(MAX_DEFAULT_SHARDS))
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::new())).collect(),
            next_shard: AtomicUsize::new(0),
            recorded: AtomicU64::new(0),
            startup_failures: Mutex::new(BTreeMap::new()),
            window: Mutex::new(None),
        }
    }

    /// Starts measuring elapsed time on `clock`.
    pub(crate) fn begin_run(&self, clock: Arc<dyn Clock>) {
        let started = clock.now();
        *self.window.lock() = Some(RunWindow {
            clock,
            started,
            finished: None,
        });
    }

    /// Freezes elapsed time at the current instant of the run's clock.
    pub(crate) fn finish_run(&self) {
        if let Some(window) = self.window.lock().as_mut() {
            window.finished.get_or_insert_with(|| window.clock.now());
        }
    }

    /// Time between the start of the run and its stop (or now while it is
    /// still running). Zero before any run started.
    pub fn elapsed(&self) -> Duration {
        self.window
            .lock()
            .as_ref()
            .map_or(Duration::ZERO, RunWindow::elapsed)
    }

    /// Records one outcome. Safe to call from any number of users at once.
    pub fn record(&self, outcome: &Outcome) {
        let index = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        {
            let mut shard = self.shards[index].lock();
            match shard.get_mut(&outcome.action) {
                Some(agg) => agg.consume(outcome),
                None => {
                    let mut agg = ActionAggregate::default();
                    agg.consume(outcome);
                    shard.insert(outcome.action.clone(), agg);
                }
            }
        }
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a user of `class` whose start hook failed.
    pub fn record_startup_failure(&self, class: &str) {
        *self
            .startup_failures
            .lock()
            .entry(class.to_owned())
            .or_default() += 1;
    }

    /// Outcomes recorded so far, without building a snapshot.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Immutable view of everything recorded so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut actions: BTreeMap<String, ActionAggregate> = BTreeMap::new();
        for shard in self.shards.iter() {
            let local = shard.lock().clone();
            for (name, agg) in local {
                match actions.get_mut(&name) {
                    Some(merged) => merged.merge(agg),
                    None => {
                        actions.insert(name, agg);
                    }
                }
            }
        }

        MetricsSnapshot {
            elapsed: self.elapsed(),
            actions,
            startup_failures: self.startup_failures.lock().clone(),
        }
    }

    /// All actions merged into one aggregate, without copying the shards.
    pub fn total(&self) -> ActionAggregate {
        let mut total = ActionAggregate::default();
        for shard in self.shards.iter() {
            shard.lock().values().for_each(|agg| total.absorb(agg));
        }
        total
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Duration of the run as measured on its clock.
    pub elapsed: Duration,
    pub actions: BTreeMap<String, ActionAggregate>,
    /// Users whose start hook failed, per user class.
    pub startup_failures: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn action(&self, name: &str) -> Option<&ActionAggregate> {
        self.actions.get(name)
    }

    /// Total number of recorded outcomes across all actions.
    pub fn count(&self) -> u64 {
        self.actions.values().map(|a| a.count).sum()
    }

    pub fn startup_failure_count(&self) -> u64 {
        self.startup_failures.values().sum()
    }

    /// All actions merged into one aggregate.
    pub fn total(&self) -> ActionAggregate {
        let mut total = ActionAggregate::default();
        self.actions.values().for_each(|agg| total.absorb(agg));
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_records_are_never_lost() {
        let collector = Arc::new(MetricsCollector::with_shards(4));
        let runners = 100;
        let per_runner = 1_000;

        let handles: Vec<_> = (0..runners)
            .map(|r| {
                let collector = Arc::clone(&collector);
                tokio::spawn(async move {
                    for i in 0..per_runner {
                        let action = if i % 2 == 0 { "list" } else { "detail" };
                        let outcome = if (r + i) % 10 == 0 {
                            Outcome::failure(action, Duration::from_micros(250), "boom")
                        } else {
                            Outcome::success(action, Duration::from_micros(250))
                        };
                        collector.record(&outcome);
                        if i % 100 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.count(), 100_000);
        assert_eq!(collector.recorded(), 100_000);
        assert_eq!(snapshot.action("list").unwrap().count, 50_000);
        assert_eq!(snapshot.action("detail").unwrap().count, 50_000);

        let total = snapshot.total();
        assert_eq!(total.count, 100_000);
        assert_eq!(total.failures(), 10_000);
        assert_eq!(total.errors["boom"], 10_000);
        assert_eq!(total.latency.len(), 100_000);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let collector = MetricsCollector::with_shards(2);
        collector.record(&Outcome::success("heartbeat", Duration::from_millis(3)));
        let before = collector.snapshot();

        collector.record(&Outcome::success("heartbeat", Duration::from_millis(3)));
        assert_eq!(before.count(), 1);
        assert_eq!(collector.snapshot().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_covers_the_run_window_only() {
        let collector = MetricsCollector::with_shards(1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(collector.elapsed(), Duration::ZERO);

        collector.begin_run(Arc::new(TokioClock));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(collector.snapshot().elapsed, Duration::from_secs(2));

        collector.finish_run();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(collector.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn total_matches_the_snapshot_total() {
        let collector = MetricsCollector::with_shards(3);
        for i in 0..30 {
            let action = ["list", "detail", "save"][i % 3];
            collector.record(&Outcome::success(action, Duration::from_millis(i as u64 + 1)));
        }
        collector.record(&Outcome::failure("save", Duration::from_millis(4), "timeout"));

        let live = collector.total();
        let copied = collector.snapshot().total();
        assert_eq!((live.count, live.failures()), (31, 1));
        assert_eq!(live.count, copied.count);
        assert_eq!(live.total_latency, copied.total_latency);
        assert_eq!(live.latency.len(), copied.latency.len());
        assert_eq!(live.errors, copied.errors);
    }

    #[test]
    fn default_shard_count_is_bounded() {
        let collector = MetricsCollector::new();
        assert!((1..=MAX_DEFAULT_SHARDS).contains(&collector.shards.len()));
    }

    #[test]
    fn startup_failures_are_tallied_per_class() {
        let collector = MetricsCollector::new();
        collector.record_startup_failure("fag");
        collector.record_startup_failure("fag");
        collector.record_startup_failure("fin");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.startup_failures["fag"], 2);
        assert_eq!(snapshot.startup_failure_count(), 3);
        assert_eq!(snapshot.count(), 0);
    }
}
