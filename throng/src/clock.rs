use std::time::{Duration, Instant};

use futures::{future::BoxFuture, FutureExt};
use rand::Rng;

/// Time source used by virtual users for latency measurement and think time.
///
/// Injected per run so tests can observe or short-circuit waits.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Suspends the calling user only. Must never block the thread.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Default clock backed by `tokio::time`, so paused test time applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Randomized pause between two tasks of the same user, drawn uniformly from
/// `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    /// No pause at all between tasks.
    pub const NONE: ThinkTime = ThinkTime {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn between(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn constant(duration: Duration) -> Self {
        Self::between(duration, duration)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::NONE
    }
}
