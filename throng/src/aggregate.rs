use std::{collections::HashMap, time::Duration};

use hdrhistogram::Histogram;

use crate::outcome::Outcome;

/// Collects [`Outcome`]s into a compact, mergeable representation.
///
/// Aggregates keep raw material (counts, histograms, tallies), not final
/// statistics; a [`crate::Report`] derives averages and percentiles later.
///
/// `merge` must be associative and commutative: shard-local aggregates are
/// combined in arbitrary order.
pub trait Aggregate: Default + Clone + Send {
    /// Incorporate a single outcome.
    fn consume(&mut self, outcome: &Outcome);

    /// Incorporate several outcomes.
    fn aggregate(&mut self, outcomes: &[Outcome]) {
        outcomes.iter().for_each(|o| self.consume(o));
    }

    /// Combine another aggregate into this one.
    fn merge(&mut self, other: Self);
}

/// Longest latency recorded, in microseconds (one hour). Longer samples are
/// clamped. Histograms start small and only grow to the largest value seen.
const LATENCY_CEILING_US: u64 = 3_600_000_000;

/// Distinct error messages kept per action; the rest are folded together.
const MAX_DISTINCT_ERRORS: usize = 100;
const OTHER_ERRORS: &str = "<other errors>";

/// Per-action aggregate: counters, a latency histogram in microseconds and
/// an error tally keyed by error text.
#[derive(Debug, Clone)]
pub struct ActionAggregate {
    pub count: u64,
    pub successes: u64,
    pub total_latency: Duration,
    pub latency: Histogram<u64>,
    pub errors: HashMap<String, u64>,
}

impl Default for ActionAggregate {
    fn default() -> Self {
        Self {
            count: 0,
            successes: 0,
            total_latency: Duration::ZERO,
            latency: Histogram::new(3).expect("3 significant figures are supported"),
            errors: HashMap::new(),
        }
    }
}

impl ActionAggregate {
    pub fn failures(&self) -> u64 {
        self.count - self.successes
    }

    /// Fraction of successful outcomes in `[0, 1]`, `0` when empty.
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.successes as f64 / self.count as f64
    }

    pub fn mean_latency(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_latency.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Latency at `quantile` in `[0, 1]`.
    pub fn percentile(&self, quantile: f64) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency.value_at_quantile(quantile))
    }

    pub fn min_latency(&self) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency.min())
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.latency.max())
    }

    /// [`Aggregate::merge`] without taking ownership of `other`.
    pub fn absorb(&mut self, other: &Self) {
        self.count += other.count;
        self.successes += other.successes;
        self.total_latency += other.total_latency;
        if let Err(e) = self.latency.add(&other.latency) {
            tracing::warn!("Failed to merge latency histograms: {e}");
        }
        for (error, n) in &other.errors {
            self.tally_error(error, *n);
        }
    }

    fn tally_error(&mut self, error: &str, n: u64) {
        if let Some(count) = self.errors.get_mut(error) {
            *count += n;
        } else if self.errors.len() < MAX_DISTINCT_ERRORS {
            self.errors.insert(error.to_owned(), n);
        } else {
            *self.errors.entry(OTHER_ERRORS.to_owned()).or_default() += n;
        }
    }
}

impl Aggregate for ActionAggregate {
    fn consume(&mut self, outcome: &Outcome) {
        self.count += 1;
        if outcome.success {
            self.successes += 1;
        }
        self.total_latency += outcome.duration;
        let micros = u64::try_from(outcome.duration.as_micros())
            .unwrap_or(u64::MAX)
            .clamp(1, LATENCY_CEILING_US);
        if let Err(e) = self.latency.record(micros) {
            tracing::warn!("Failed to record latency of {micros}us: {e}");
        }
        if let Some(error) = &outcome.error {
            self.tally_error(error, 1);
        }
    }

    fn merge(&mut self, other: Self) {
        self.absorb(&other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn consume_counts_successes_and_errors() {
        let mut agg = ActionAggregate::default();
        agg.aggregate(&[
            Outcome::success("list", ms(10)),
            Outcome::success("list", ms(30)),
            Outcome::failure("list", ms(20), "GET /api/cases/list returned 500"),
            Outcome::failure("list", ms(20), "GET /api/cases/list returned 500"),
        ]);

        assert_eq!(agg.count, 4);
        assert_eq!(agg.successes, 2);
        assert_eq!(agg.failures(), 2);
        assert_eq!(agg.success_rate(), 0.5);
        assert_eq!(agg.mean_latency(), ms(20));
        assert_eq!(agg.errors["GET /api/cases/list returned 500"], 2);
    }

    #[test]
    fn percentiles_come_from_the_histogram() {
        let mut agg = ActionAggregate::default();
        for i in 1..=100 {
            agg.consume(&Outcome::success("detail", ms(i)));
        }
        let p50 = agg.percentile(0.5).as_secs_f64();
        let p99 = agg.percentile(0.99).as_secs_f64();
        assert!((p50 - 0.050).abs() < 0.001, "{p50}");
        assert!((p99 - 0.099).abs() < 0.001, "{p99}");
        assert!(agg.min_latency() <= ms(1));
        assert!(agg.max_latency() >= ms(100) - Duration::from_micros(100));
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = ActionAggregate::default();
        let mut b = ActionAggregate::default();
        a.consume(&Outcome::success("save", ms(5)));
        b.consume(&Outcome::failure("save", ms(7), "timeout"));
        b.consume(&Outcome::success("save", ms(9)));

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab.count, ba.count);
        assert_eq!(ab.successes, ba.successes);
        assert_eq!(ab.total_latency, ba.total_latency);
        assert_eq!(ab.latency.len(), 3);
        assert_eq!(ab.errors, ba.errors);
    }

    #[test]
    fn distinct_errors_are_capped() {
        let mut agg = ActionAggregate::default();
        for i in 0..(MAX_DISTINCT_ERRORS + 20) {
            agg.consume(&Outcome::failure("export", ms(1), format!("error {i}")));
        }
        assert_eq!(agg.errors.len(), MAX_DISTINCT_ERRORS + 1);
        assert_eq!(agg.errors[OTHER_ERRORS], 20);
    }

    #[test]
    fn histograms_grow_with_the_largest_latency_seen() {
        let fresh = ActionAggregate::default();
        let small = fresh.latency.distinct_values();
        assert!(small <= 4_096, "{small}");

        let mut agg = fresh;
        agg.consume(&Outcome::success("export", ms(5)));
        agg.consume(&Outcome::success("export", ms(2_000)));
        assert!(agg.latency.distinct_values() < 16_384);
        let max = agg.max_latency().as_secs_f64();
        assert!((max - 2.0).abs() < 0.005, "{max}");

        let mut merged = ActionAggregate::default();
        merged.absorb(&agg);
        assert_eq!(merged.latency.len(), 2);
        assert!(merged.max_latency() >= ms(2_000));
    }

    #[test]
    fn latencies_beyond_an_hour_are_clamped() {
        let mut agg = ActionAggregate::default();
        agg.consume(&Outcome::success("import", Duration::from_secs(7_200)));
        let max = agg.max_latency();
        assert!(
            max >= Duration::from_secs(3_600) && max < Duration::from_secs(3_605),
            "{max:?}"
        );
        assert_eq!(agg.mean_latency(), Duration::from_secs(7_200));
    }

    #[test]
    fn empty_aggregate_is_all_zero() {
        let agg = ActionAggregate::default();
        assert_eq!(agg.success_rate(), 0.0);
        assert_eq!(agg.mean_latency(), Duration::ZERO);
        assert_eq!(agg.percentile(0.95), Duration::ZERO);
        assert_eq!(agg.min_latency(), Duration::ZERO);
    }
}
