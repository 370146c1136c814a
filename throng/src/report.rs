use std::{collections::BTreeMap, fmt::Write as _, future::Future};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::{aggregate::ActionAggregate, collector::MetricsSnapshot};

/// Processed form of a [`MetricsSnapshot`]: the statistics a human or a
/// dashboard wants, with no I/O attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub elapsed_secs: f64,
    pub actions: Vec<ActionReport>,
    pub total: ActionReport,
    pub startup_failures: BTreeMap<String, u64>,
}

/// Statistics for one action name. Latencies are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub name: String,
    pub count: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub throughput: f64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub errors: BTreeMap<String, u64>,
}

impl ActionReport {
    fn new(name: impl Into<String>, agg: &ActionAggregate, elapsed_secs: f64) -> Self {
        let ms = |d: std::time::Duration| d.as_nanos() as f64 / 1e6;
        Self {
            name: name.into(),
            count: agg.count,
            failures: agg.failures(),
            success_rate: agg.success_rate(),
            throughput: if elapsed_secs > 0.0 {
                agg.count as f64 / elapsed_secs
            } else {
                0.0
            },
            min_ms: ms(agg.min_latency()),
            mean_ms: ms(agg.mean_latency()),
            p50_ms: ms(agg.percentile(0.50)),
            p90_ms: ms(agg.percentile(0.90)),
            p95_ms: ms(agg.percentile(0.95)),
            p99_ms: ms(agg.percentile(0.99)),
            max_ms: if agg.count == 0 { 0.0 } else { ms(agg.max_latency()) },
            errors: agg.errors.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

impl From<&MetricsSnapshot> for Report {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        let elapsed_secs = snapshot.elapsed.as_secs_f64();
        Self {
            elapsed_secs,
            actions: snapshot
                .actions
                .iter()
                .map(|(name, agg)| ActionReport::new(name, agg, elapsed_secs))
                .collect(),
            total: ActionReport::new("Aggregated", &snapshot.total(), elapsed_secs),
            startup_failures: snapshot.startup_failures.clone(),
        }
    }
}

impl From<MetricsSnapshot> for Report {
    fn from(snapshot: MetricsSnapshot) -> Self {
        Report::from(&snapshot)
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends a [`Report`] somewhere: the I/O boundary of reporting.
pub trait Reporter {
    /// Formats the report. Pure, so it can be tested without a sink.
    fn render(&self, report: &Report) -> Result<String, ReportError>;

    /// Writes the rendered report to stdout.
    fn report(&self, report: &Report) -> impl Future<Output = Result<(), ReportError>> + Send
    where
        Self: Sync,
    {
        async move {
            let rendered = self.render(report)?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(rendered.as_bytes()).await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}

/// Fixed-width table, one row per action plus an aggregated row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextReporter;

impl Reporter for TextReporter {
    fn render(&self, report: &Report) -> Result<String, ReportError> {
        let mut out = String::new();
        let name_width = report
            .actions
            .iter()
            .map(|a| a.name.len())
            .chain([report.total.name.len(), 4])
            .max()
            .unwrap_or(4);

        // writing into a String cannot fail
        let _ = writeln!(
            out,
            "{:<name_width$} {:>9} {:>7} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "Name", "# reqs", "# fails", "req/s", "avg ms", "p50 ms", "p95 ms", "p99 ms", "max ms",
        );
        let _ = writeln!(out, "{}", "-".repeat(name_width + 81));
        for row in report.actions.iter().chain([&report.total]) {
            let _ = writeln!(
                out,
                "{:<name_width$} {:>9} {:>7} {:>8.2} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
                row.name,
                row.count,
                row.failures,
                row.throughput,
                row.mean_ms,
                row.p50_ms,
                row.p95_ms,
                row.p99_ms,
                row.max_ms,
            );
        }

        let errors: Vec<_> = report
            .actions
            .iter()
            .flat_map(|a| a.errors.iter().map(move |(e, n)| (&a.name, e, n)))
            .collect();
        if !errors.is_empty() {
            let _ = writeln!(out, "\nErrors");
            for (action, error, n) in errors {
                let _ = writeln!(out, "{n:>9}  {action}: {error}");
            }
        }

        if !report.startup_failures.is_empty() {
            let _ = writeln!(out, "\nStartup failures");
            for (class, n) in &report.startup_failures {
                let _ = writeln!(out, "{n:>9}  {class}");
            }
        }
        Ok(out)
    }
}

/// Serializes the report as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter {
    pub pretty: bool,
}

impl Reporter for JsonReporter {
    fn render(&self, report: &Report) -> Result<String, ReportError> {
        let mut json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        json.push('\n');
        Ok(json)
    }
}
