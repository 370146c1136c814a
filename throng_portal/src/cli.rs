use std::{future, time::Duration};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};
use throng::{JsonReporter, Report, Reporter, Scheduler, TagFilter, TextReporter};

use crate::{
    api::PortalApi,
    seed::{seed, SeedConfig},
    workload::portal_workload,
};

/// Load generator for the budget portal.
#[derive(Debug, Parser)]
#[command(name = "throng-portal", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a population of portal users against a host.
    Run(RunArgs),
    /// Fill a portal with generated cases and document versions.
    Seed(SeedArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Base URL of the portal API.
    #[arg(long, env = "THRONG_HOST", default_value = "http://localhost:8080")]
    pub host: String,
    /// Number of concurrent users to reach.
    #[arg(short, long, env = "THRONG_USERS", default_value_t = 10)]
    pub users: usize,
    /// Users spawned (or retired) per second.
    #[arg(short = 'r', long, env = "THRONG_SPAWN_RATE", default_value_t = 1.0)]
    pub spawn_rate: f64,
    /// Stop after this long, e.g. `90s` or `5m`. Runs until Ctrl-C otherwise.
    #[arg(short = 't', long, env = "THRONG_RUN_TIME", value_parser = humantime::parse_duration)]
    pub run_time: Option<Duration>,
    /// Only run tasks carrying one of these tags.
    #[arg(long, env = "THRONG_TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,
    /// Never run tasks carrying one of these tags.
    #[arg(long, env = "THRONG_EXCLUDE_TAGS", value_delimiter = ',')]
    pub exclude_tags: Vec<String>,
    /// Seed for reproducible user behaviour.
    #[arg(long, env = "THRONG_SEED")]
    pub seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub report: ReportFormat,
    /// How often to log population and request statistics.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub stats_interval: Duration,
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,
}

impl RunArgs {
    pub fn tag_filter(&self) -> TagFilter {
        TagFilter::new()
            .include(self.tags.iter().filter(|t| !t.is_empty()))
            .exclude(self.exclude_tags.iter().filter(|t| !t.is_empty()))
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        if self.stats_interval.is_zero() {
            bail!("--stats-interval must be positive");
        }
        let api = PortalApi::new(&self.host, self.request_timeout)?;
        let workload = portal_workload(&api)?
            .filtered(&self.tag_filter())
            .context("no task left to run after tag filtering")?;

        let mut scheduler = match self.seed {
            Some(seed) => Scheduler::builder().workload(workload).seed(seed).build(),
            None => Scheduler::builder().workload(workload).build(),
        };
        scheduler.start(self.users, self.spawn_rate)?;

        let deadline = async {
            match self.run_time {
                Some(run_time) => tokio::time::sleep(run_time).await,
                None => future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let mut stats = tokio::time::interval(self.stats_interval);
        stats.tick().await;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::info!("Run time elapsed");
                    break;
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for Ctrl-C")?;
                    tracing::info!("Interrupted");
                    break;
                }
                _ = stats.tick() => log_stats(&scheduler),
            }
        }

        scheduler.stop().await?;
        let report = Report::from(scheduler.snapshot());
        match self.report {
            ReportFormat::Text => TextReporter.report(&report).await?,
            ReportFormat::Json => JsonReporter { pretty: true }.report(&report).await?,
        }
        Ok(())
    }
}

fn log_stats(scheduler: &Scheduler) {
    let population = scheduler.population();
    let total = scheduler.metrics().total();
    tracing::info!(
        target_users = population.target,
        running = population.running,
        starting = population.starting,
        startup_failures = population.startup_failures,
        requests = total.count,
        failures = total.failures(),
        p95_ms = total.percentile(0.95).as_millis() as u64,
        "Stats"
    );
}

#[derive(Debug, Args)]
pub struct SeedArgs {
    #[arg(long, env = "THRONG_HOST", default_value = "http://localhost:8080")]
    pub host: String,
    /// Number of cases to create.
    #[arg(long, default_value_t = 500)]
    pub cases: usize,
    #[arg(long, default_value_t = 10)]
    pub versions_min: u32,
    #[arg(long, default_value_t = 30)]
    pub versions_max: u32,
    #[arg(long, env = "THRONG_SEED")]
    pub seed: Option<u64>,
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,
}

impl SeedArgs {
    pub fn config(&self) -> anyhow::Result<SeedConfig> {
        if self.versions_min > self.versions_max {
            bail!(
                "--versions-min ({}) is above --versions-max ({})",
                self.versions_min,
                self.versions_max
            );
        }
        Ok(SeedConfig {
            cases: self.cases,
            versions: self.versions_min..=self.versions_max,
            ..SeedConfig::default()
        })
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        let config = self.config()?;
        let api = PortalApi::new(&self.host, self.request_timeout)?;
        let mut rng = self
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        seed(&api, &config, &mut rng).await?;
        Ok(())
    }
}
