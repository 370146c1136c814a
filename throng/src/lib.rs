//! Throng: concurrent virtual-user load generation.
//!
//! A run simulates a population of users, each a tokio task with its own
//! [`Session`], repeatedly picking a weighted [`Task`] from its
//! [`UserClass`], executing it, recording the [`Outcome`] and waiting a
//! random think time. The [`Scheduler`] grows the population to a target at a
//! bounded spawn rate, keeps it there and stops it cooperatively.
//!
//! # Architecture
//!
//! - [`Task`] / [`TaskRegistry`]: named, weighted, tagged actions and the
//!   O(log n) weighted selection over them.
//! - [`UserClass`] / [`Workload`]: behaviour profiles (tasks, start hook,
//!   think time) and the weighted mix of profiles a population is drawn from.
//! - [`Session`]: state owned by exactly one user, mutated only by that
//!   user's actions.
//! - [`Scheduler`]: population control, lifecycle and shutdown.
//! - [`MetricsCollector`]: sharded, lossless outcome collection.
//! - [`Aggregate`]: mergeable per-action aggregates (counts, latency
//!   histograms, error tallies).
//! - [`Report`] / [`Reporter`]: statistics derived from a snapshot and the
//!   sinks that print them.
//!
//! # Feature flags
//! - `internals`: exposes the pure arithmetic of the control loop (spawn
//!   budget, per-user seeding). Unstable.

pub mod aggregate;
pub mod clock;
pub mod collector;
pub mod error;
pub mod outcome;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod workload;

pub use aggregate::{ActionAggregate, Aggregate};
pub use clock::{Clock, ThinkTime, TokioClock};
pub use collector::{MetricsCollector, MetricsSnapshot};
pub use error::{RegistryError, SchedulerError, WorkloadError};
pub use outcome::Outcome;
pub use registry::{TagFilter, TaskRegistry};
pub use report::{JsonReporter, Report, ReportError, Reporter, TextReporter};
pub use runner::{PopulationStats, UserState};
pub use scheduler::Scheduler;
pub use session::Session;
pub use task::{Completion, Task, TaskResult};
pub use workload::{UserClass, Workload};
