use std::time::Duration;

use thiserror::Error;

/// Misconfiguration of a [`crate::TaskRegistry`]. Fatal when setting up a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task `{0}` is already registered")]
    DuplicateTask(String),
    #[error("task `{name}` has weight 0, weights must be positive")]
    InvalidWeight { name: String },
    #[error("no task available to select")]
    EmptyRegistry,
}

/// Misconfiguration of a [`crate::Workload`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("workload has no user classes")]
    NoUserClasses,
    #[error("user class `{0}` is already registered")]
    DuplicateClass(String),
    #[error("user class `{name}` has weight 0, weights must be positive")]
    InvalidClassWeight { name: String },
    #[error("user class `{name}` has think time min {min:?} above max {max:?}")]
    InvalidThinkTime {
        name: String,
        min: Duration,
        max: Duration,
    },
    #[error("user class `{class}`: {source}")]
    Registry {
        class: String,
        #[source]
        source: RegistryError,
    },
}

/// Rejected population control operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("population is already started")]
    AlreadyStarted,
    #[error("population has not been started")]
    NotStarted,
    #[error("population has been stopped")]
    Stopped,
    #[error("spawn rate must be a positive finite number of users per second, got {0}")]
    InvalidSpawnRate(f64),
    #[error("no tokio runtime available to drive the population")]
    NoRuntime,
    #[error(transparent)]
    Workload(#[from] WorkloadError),
}
