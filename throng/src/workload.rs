use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use rand::Rng;

use crate::{
    clock::ThinkTime,
    error::{RegistryError, WorkloadError},
    registry::{pick_weighted, TagFilter, TaskRegistry},
    session::Session,
};

/// Hook run once per user, before any task, to set up the session
/// (log in, store the token, discover IDs). An error is a startup failure.
pub type OnStartFn =
    Arc<dyn for<'s> Fn(&'s mut Session) -> BoxFuture<'s, anyhow::Result<()>> + Send + Sync>;

/// One kind of simulated user: its tasks, its start hook and its pacing.
#[derive(Clone)]
pub struct UserClass {
    name: String,
    weight: u32,
    tasks: TaskRegistry,
    on_start: Option<OnStartFn>,
    think_time: ThinkTime,
}

impl UserClass {
    pub fn new(name: impl Into<String>, tasks: TaskRegistry) -> Self {
        Self {
            name: name.into(),
            weight: 1,
            tasks,
            on_start: None,
            think_time: ThinkTime::NONE,
        }
    }

    /// Relative share of spawned users that belong to this class.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_on_start<F>(mut self, hook: F) -> Self
    where
        F: for<'s> Fn(&'s mut Session) -> BoxFuture<'s, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn think_time(&self) -> ThinkTime {
        self.think_time
    }

    /// Runs the start hook, if any, against a fresh session.
    pub async fn start_session(&self, session: &mut Session) -> anyhow::Result<()> {
        match &self.on_start {
            Some(hook) => hook(session).await,
            None => Ok(()),
        }
    }

    fn validate(&self) -> Result<(), WorkloadError> {
        if self.weight == 0 {
            return Err(WorkloadError::InvalidClassWeight {
                name: self.name.clone(),
            });
        }
        if self.tasks.is_empty() {
            return Err(WorkloadError::Registry {
                class: self.name.clone(),
                source: RegistryError::EmptyRegistry,
            });
        }
        if !self.think_time.is_valid() {
            return Err(WorkloadError::InvalidThinkTime {
                name: self.name.clone(),
                min: self.think_time.min(),
                max: self.think_time.max(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for UserClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClass")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("tasks", &self.tasks)
            .field("on_start", &self.on_start.is_some())
            .field("think_time", &self.think_time)
            .finish()
    }
}

/// The full set of user classes a run draws from.
///
/// Every registered class is validated on the way in, so a non-empty
/// workload is always runnable.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    classes: Vec<Arc<UserClass>>,
    cumulative: Vec<u64>,
}

impl Workload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: UserClass) -> Result<&mut Self, WorkloadError> {
        class.validate()?;
        if self.classes.iter().any(|c| c.name() == class.name()) {
            return Err(WorkloadError::DuplicateClass(class.name().to_owned()));
        }
        let total = self.cumulative.last().copied().unwrap_or(0) + u64::from(class.weight());
        self.cumulative.push(total);
        self.classes.push(Arc::new(class));
        Ok(self)
    }

    pub fn with_class(mut self, class: UserClass) -> Result<Self, WorkloadError> {
        self.register(class)?;
        Ok(self)
    }

    pub fn classes(&self) -> impl Iterator<Item = &UserClass> {
        self.classes.iter().map(AsRef::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Restricts every class to the tasks `filter` accepts. Classes left
    /// without tasks are dropped; a workload left without classes is an
    /// error.
    pub fn filtered(&self, filter: &TagFilter) -> Result<Workload, WorkloadError> {
        let mut workload = Workload::new();
        for class in &self.classes {
            match class.tasks.filtered(filter) {
                Ok(tasks) => {
                    workload.register(UserClass {
                        tasks,
                        ..UserClass::clone(class)
                    })?;
                }
                Err(RegistryError::EmptyRegistry) => {
                    tracing::info!(
                        class = class.name(),
                        "No task left after tag filtering, dropping class"
                    );
                }
                Err(source) => {
                    return Err(WorkloadError::Registry {
                        class: class.name.clone(),
                        source,
                    })
                }
            }
        }
        if workload.is_empty() {
            return Err(WorkloadError::NoUserClasses);
        }
        Ok(workload)
    }

    /// Picks the class of the next spawned user, proportionally to weight.
    pub(crate) fn pick_class<R: Rng>(&self, rng: &mut R) -> Option<&Arc<UserClass>> {
        pick_weighted(&self.cumulative, rng).map(|i| &self.classes[i])
    }
}
