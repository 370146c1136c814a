use std::collections::BTreeSet;

use rand::Rng;

use crate::{error::RegistryError, task::Task};

/// Ordered set of tasks plus a cumulative-weight index.
///
/// `cumulative[i]` is the sum of the weights of tasks `0..=i`, so a uniform
/// point in `0..total` lands on task `i` with probability `weight_i / total`,
/// found by binary search.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    cumulative: Vec<u64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. On error the registry is left untouched.
    pub fn register(&mut self, task: Task) -> Result<&mut Self, RegistryError> {
        if task.weight() == 0 {
            return Err(RegistryError::InvalidWeight {
                name: task.name().to_owned(),
            });
        }
        if self.get(task.name()).is_some() {
            return Err(RegistryError::DuplicateTask(task.name().to_owned()));
        }
        let total = self.total_weight() + u64::from(task.weight());
        self.cumulative.push(total);
        self.tasks.push(task);
        Ok(self)
    }

    /// By-value variant of [`register`](Self::register) for chaining.
    pub fn with_task(mut self, task: Task) -> Result<Self, RegistryError> {
        self.register(task)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    /// Picks a task with probability proportional to its weight. O(log n).
    pub fn select<R: Rng>(&self, rng: &mut R) -> Result<&Task, RegistryError> {
        let index = pick_weighted(&self.cumulative, rng).ok_or(RegistryError::EmptyRegistry)?;
        Ok(&self.tasks[index])
    }

    /// Like [`select`](Self::select), restricted to the tasks `filter`
    /// accepts. O(n); prefer [`filtered`](Self::filtered) when the filter is
    /// fixed for the whole run.
    pub fn select_tagged<R: Rng>(
        &self,
        filter: &TagFilter,
        rng: &mut R,
    ) -> Result<&Task, RegistryError> {
        let total: u64 = self
            .tasks
            .iter()
            .filter(|t| filter.accepts(t))
            .map(|t| u64::from(t.weight()))
            .sum();
        if total == 0 {
            return Err(RegistryError::EmptyRegistry);
        }

        let mut point = rng.gen_range(0..total);
        for task in self.tasks.iter().filter(|t| filter.accepts(t)) {
            let weight = u64::from(task.weight());
            if point < weight {
                return Ok(task);
            }
            point -= weight;
        }
        Err(RegistryError::EmptyRegistry)
    }

    /// Builds a registry holding only the tasks `filter` accepts.
    pub fn filtered(&self, filter: &TagFilter) -> Result<TaskRegistry, RegistryError> {
        let mut registry = TaskRegistry::new();
        for task in self.tasks.iter().filter(|t| filter.accepts(t)) {
            registry.register(task.clone())?;
        }
        if registry.is_empty() {
            return Err(RegistryError::EmptyRegistry);
        }
        Ok(registry)
    }
}

/// Returns the index whose cumulative bucket contains a uniform random point,
/// or `None` when there is nothing to pick from.
pub(crate) fn pick_weighted<R: Rng>(cumulative: &[u64], rng: &mut R) -> Option<usize> {
    let total = *cumulative.last()?;
    if total == 0 {
        return None;
    }
    let point = rng.gen_range(0..total);
    Some(cumulative.partition_point(|&edge| edge <= point))
}

/// Tag-based task filtering.
///
/// A task passes when it carries at least one included tag (or nothing is
/// included) and none of the excluded tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn accepts(&self, task: &Task) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|t| task.has_tag(t));
        included && !self.exclude.iter().any(|t| task.has_tag(t))
    }
}
