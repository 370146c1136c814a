use std::{collections::BTreeSet, fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::session::Session;

/// How a task execution ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The action ran; an outcome is recorded.
    Done,
    /// The action had nothing to do (for instance no cached IDs yet).
    /// Nothing is recorded, the user just moves on to its think time.
    Skipped,
}

/// What an action returns. Any error is recorded as a failed outcome.
pub type TaskResult = anyhow::Result<Completion>;

/// Type-erased task action.
///
/// Takes the user's session by `&mut` for the whole execution, which is what
/// keeps actions of one user strictly sequential.
pub type ActionFn =
    Arc<dyn for<'s> Fn(&'s mut Session) -> BoxFuture<'s, TaskResult> + Send + Sync>;

/// A named, weighted, tagged action. Immutable once built.
///
/// ```rust
/// use futures::FutureExt;
/// use throng::{Completion, Task};
///
/// let task = Task::new("heartbeat", 10, |session| {
///     async move {
///         session.set("beats", session.get_u64("beats").unwrap_or(0) + 1);
///         Ok(Completion::Done)
///     }
///     .boxed()
/// })
/// .with_tag("background");
/// assert_eq!(task.weight(), 10);
/// ```
#[derive(Clone)]
pub struct Task {
    name: String,
    label: Option<String>,
    weight: u32,
    tags: BTreeSet<String>,
    action: ActionFn,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, weight: u32, action: F) -> Self
    where
        F: for<'s> Fn(&'s mut Session) -> BoxFuture<'s, TaskResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            label: None,
            weight,
            tags: BTreeSet::new(),
            action: Arc::new(action),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Name the outcomes of this task are recorded under. Defaults to the
    /// task name; several tasks may share a label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Runs the action against `session`.
    pub fn execute<'s>(&self, session: &'s mut Session) -> BoxFuture<'s, TaskResult> {
        (self.action)(session)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("label", &self.label())
            .field("weight", &self.weight)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use rand::{rngs::StdRng, SeedableRng};

    #[tokio::test]
    async fn execute_mutates_the_given_session() {
        let task = Task::new("count", 1, |session| {
            async move {
                let n = session.get_u64("n").unwrap_or(0);
                session.set("n", n + 1);
                Ok(Completion::Done)
            }
            .boxed()
        });

        let mut session = Session::new(0, "test", StdRng::seed_from_u64(1));
        task.execute(&mut session).await.unwrap();
        task.execute(&mut session).await.unwrap();
        assert_eq!(session.get_u64("n"), Some(2));
    }

    #[test]
    fn label_defaults_to_name() {
        let task = Task::new("view_case_detail", 25, |_| async { Ok(Completion::Done) }.boxed());
        assert_eq!(task.label(), "view_case_detail");

        let task = task.with_label("/api/cases/[id]").with_tags(["read", "cases"]);
        assert_eq!(task.label(), "/api/cases/[id]");
        assert!(task.has_tag("read"));
        assert!(!task.has_tag("write"));
    }
}
