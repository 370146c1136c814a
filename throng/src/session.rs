use std::collections::HashMap;

use rand::{rngs::StdRng, seq::SliceRandom};
use serde_json::Value;

/// Mutable state owned by exactly one virtual user.
///
/// A session is created fresh when a user starts, handed to the class's
/// `on_start` hook and then passed by `&mut` to every task the user runs, so
/// whatever one task stores here is visible to the next one. Sessions are
/// never shared between users and die with their user.
#[derive(Debug)]
pub struct Session {
    user: usize,
    class: String,
    identity: Option<String>,
    cached_ids: Vec<String>,
    fields: HashMap<String, Value>,
    rng: StdRng,
}

impl Session {
    pub fn new(user: usize, class: impl Into<String>, rng: StdRng) -> Self {
        Self {
            user,
            class: class.into(),
            identity: None,
            cached_ids: Vec::new(),
            fields: HashMap::new(),
            rng,
        }
    }

    /// Index of the owning user within the population.
    pub fn user(&self) -> usize {
        self.user
    }

    /// Name of the user class this session belongs to.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Opaque credential, typically a bearer token obtained at start.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
    }

    pub fn clear_identity(&mut self) {
        self.identity = None;
    }

    pub fn cached_ids(&self) -> &[String] {
        &self.cached_ids
    }

    /// Replaces the cached entity identifiers, keeping their order.
    pub fn set_cached_ids<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cached_ids = ids.into_iter().map(Into::into).collect();
    }

    pub fn push_cached_id(&mut self, id: impl Into<String>) {
        self.cached_ids.push(id.into());
    }

    /// Picks one cached identifier using the session's random source.
    pub fn random_cached_id(&mut self) -> Option<String> {
        self.cached_ids.choose(&mut self.rng).cloned()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    /// Stores a workload-specific field, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Random source for workload decisions (which department, which case).
    ///
    /// Seeded from the run seed when one is configured.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
