use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of one task execution, as recorded by the metrics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Logical action name (the task's label).
    pub action: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(action: impl Into<String>, duration: Duration) -> Self {
        Self {
            action: action.into(),
            duration,
            success: true,
            error: None,
        }
    }

    pub fn failure(
        action: impl Into<String>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            duration,
            success: false,
            error: Some(error.into()),
        }
    }
}
