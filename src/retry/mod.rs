mod classify;
mod plan;

use serde::Serialize;
use serde_json::Value;

pub use self::classify::{FailureClassifier, FailureEvidence};
pub use self::plan::{RetryPlanner, RetryStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    Validation,
    Execution,
    Quality,
    Timeout,
    ApiError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SchemaError,
    GroundTruthMismatch,
    QualityOverChange,
    QualityUnderChange,
    Timeout,
    RateLimited,
    TransientNetworkError,
    ResourceExhausted,
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestedFix {
    pub parameter: String,
    pub current_value: Value,
    pub suggested_value: Value,
    pub reason: String,
}

impl SuggestedFix {
    pub fn is_effective(&self) -> bool {
        self.current_value != self.suggested_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAnalysis {
    pub mode: FailureMode,
    pub kind: FailureKind,
    pub root_cause: String,
    pub recoverable: bool,
    pub suggested_fixes: Vec<SuggestedFix>,
}

impl FailureAnalysis {
    pub fn fatal(mode: FailureMode, kind: FailureKind, root_cause: impl Into<String>) -> Self {
        Self {
            mode,
            kind,
            root_cause: root_cause.into(),
            recoverable: false,
            suggested_fixes: Vec::new(),
        }
    }

    pub fn recoverable(mode: FailureMode, kind: FailureKind, root_cause: impl Into<String>) -> Self {
        Self {
            mode,
            kind,
            root_cause: root_cause.into(),
            recoverable: true,
            suggested_fixes: Vec::new(),
        }
    }

    /// The caller's deadline or cancellation signal fired; nothing is left to retry into.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::fatal(FailureMode::Timeout, FailureKind::Timeout, reason)
    }

    fn with_fixes(mut self, fixes: Vec<SuggestedFix>) -> Self {
        self.suggested_fixes = fixes;
        self
    }
}
