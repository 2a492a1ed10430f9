use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{FailureAnalysis, FailureKind};
use crate::execution::serialize_duration_ms;
use crate::settings::RetrySettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStrategy {
    pub should_retry: bool,
    #[serde(rename = "retry_delay_ms", serialize_with = "serialize_duration_ms")]
    pub retry_delay: Duration,
    pub adjusted_parameters: Map<String, Value>,
    pub reasoning: String,
}

impl RetryStrategy {
    fn stop(parameters: &Map<String, Value>, reasoning: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            retry_delay: Duration::ZERO,
            adjusted_parameters: parameters.clone(),
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPlanner {
    settings: RetrySettings,
}

impl RetryPlanner {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn plan(
        &self,
        failure: &FailureAnalysis,
        parameters: &Map<String, Value>,
        attempt: u32,
        max_retries: u32,
    ) -> RetryStrategy {
        if !failure.recoverable {
            return RetryStrategy::stop(
                parameters,
                format!("not retrying: {}", failure.root_cause),
            );
        }
        if attempt > max_retries {
            return RetryStrategy::stop(
                parameters,
                format!("retry budget of {max_retries} exhausted after {attempt} attempt(s)"),
            );
        }

        let delay = self.delay_for(failure.kind, attempt);
        if failure.suggested_fixes.is_empty() {
            return RetryStrategy {
                should_retry: true,
                retry_delay: delay,
                adjusted_parameters: parameters.clone(),
                reasoning: format!(
                    "retrying unchanged parameters after {}ms: {}",
                    delay.as_millis(),
                    failure.root_cause
                ),
            };
        }

        // One parameter per retry so each attempt isolates a single variable.
        let Some(fix) = failure
            .suggested_fixes
            .iter()
            .find(|fix| fix.is_effective())
        else {
            return RetryStrategy::stop(
                parameters,
                "no suggested fix would change the parameters",
            );
        };
        let mut adjusted = parameters.clone();
        adjusted.insert(fix.parameter.clone(), fix.suggested_value.clone());
        debug!(
            parameter = %fix.parameter,
            from = %fix.current_value,
            to = %fix.suggested_value,
            attempt,
            "retry adjusts one parameter"
        );
        RetryStrategy {
            should_retry: true,
            retry_delay: delay,
            adjusted_parameters: adjusted,
            reasoning: format!(
                "{} ({} {} -> {})",
                fix.reason, fix.parameter, fix.current_value, fix.suggested_value
            ),
        }
    }

    fn delay_for(&self, kind: FailureKind, attempt: u32) -> Duration {
        match kind {
            FailureKind::RateLimited => Duration::from_millis(self.settings.rate_limit_delay_ms),
            FailureKind::TransientNetworkError | FailureKind::Timeout | FailureKind::Unclassified => {
                let exponent = attempt.saturating_sub(1).min(20);
                let millis = self
                    .settings
                    .backoff_base_ms
                    .saturating_mul(1u64 << exponent)
                    .min(self.settings.backoff_max_ms);
                Duration::from_millis(millis)
            }
            _ => Duration::ZERO,
        }
    }
}
