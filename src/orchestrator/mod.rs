pub mod control;
pub mod state;
pub mod turn;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{GroundTruthAnalyzer, ImageAnalysis};
use crate::confidence::aggregate_weighted;
use crate::execution::{serialize_duration_ms, SharedToolRegistry, ToolExecutionAdapter};
use crate::learning::{open_learning_store, ResultMetrics, SharedLearningStore, ToolExecutionRecord};
use crate::result_check::{ResultValidation, ResultValidator};
use crate::retry::{FailureAnalysis, FailureClassifier, FailureEvidence, FailureKind, FailureMode, RetryPlanner};
use crate::settings::{ConfidenceWeights, GuardSettings, MIN_PERSIST_CONFIDENCE};
use crate::tools::{ToolCall, ToolCallProposal, ToolIntent, ToolName};
use crate::validation::{ParameterValidator, ValidationResult};

pub use self::control::{Interrupted, RunControl};
pub use self::state::LoopState;
pub use self::turn::{ProposalSource, ProposalSourceError, TurnReport, TurnRunner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub request_id: String,
    pub user_message: String,
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
}

impl ConversationContext {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            user_message: user_message.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub parameters: Map<String, Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallReport {
    pub tool: ToolName,
    pub success: bool,
    #[serde(skip)]
    pub final_result: Option<Arc<[u8]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_error: Option<FailureAnalysis>,
    pub final_parameters: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_quality: Option<ResultValidation>,
    pub attempts: Vec<RetryAttempt>,
    pub confidence: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub reports: Vec<ToolCallReport>,
    pub all_succeeded: bool,
    pub confidence: u8,
}

impl BatchReport {
    fn from_reports(reports: Vec<ToolCallReport>) -> Self {
        let all_succeeded = reports.iter().all(|report| report.success);
        let confidence = if reports.is_empty() {
            0
        } else {
            let sum = reports
                .iter()
                .map(|report| f64::from(report.confidence))
                .sum::<f64>();
            (sum / reports.len() as f64).round().clamp(0.0, 100.0) as u8
        };
        Self {
            reports,
            all_succeeded,
            confidence,
        }
    }
}

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error("background task failed: {0}")]
    Join(#[from] JoinError),
}

impl StepError {
    fn into_failure(self) -> FailureAnalysis {
        match self {
            Self::Interrupted(reason) => FailureAnalysis::cancelled(reason.to_string()),
            Self::Join(error) => FailureAnalysis::fatal(
                FailureMode::Execution,
                FailureKind::Unclassified,
                format!("background task failed: {error}"),
            ),
        }
    }
}

async fn run_blocking<T, F>(control: &RunControl, work: F) -> Result<T, StepError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(control.guard(tokio::task::spawn_blocking(work)).await??)
}

struct RunnerInner {
    analyzer: GroundTruthAnalyzer,
    validator: ParameterValidator,
    adapter: ToolExecutionAdapter,
    results: ResultValidator,
    classifier: FailureClassifier,
    planner: RetryPlanner,
    store: SharedLearningStore,
    confidence: ConfidenceWeights,
    persist_threshold: u8,
    default_max_retries: u32,
    learning_writes: TaskTracker,
}

/// Runs proposed tool calls through validate, execute, check and retry.
/// Cheap to clone; clones share the learning store and pending writes.
#[derive(Clone)]
pub struct ToolCallRunner {
    inner: Arc<RunnerInner>,
}

impl ToolCallRunner {
    pub fn new(
        settings: &GuardSettings,
        registry: SharedToolRegistry,
        store: SharedLearningStore,
    ) -> Self {
        let timeout = Duration::from_millis(settings.retry.execution_timeout_ms);
        Self {
            inner: Arc::new(RunnerInner {
                analyzer: GroundTruthAnalyzer::new(settings.analysis.clone()),
                validator: ParameterValidator::new(settings.validation.clone()),
                adapter: ToolExecutionAdapter::new(registry, timeout),
                results: ResultValidator::new(settings.quality.clone()),
                classifier: FailureClassifier::new(settings.retry.clone()),
                planner: RetryPlanner::new(settings.retry.clone()),
                store,
                confidence: settings.confidence.clone(),
                persist_threshold: settings.learning.persist_threshold.max(MIN_PERSIST_CONFIDENCE),
                default_max_retries: settings.retry.max_retries,
                learning_writes: TaskTracker::new(),
            }),
        }
    }

    /// Builds the runner with the learning backend the settings select.
    pub fn from_settings(settings: &GuardSettings, registry: SharedToolRegistry) -> Self {
        let store = open_learning_store(&settings.learning, &settings.similarity);
        Self::new(settings, registry, store)
    }

    pub fn store(&self) -> &SharedLearningStore {
        &self.inner.store
    }

    pub fn default_max_retries(&self) -> u32 {
        self.inner.default_max_retries
    }

    /// Waits until every learning write spawned so far has finished.
    pub async fn wait_for_learning_writes(&self) {
        let tracker = &self.inner.learning_writes;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    pub async fn analyze(
        &self,
        image: Arc<[u8]>,
        control: &RunControl,
    ) -> Result<Arc<ImageAnalysis>, Interrupted> {
        let inner = self.inner.clone();
        let file_size = image.len() as u64;
        match run_blocking(control, move || inner.analyzer.analyze(&image)).await {
            Ok(analysis) => Ok(Arc::new(analysis)),
            Err(StepError::Interrupted(reason)) => Err(reason),
            Err(StepError::Join(error)) => {
                warn!(error = %error, "image analysis task failed, continuing without ground truth");
                Ok(Arc::new(ImageAnalysis::unavailable(file_size)))
            }
        }
    }

    /// Analyzes the image, then runs one proposal through the bounded retry loop.
    pub async fn run_tool_call(
        &self,
        proposal: ToolCallProposal,
        image: Arc<[u8]>,
        context: &ConversationContext,
        max_retries: u32,
        control: &RunControl,
    ) -> ToolCallReport {
        match self.analyze(image.clone(), control).await {
            Ok(analysis) => {
                self.run_with_analysis(proposal, image, analysis, context, max_retries, control)
                    .await
            }
            Err(reason) => interrupted_before_start(proposal, reason),
        }
    }

    pub async fn run_with_analysis(
        &self,
        proposal: ToolCallProposal,
        image: Arc<[u8]>,
        analysis: Arc<ImageAnalysis>,
        context: &ConversationContext,
        max_retries: u32,
        control: &RunControl,
    ) -> ToolCallReport {
        let tool = proposal.tool;
        let run_started = Instant::now();
        let mut trace = LoopTrace::new(tool, &context.request_id);
        let mut parameters = proposal.parameters;
        let mut last_validation: Option<(u8, Option<u8>)> = None;

        loop {
            let attempt_number = trace.attempts.len() as u32 + 1;
            let attempt_started = Instant::now();

            let validation = match self.validate(tool, &parameters, &analysis, control).await {
                Ok(validation) => validation,
                Err(error) => {
                    let pending = trace.failed_attempt(attempt_number, &parameters, &error, attempt_started);
                    return self.abort(trace, Some(pending), parameters, error.into_failure(), last_validation);
                }
            };
            last_validation = Some((validation.confidence, validation.historical_confidence));

            let mut execution_error = None;
            let mut quality = None;
            let mut forced_failure = None;
            if validation.is_valid {
                match ToolCall::from_parameters(tool, &parameters) {
                    Ok(call) => {
                        trace.advance(LoopState::Executing);
                        let intent = call.intent();
                        let outcome = match control
                            .guard(self.inner.adapter.execute(call, image.clone()))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(reason) => {
                                let error = StepError::from(reason);
                                let pending = trace.failed_attempt(attempt_number, &parameters, &error, attempt_started);
                                return self.abort(trace, Some(pending), parameters, error.into_failure(), last_validation);
                            }
                        };
                        match outcome.result_image {
                            Some(result_image) if outcome.success => {
                                trace.advance(LoopState::CheckingResult);
                                let checked = match self
                                    .check_result(image.clone(), result_image.clone(), tool, intent, control)
                                    .await
                                {
                                    Ok(checked) => checked,
                                    Err(error) => {
                                        let pending = trace.failed_attempt(attempt_number, &parameters, &error, attempt_started);
                                        return self.abort(trace, Some(pending), parameters, error.into_failure(), last_validation);
                                    }
                                };
                                if checked.is_valid {
                                    trace.attempts.push(RetryAttempt {
                                        attempt_number,
                                        parameters: parameters.clone(),
                                        success: true,
                                        quality_score: Some(checked.quality_score),
                                        error: None,
                                        duration: attempt_started.elapsed(),
                                    });
                                    return self.succeed(
                                        trace,
                                        parameters,
                                        result_image,
                                        &validation,
                                        checked,
                                        &analysis,
                                        run_started.elapsed(),
                                    );
                                }
                                quality = Some(checked);
                            }
                            _ => {
                                execution_error = Some(
                                    outcome
                                        .error
                                        .unwrap_or_else(|| format!("{tool} returned no result image")),
                                );
                            }
                        }
                    }
                    Err(error) => {
                        forced_failure = Some(FailureAnalysis::fatal(
                            FailureMode::Validation,
                            FailureKind::SchemaError,
                            error.to_string(),
                        ));
                    }
                }
            }

            trace.advance(LoopState::DecidingRetry);
            let failure = forced_failure.unwrap_or_else(|| {
                self.inner.classifier.analyze(&FailureEvidence {
                    tool,
                    parameters: &parameters,
                    analysis: &analysis,
                    execution_error: execution_error.as_deref(),
                    validation: Some(&validation),
                    result: quality.as_ref(),
                })
            });
            trace.attempts.push(RetryAttempt {
                attempt_number,
                parameters: parameters.clone(),
                success: false,
                quality_score: quality.as_ref().map(|q| q.quality_score),
                error: Some(failure.root_cause.clone()),
                duration: attempt_started.elapsed(),
            });

            let strategy = self
                .inner
                .planner
                .plan(&failure, &parameters, attempt_number, max_retries);
            if !strategy.should_retry {
                debug!(
                    tool = %tool,
                    attempt = attempt_number,
                    reasoning = %strategy.reasoning,
                    "retry declined"
                );
                return self.fail(trace, parameters, failure, quality, last_validation);
            }

            trace.advance(LoopState::Adjusting);
            info!(
                tool = %tool,
                request_id = %trace.request_id,
                attempt = attempt_number,
                delay_ms = strategy.retry_delay.as_millis() as u64,
                reasoning = %strategy.reasoning,
                "retrying tool call"
            );
            if let Err(reason) = control.sleep(strategy.retry_delay).await {
                return self.abort(
                    trace,
                    None,
                    parameters,
                    FailureAnalysis::cancelled(reason.to_string()),
                    last_validation,
                );
            }
            parameters = strategy.adjusted_parameters;
            trace.advance(LoopState::Validating);
        }
    }

    /// Analyzes the image once and runs every proposal concurrently against it.
    pub async fn run_batch(
        &self,
        proposals: Vec<ToolCallProposal>,
        image: Arc<[u8]>,
        context: &ConversationContext,
        max_retries: u32,
        control: &RunControl,
    ) -> BatchReport {
        let analysis = match self.analyze(image.clone(), control).await {
            Ok(analysis) => analysis,
            Err(reason) => {
                return BatchReport::from_reports(
                    proposals
                        .into_iter()
                        .map(|proposal| interrupted_before_start(proposal, reason))
                        .collect(),
                );
            }
        };

        let handles = proposals
            .into_iter()
            .map(|proposal| {
                let tool = proposal.tool;
                let parameters = proposal.parameters.clone();
                let runner = self.clone();
                let image = image.clone();
                let analysis = analysis.clone();
                let context = context.clone();
                let control = control.clone();
                let handle = tokio::spawn(async move {
                    runner
                        .run_with_analysis(proposal, image, analysis, &context, max_retries, &control)
                        .await
                });
                (tool, parameters, handle)
            })
            .collect::<Vec<_>>();

        let mut reports = Vec::with_capacity(handles.len());
        for (tool, parameters, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(error) => {
                    warn!(tool = %tool, error = %error, "tool call task failed");
                    let failure = StepError::Join(error).into_failure();
                    reports.push(ToolCallReport {
                        tool,
                        success: false,
                        final_result: None,
                        attempts: vec![RetryAttempt {
                            attempt_number: 1,
                            parameters: parameters.clone(),
                            success: false,
                            quality_score: None,
                            error: Some(failure.root_cause.clone()),
                            duration: Duration::ZERO,
                        }],
                        final_error: Some(failure),
                        final_parameters: parameters,
                        result_quality: None,
                        confidence: 0,
                    });
                }
            }
        }
        let batch = BatchReport::from_reports(reports);
        info!(
            request_id = %context.request_id,
            calls = batch.reports.len(),
            all_succeeded = batch.all_succeeded,
            confidence = batch.confidence,
            "tool call batch finished"
        );
        batch
    }

    async fn validate(
        &self,
        tool: ToolName,
        parameters: &Map<String, Value>,
        analysis: &Arc<ImageAnalysis>,
        control: &RunControl,
    ) -> Result<ValidationResult, StepError> {
        let inner = self.inner.clone();
        let proposal = ToolCallProposal::new(tool, parameters.clone());
        let analysis = analysis.clone();
        run_blocking(control, move || {
            inner
                .validator
                .validate(&proposal, &analysis, inner.store.as_ref())
        })
        .await
    }

    async fn check_result(
        &self,
        before: Arc<[u8]>,
        after: Arc<[u8]>,
        tool: ToolName,
        intent: ToolIntent,
        control: &RunControl,
    ) -> Result<ResultValidation, StepError> {
        let inner = self.inner.clone();
        run_blocking(control, move || {
            inner.results.validate_result(&before, &after, tool, &intent)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    fn succeed(
        &self,
        mut trace: LoopTrace,
        parameters: Map<String, Value>,
        result_image: Arc<[u8]>,
        validation: &ValidationResult,
        quality: ResultValidation,
        analysis: &ImageAnalysis,
        elapsed: Duration,
    ) -> ToolCallReport {
        trace.advance(LoopState::DoneSuccess);
        let confidence = aggregate_weighted(
            validation.confidence,
            true,
            validation.historical_confidence,
            &self.inner.confidence,
        );
        info!(
            tool = %trace.tool,
            request_id = %trace.request_id,
            state = %trace.state,
            attempts = trace.attempts.len(),
            confidence,
            quality_score = quality.quality_score,
            "tool call succeeded"
        );

        if confidence >= self.inner.persist_threshold {
            let record = ToolExecutionRecord::successful(
                trace.tool,
                parameters.clone(),
                confidence,
                ResultMetrics {
                    quality_score: quality.quality_score,
                    percentage_changed: quality.change.percentage_changed,
                    attempts: trace.attempts.len() as u32,
                    duration_ms: elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
                },
                analysis,
            );
            let store = self.inner.store.clone();
            self.inner.learning_writes.spawn_blocking(move || {
                let tool = record.tool;
                if store.record(record) {
                    debug!(tool = %tool, backend = store.backend_name(), "execution recorded for learning");
                }
            });
        }

        ToolCallReport {
            tool: trace.tool,
            success: true,
            final_result: Some(result_image),
            final_error: None,
            final_parameters: parameters,
            result_quality: Some(quality),
            attempts: trace.attempts,
            confidence,
        }
    }

    fn fail(
        &self,
        mut trace: LoopTrace,
        parameters: Map<String, Value>,
        failure: FailureAnalysis,
        quality: Option<ResultValidation>,
        last_validation: Option<(u8, Option<u8>)>,
    ) -> ToolCallReport {
        trace.advance(LoopState::DoneFailure);
        let confidence = self.failure_confidence(last_validation);
        info!(
            tool = %trace.tool,
            request_id = %trace.request_id,
            state = %trace.state,
            attempts = trace.attempts.len(),
            mode = ?failure.mode,
            kind = ?failure.kind,
            root_cause = %failure.root_cause,
            "tool call failed"
        );
        ToolCallReport {
            tool: trace.tool,
            success: false,
            final_result: None,
            final_error: Some(failure),
            final_parameters: parameters,
            result_quality: quality,
            attempts: trace.attempts,
            confidence,
        }
    }

    fn abort(
        &self,
        mut trace: LoopTrace,
        pending: Option<RetryAttempt>,
        parameters: Map<String, Value>,
        failure: FailureAnalysis,
        last_validation: Option<(u8, Option<u8>)>,
    ) -> ToolCallReport {
        trace.attempts.extend(pending);
        self.fail(trace, parameters, failure, None, last_validation)
    }

    fn failure_confidence(&self, last_validation: Option<(u8, Option<u8>)>) -> u8 {
        let (validation, historical) = last_validation.unwrap_or((0, None));
        aggregate_weighted(validation, false, historical, &self.inner.confidence)
    }
}

fn interrupted_before_start(proposal: ToolCallProposal, reason: Interrupted) -> ToolCallReport {
    let failure = FailureAnalysis::cancelled(reason.to_string());
    info!(tool = %proposal.tool, reason = %reason, "tool call interrupted before validation");
    ToolCallReport {
        tool: proposal.tool,
        success: false,
        final_result: None,
        attempts: vec![RetryAttempt {
            attempt_number: 1,
            parameters: proposal.parameters.clone(),
            success: false,
            quality_score: None,
            error: Some(failure.root_cause.clone()),
            duration: Duration::ZERO,
        }],
        final_error: Some(failure),
        final_parameters: proposal.parameters,
        result_quality: None,
        confidence: 0,
    }
}

struct LoopTrace {
    tool: ToolName,
    request_id: String,
    state: LoopState,
    attempts: Vec<RetryAttempt>,
}

impl LoopTrace {
    fn new(tool: ToolName, request_id: &str) -> Self {
        Self {
            tool,
            request_id: request_id.to_string(),
            state: LoopState::INITIAL,
            attempts: Vec::new(),
        }
    }

    fn advance(&mut self, next: LoopState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal loop transition {} -> {}",
            self.state,
            next
        );
        debug!(
            tool = %self.tool,
            request_id = %self.request_id,
            attempt = self.attempts.len() + 1,
            from = %self.state,
            to = %next,
            "tool call state transition"
        );
        self.state = next;
    }

    fn failed_attempt(
        &self,
        attempt_number: u32,
        parameters: &Map<String, Value>,
        error: &StepError,
        started: Instant,
    ) -> RetryAttempt {
        RetryAttempt {
            attempt_number,
            parameters: parameters.clone(),
            success: false,
            quality_score: None,
            error: Some(error.to_string()),
            duration: started.elapsed(),
        }
    }
}
