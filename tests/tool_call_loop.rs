mod support;

use std::sync::Arc;
use std::time::Duration;

use edit_guard_core::analysis::GroundTruthAnalyzer;
use edit_guard_core::execution::NativeToolRegistry;
use edit_guard_core::orchestrator::{ConversationContext, RunControl, ToolCallRunner};
use edit_guard_core::retry::{FailureKind, FailureMode};
use edit_guard_core::tools::ToolCallProposal;
use edit_guard_core::validation::{ParameterValidator, ValidationIssueKind};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use support::{bands_png, fast_settings, memory_store, Script, ScriptedRegistry};

fn proposal(value: Value) -> ToolCallProposal {
    ToolCallProposal::from_json(&value).expect("proposal parses")
}

fn context() -> ConversationContext {
    ConversationContext::new("remove the yellow")
}

#[tokio::test]
async fn hallucinated_color_then_over_change_recovers_on_third_attempt() {
    let registry = ScriptedRegistry::new(Script::Pixels);
    let store = memory_store();
    let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), store.clone());

    let report = runner
        .run_tool_call(
            proposal(json!({
                "tool": "color_knockout",
                "colors": [{"hex": "#ffff00"}],
                "tolerance": 50
            })),
            bands_png(),
            &context(),
            3,
            &RunControl::new(),
        )
        .await;

    assert!(report.success, "{:?}", report.final_error);
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(registry.calls(), 2);

    let first = &report.attempts[0];
    assert!(!first.success);
    assert_eq!(first.quality_score, None);
    assert_eq!(first.parameters["colors"], json!([{"hex": "#ffff00"}]));

    let second = &report.attempts[1];
    assert!(!second.success);
    assert_eq!(
        second.parameters["colors"],
        json!(["#ff0000", "#0000ff", "#ffffff"])
    );
    assert_eq!(second.parameters["tolerance"], json!(50));
    assert_eq!(second.quality_score, Some(60));

    let third = &report.attempts[2];
    assert!(third.success);
    assert_eq!(third.parameters["tolerance"], json!(35));
    assert!(third.quality_score.unwrap_or_default() >= 80);

    assert!(report.confidence >= 85, "confidence {}", report.confidence);
    assert_eq!(report.final_parameters["tolerance"], json!(35));
    assert!(report.final_result.is_some());

    runner.wait_for_learning_writes().await;
    assert_eq!(store.stats().total_records, 1);
}

#[tokio::test]
async fn resource_exhaustion_stops_after_one_attempt() {
    let registry = ScriptedRegistry::new(Script::Fail("CUDA out of memory"));
    let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), memory_store());

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "upscale", "scale": 2})),
            bands_png(),
            &context(),
            3,
            &RunControl::new(),
        )
        .await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(registry.calls(), 1);
    let failure = report.final_error.expect("failure is reported");
    assert_eq!(failure.kind, FailureKind::ResourceExhausted);
    assert!(!failure.recoverable);
    assert!(report.confidence < 70);
}

#[tokio::test]
async fn schema_errors_never_reach_the_registry() {
    let registry = ScriptedRegistry::new(Script::Pixels);
    let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), memory_store());

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "upscale", "scale": 9})),
            bands_png(),
            &context(),
            3,
            &RunControl::new(),
        )
        .await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(registry.calls(), 0);
    assert_eq!(
        report.final_error.map(|failure| failure.kind),
        Some(FailureKind::SchemaError)
    );
}

#[tokio::test]
async fn transient_failures_are_bounded_by_max_retries() {
    for max_retries in [0u32, 1, 2] {
        let registry = ScriptedRegistry::new(Script::Fail("connection reset by peer"));
        let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), memory_store());

        let report = runner
            .run_tool_call(
                proposal(json!({"tool": "upscale", "scale": 2})),
                bands_png(),
                &context(),
                max_retries,
                &RunControl::new(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.attempts.len() as u32, max_retries + 1);
        assert_eq!(registry.calls() as u32, max_retries + 1);
        let numbers = report
            .attempts
            .iter()
            .map(|attempt| attempt.attempt_number)
            .collect::<Vec<_>>();
        assert_eq!(numbers, (1..=max_retries + 1).collect::<Vec<_>>());
        assert_eq!(
            report.final_error.map(|failure| failure.kind),
            Some(FailureKind::TransientNetworkError)
        );
    }
}

#[tokio::test]
async fn per_attempt_timeout_is_retried() {
    let mut settings = fast_settings();
    settings.retry.execution_timeout_ms = 20;
    let registry = ScriptedRegistry::new(Script::Sleep(Duration::from_millis(150)));
    let runner = ToolCallRunner::new(&settings, registry.clone(), memory_store());

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "upscale", "scale": 2})),
            bands_png(),
            &context(),
            1,
            &RunControl::new(),
        )
        .await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 2);
    let failure = report.final_error.expect("failure is reported");
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(report.attempts[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}

#[tokio::test]
async fn deadline_aborts_the_attempt_with_a_timeout() {
    let registry = ScriptedRegistry::new(Script::Sleep(Duration::from_millis(300)));
    let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), memory_store());
    let control = RunControl::new().with_timeout(Duration::from_millis(40));

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "upscale", "scale": 2})),
            bands_png(),
            &context(),
            3,
            &control,
        )
        .await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 1);
    let failure = report.final_error.expect("failure is reported");
    assert_eq!(failure.mode, FailureMode::Timeout);
    assert!(!failure.recoverable);
}

#[tokio::test]
async fn cancelled_control_reports_a_timeout_without_running_tools() {
    let registry = ScriptedRegistry::new(Script::Pixels);
    let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), memory_store());
    let control = RunControl::new();
    control.cancel();

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "color_knockout", "colors": ["#ff0000"]})),
            bands_png(),
            &context(),
            3,
            &control,
        )
        .await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(registry.calls(), 0);
    assert_eq!(
        report.final_error.map(|failure| failure.mode),
        Some(FailureMode::Timeout)
    );
}

#[tokio::test]
async fn panicking_tool_is_a_fatal_failure() {
    let registry = ScriptedRegistry::new(Script::Panic);
    let runner = ToolCallRunner::new(&fast_settings(), registry.clone(), memory_store());

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "upscale", "scale": 2})),
            bands_png(),
            &context(),
            3,
            &RunControl::new(),
        )
        .await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 1);
    assert!(report.attempts[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("panicked"));
}

#[tokio::test]
async fn native_registry_knocks_out_an_existing_color() {
    let store = memory_store();
    let runner = ToolCallRunner::new(&fast_settings(), Arc::new(NativeToolRegistry), store.clone());

    let report = runner
        .run_tool_call(
            proposal(json!({"tool": "color_knockout", "colors": ["#ff0000"], "tolerance": 30})),
            bands_png(),
            &context(),
            3,
            &RunControl::new(),
        )
        .await;

    assert!(report.success, "{:?}", report.final_error);
    assert_eq!(report.attempts.len(), 1);
    let quality = report.result_quality.expect("result was checked");
    assert_eq!(quality.change.percentage_changed, 40.0);
    assert_eq!(report.confidence, 95);

    runner.wait_for_learning_writes().await;
    assert_eq!(store.stats().total_records, 1);
}

#[test]
fn validator_checks_colors_against_the_image() {
    let store = memory_store();
    let analysis = GroundTruthAnalyzer::default().analyze(&bands_png());
    let validator = ParameterValidator::default();

    let present = validator.validate(
        &proposal(json!({"tool": "color_knockout", "colors": ["#ff0000"], "tolerance": 30})),
        &analysis,
        store.as_ref(),
    );
    assert!(present.is_valid, "{:?}", present.errors);
    assert!(!present.has_issue(ValidationIssueKind::ColorNotFound));

    let hallucinated = validator.validate(
        &proposal(json!({"tool": "color_knockout", "colors": ["#ffff00"], "tolerance": 30})),
        &analysis,
        store.as_ref(),
    );
    assert!(!hallucinated.is_valid);
    assert!(hallucinated.has_issue(ValidationIssueKind::ColorNotFound));
}
