use serde_json::{Map, Value};
use tracing::debug;

use super::{FailureAnalysis, FailureKind, FailureMode, SuggestedFix};
use crate::analysis::ImageAnalysis;
use crate::result_check::{QualityIssueKind, ResultValidation};
use crate::settings::RetrySettings;
use crate::tools::schema::{as_integer, ParamKind};
use crate::tools::ToolName;
use crate::validation::{ValidationIssueKind, ValidationResult};

const MEMORY_PATTERNS: &[&str] = &[
    "out of memory",
    "memory exhausted",
    "insufficient memory",
    "cannot allocate",
    "allocation failed",
    "resource exhausted",
    "resources exhausted",
];
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
];
const RATE_LIMIT_TOKENS: &[&str] = &["429"];
const NETWORK_PATTERNS: &[&str] = &[
    "network error",
    "network is unreachable",
    "network unreachable",
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection closed",
    "econnreset",
    "econnrefused",
    "socket hang up",
    "dns lookup failed",
    "dns error",
    "host unreachable",
    "broken pipe",
];
const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded", "elapsed"];

/// Everything known about one failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct FailureEvidence<'a> {
    pub tool: ToolName,
    pub parameters: &'a Map<String, Value>,
    pub analysis: &'a ImageAnalysis,
    pub execution_error: Option<&'a str>,
    pub validation: Option<&'a ValidationResult>,
    pub result: Option<&'a ResultValidation>,
}

#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    settings: RetrySettings,
}

impl FailureClassifier {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn analyze(&self, evidence: &FailureEvidence<'_>) -> FailureAnalysis {
        let analysis = if let Some(message) = evidence.execution_error {
            self.classify_execution_error(message)
        } else if let Some(validation) = evidence.validation.filter(|v| !v.is_valid) {
            self.classify_validation(validation, evidence)
        } else if let Some(result) = evidence.result.filter(|r| !r.is_valid) {
            self.classify_result(result, evidence)
        } else if let Some(validation) = evidence.validation.filter(|v| has_tolerance_mismatch(v)) {
            self.classify_validation(validation, evidence)
        } else {
            FailureAnalysis::fatal(
                FailureMode::Execution,
                FailureKind::Unclassified,
                "attempt failed without a recorded cause",
            )
        };
        debug!(
            tool = %evidence.tool,
            mode = ?analysis.mode,
            kind = ?analysis.kind,
            recoverable = analysis.recoverable,
            fixes = analysis.suggested_fixes.len(),
            "failure classified"
        );
        analysis
    }

    fn classify_execution_error(&self, message: &str) -> FailureAnalysis {
        let lowered = message.to_ascii_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| lowered.contains(p));
        if matches(MEMORY_PATTERNS) {
            return FailureAnalysis::fatal(
                FailureMode::Execution,
                FailureKind::ResourceExhausted,
                format!("tool ran out of resources: {message}"),
            );
        }
        let rate_limited = matches(RATE_LIMIT_PATTERNS)
            || RATE_LIMIT_TOKENS
                .iter()
                .any(|token| contains_token(&lowered, token));
        if rate_limited {
            return FailureAnalysis::recoverable(
                FailureMode::ApiError,
                FailureKind::RateLimited,
                format!("tool provider is rate limiting: {message}"),
            );
        }
        if matches(NETWORK_PATTERNS) {
            return FailureAnalysis::recoverable(
                FailureMode::ApiError,
                FailureKind::TransientNetworkError,
                format!("transient network failure: {message}"),
            );
        }
        if matches(TIMEOUT_PATTERNS) {
            return FailureAnalysis::recoverable(
                FailureMode::Timeout,
                FailureKind::Timeout,
                format!("tool exceeded its time budget: {message}"),
            );
        }
        let whitelisted = self
            .settings
            .recoverable_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.to_ascii_lowercase().as_str()));
        if whitelisted {
            return FailureAnalysis::recoverable(
                FailureMode::ApiError,
                FailureKind::Unclassified,
                format!("tool reported a retryable failure: {message}"),
            );
        }
        FailureAnalysis::fatal(
            FailureMode::Execution,
            FailureKind::Unclassified,
            format!("tool failed: {message}"),
        )
    }

    fn classify_validation(
        &self,
        validation: &ValidationResult,
        evidence: &FailureEvidence<'_>,
    ) -> FailureAnalysis {
        let schema_errors = validation
            .issues
            .iter()
            .filter(|issue| issue.kind == ValidationIssueKind::Schema && issue.is_error())
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>();
        if !schema_errors.is_empty() {
            return FailureAnalysis::fatal(
                FailureMode::Validation,
                FailureKind::SchemaError,
                format!("parameters violate the tool schema: {}", schema_errors.join("; ")),
            );
        }

        let mut fixes = Vec::new();
        for issue in &validation.issues {
            let current = evidence
                .parameters
                .get(issue.parameter.as_str())
                .cloned()
                .unwrap_or(Value::Null);
            match issue.kind {
                ValidationIssueKind::ColorNotFound => {
                    if let Some(value) = self.dominant_color_substitute(evidence, &issue.parameter) {
                        fixes.push(SuggestedFix {
                            parameter: issue.parameter.clone(),
                            current_value: current,
                            suggested_value: value,
                            reason: String::from(
                                "replace hallucinated colors with the image's dominant colors",
                            ),
                        });
                    }
                }
                ValidationIssueKind::PositionOutOfBounds
                | ValidationIssueKind::ToleranceTooTight
                | ValidationIssueKind::ToleranceTooLoose => {
                    if let Some(value) = issue.suggested.clone() {
                        fixes.push(SuggestedFix {
                            parameter: issue.parameter.clone(),
                            current_value: current,
                            suggested_value: value,
                            reason: issue.message.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let findings = if validation.errors.is_empty() {
            validation.warnings.join("; ")
        } else {
            validation.errors.join("; ")
        };
        if fixes.is_empty() {
            return FailureAnalysis::fatal(
                FailureMode::Validation,
                FailureKind::Unclassified,
                format!("validation failed: {findings}"),
            );
        }
        FailureAnalysis::recoverable(
            FailureMode::Validation,
            FailureKind::GroundTruthMismatch,
            format!("parameters disagree with the image: {findings}"),
        )
        .with_fixes(fixes)
    }

    fn dominant_color_substitute(
        &self,
        evidence: &FailureEvidence<'_>,
        parameter: &str,
    ) -> Option<Value> {
        let top = evidence.analysis.top_colors(self.settings.substitute_top_colors);
        if top.is_empty() {
            return None;
        }
        let schema = evidence.tool.schema();
        match schema.get(parameter).map(|spec| &spec.kind) {
            Some(ParamKind::ColorList { max_items, .. }) => Some(Value::Array(
                top.iter()
                    .take(*max_items)
                    .map(|color| Value::from(color.to_hex()))
                    .collect(),
            )),
            Some(ParamKind::Color { .. }) => {
                let current = evidence
                    .parameters
                    .get(parameter)
                    .and_then(|v| crate::tools::color::HexColor::from_json(v).ok());
                let chosen = match current {
                    Some(color) => top
                        .iter()
                        .copied()
                        .min_by(|a, b| a.delta_e(color).total_cmp(&b.delta_e(color))),
                    None => top.first().copied(),
                }?;
                Some(Value::from(chosen.to_hex()))
            }
            _ => None,
        }
    }

    fn classify_result(
        &self,
        result: &ResultValidation,
        evidence: &FailureEvidence<'_>,
    ) -> FailureAnalysis {
        let over = result.has_issue(QualityIssueKind::OverChange);
        let under = result.has_issue(QualityIssueKind::UnderChange);
        let tolerance = self.current_tolerance(evidence);

        match (over, under, tolerance) {
            (true, _, Some((name, current))) => {
                let next = (current - self.settings.tolerance_step).max(self.settings.tolerance_floor);
                FailureAnalysis::recoverable(
                    FailureMode::Quality,
                    FailureKind::QualityOverChange,
                    format!(
                        "edit changed {:.1}% of the image; tolerance {current} is too broad",
                        result.change.percentage_changed
                    ),
                )
                .with_fixes(vec![SuggestedFix {
                    parameter: name,
                    current_value: Value::from(current),
                    suggested_value: Value::from(next),
                    reason: format!(
                        "decrease tolerance by {} to narrow the edit",
                        self.settings.tolerance_step
                    ),
                }])
            }
            (false, true, Some((name, current))) => {
                let next = (current + self.settings.tolerance_step).min(self.settings.tolerance_cap);
                FailureAnalysis::recoverable(
                    FailureMode::Quality,
                    FailureKind::QualityUnderChange,
                    format!(
                        "edit changed only {:.2}% of the image; tolerance {current} is too narrow",
                        result.change.percentage_changed
                    ),
                )
                .with_fixes(vec![SuggestedFix {
                    parameter: name,
                    current_value: Value::from(current),
                    suggested_value: Value::from(next),
                    reason: format!(
                        "increase tolerance by {} to widen the edit",
                        self.settings.tolerance_step
                    ),
                }])
            }
            (true, _, None) => FailureAnalysis::fatal(
                FailureMode::Quality,
                FailureKind::QualityOverChange,
                format!("{} has no tolerance to narrow: {}", evidence.tool, result.reasoning),
            ),
            (false, true, None) => FailureAnalysis::fatal(
                FailureMode::Quality,
                FailureKind::QualityUnderChange,
                format!("{} has no tolerance to widen: {}", evidence.tool, result.reasoning),
            ),
            (false, false, _) => FailureAnalysis::fatal(
                FailureMode::Quality,
                FailureKind::Unclassified,
                format!("result failed quality checks: {}", result.reasoning),
            ),
        }
    }

    // Effective tolerance: the proposed value, else the schema default.
    fn current_tolerance(&self, evidence: &FailureEvidence<'_>) -> Option<(String, i64)> {
        let schema = evidence.tool.schema();
        let spec = schema.tolerance_param()?;
        let value = evidence
            .parameters
            .get(spec.name)
            .filter(|v| !v.is_null())
            .or(spec.default.as_ref())
            .and_then(as_integer)?;
        Some((spec.name.to_string(), value))
    }
}

fn has_tolerance_mismatch(validation: &ValidationResult) -> bool {
    validation.has_issue(ValidationIssueKind::ToleranceTooTight)
        || validation.has_issue(ValidationIssueKind::ToleranceTooLoose)
}

// True when `token` appears as a whole alphanumeric word.
fn contains_token(haystack: &str, token: &str) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DominantColor;
    use crate::learning::test_support::analysis;
    use crate::result_check::{ChangeMetrics, IssueSeverity, QualityIssue};
    use crate::tools::color::HexColor;
    use crate::validation::ValidationIssue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn image() -> ImageAnalysis {
        let mut image = analysis(200, 200, 20.0);
        image.dominant_colors = ["#ff0000", "#0000ff", "#ffffff", "#00ff00"]
            .iter()
            .map(|hex| DominantColor {
                color: hex.parse::<HexColor>().expect("valid hex"),
                percentage: 25.0,
            })
            .collect();
        image
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn evidence<'a>(
        tool: ToolName,
        parameters: &'a Map<String, Value>,
        analysis: &'a ImageAnalysis,
    ) -> FailureEvidence<'a> {
        FailureEvidence {
            tool,
            parameters,
            analysis,
            execution_error: None,
            validation: None,
            result: None,
        }
    }

    fn result_with(kind: QualityIssueKind, percentage: f64) -> ResultValidation {
        ResultValidation {
            is_valid: false,
            quality_score: 60,
            change: ChangeMetrics {
                pixels_changed: 0,
                percentage_changed: percentage,
                significant_change: true,
            },
            issues: vec![QualityIssue {
                kind,
                severity: IssueSeverity::Major,
                message: String::from("change mismatch"),
                auto_fixable: true,
            }],
            matches_intent: false,
            reasoning: String::from("change mismatch"),
        }
    }

    fn invalid_validation(issue: ValidationIssue) -> ValidationResult {
        ValidationResult {
            is_valid: !issue.is_error(),
            confidence: 70,
            warnings: Vec::new(),
            errors: vec![issue.message.clone()],
            reasoning: String::new(),
            adjusted_parameters: None,
            issues: vec![issue],
            historical_confidence: None,
        }
    }

    #[test]
    fn execution_errors_follow_priority_order() {
        let classifier = FailureClassifier::default();
        let params = params(json!({"scale": 2}));
        let image = image();
        let cases = [
            ("CUDA out of memory", FailureKind::ResourceExhausted, false),
            ("HTTP 429 Too Many Requests", FailureKind::RateLimited, true),
            ("connection reset by peer", FailureKind::TransientNetworkError, true),
            ("upscale execution timed out after 10ms", FailureKind::Timeout, true),
            ("service temporarily unavailable", FailureKind::Unclassified, true),
            ("invalid model weights", FailureKind::Unclassified, false),
            ("status 429: slow down", FailureKind::RateLimited, true),
            ("network is unreachable", FailureKind::TransientNetworkError, true),
        ];
        for (message, kind, recoverable) in cases {
            let mut ev = evidence(ToolName::Upscale, &params, &image);
            ev.execution_error = Some(message);
            let analysis = classifier.analyze(&ev);
            assert_eq!((analysis.kind, analysis.recoverable), (kind, recoverable), "{message}");
        }
    }

    #[test]
    fn missing_color_substitutes_top_three_dominant_colors() {
        let params = params(json!({"colors": [{"hex": "#ffff00"}], "tolerance": 50}));
        let image = image();
        let validation = invalid_validation(ValidationIssue::error(
            ValidationIssueKind::ColorNotFound,
            "colors",
            "colors contains colors not present in the image",
        ));
        let mut ev = evidence(ToolName::ColorKnockout, &params, &image);
        ev.validation = Some(&validation);

        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.mode, FailureMode::Validation);
        assert_eq!(analysis.kind, FailureKind::GroundTruthMismatch);
        assert!(analysis.recoverable);
        assert_eq!(
            analysis.suggested_fixes[0].suggested_value,
            json!(["#ff0000", "#0000ff", "#ffffff"])
        );
    }

    #[test]
    fn schema_errors_are_fatal() {
        let params = params(json!({"colors": "red"}));
        let image = image();
        let validation = invalid_validation(ValidationIssue::error(
            ValidationIssueKind::Schema,
            "colors",
            "parameter 'colors' must be a list of colors",
        ));
        let mut ev = evidence(ToolName::ColorKnockout, &params, &image);
        ev.validation = Some(&validation);
        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.kind, FailureKind::SchemaError);
        assert!(!analysis.recoverable);
    }

    #[test]
    fn over_change_decreases_tolerance_by_one_step() {
        let params = params(json!({"colors": ["#ff0000"], "tolerance": 50}));
        let image = image();
        let result = result_with(QualityIssueKind::OverChange, 96.0);
        let mut ev = evidence(ToolName::ColorKnockout, &params, &image);
        ev.result = Some(&result);
        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.kind, FailureKind::QualityOverChange);
        assert_eq!(analysis.suggested_fixes[0].current_value, json!(50));
        assert_eq!(analysis.suggested_fixes[0].suggested_value, json!(35));
    }

    #[test]
    fn over_change_tolerance_is_floored() {
        let params = params(json!({"colors": ["#ff0000"], "tolerance": 10}));
        let image = image();
        let result = result_with(QualityIssueKind::OverChange, 99.0);
        let mut ev = evidence(ToolName::ColorKnockout, &params, &image);
        ev.result = Some(&result);
        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.suggested_fixes[0].suggested_value, json!(5));
    }

    #[test]
    fn under_change_increases_default_tolerance() {
        let params = params(json!({"source_color": "#ff0000", "target_color": "#00ff00"}));
        let image = image();
        let result = result_with(QualityIssueKind::UnderChange, 0.5);
        let mut ev = evidence(ToolName::Recolor, &params, &image);
        ev.result = Some(&result);
        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.kind, FailureKind::QualityUnderChange);
        assert_eq!(analysis.suggested_fixes[0].current_value, json!(30));
        assert_eq!(analysis.suggested_fixes[0].suggested_value, json!(45));
    }

    #[test]
    fn quality_failures_without_tolerance_are_not_recoverable() {
        let params = params(json!({"template": "mug"}));
        let image = image();
        let result = result_with(QualityIssueKind::UnderChange, 0.1);
        let mut ev = evidence(ToolName::Mockup, &params, &image);
        ev.result = Some(&result);
        assert!(!FailureClassifier::default().analyze(&ev).recoverable);
    }

    #[test]
    fn numbers_and_words_containing_patterns_stay_fatal() {
        let classifier = FailureClassifier::default();
        let params = params(json!({"scale": 2}));
        let image = image();
        for message in [
            "failed to decode 1429x800 tile: bad checksum",
            "input exceeds 4290 px limit",
            "neural network weights file corrupted",
        ] {
            let mut ev = evidence(ToolName::Upscale, &params, &image);
            ev.execution_error = Some(message);
            let analysis = classifier.analyze(&ev);
            assert_eq!(
                (analysis.kind, analysis.recoverable),
                (FailureKind::Unclassified, false),
                "{message}"
            );
        }
    }

    fn tolerance_warning(kind: ValidationIssueKind, suggested: i64) -> ValidationResult {
        let issue = ValidationIssue::warning(kind, "tolerance", "tolerance disagrees with image noise")
            .with_suggestion(json!(suggested));
        ValidationResult {
            is_valid: true,
            confidence: 90,
            warnings: vec![issue.message.clone()],
            errors: Vec::new(),
            reasoning: String::new(),
            adjusted_parameters: None,
            issues: vec![issue],
            historical_confidence: None,
        }
    }

    #[test]
    fn tight_tolerance_warning_raises_tolerance_to_band_floor() {
        let params = params(json!({
            "source_color": "#ff0000",
            "target_color": "#00ff00",
            "tolerance": 2
        }));
        let image = image();
        let validation = tolerance_warning(ValidationIssueKind::ToleranceTooTight, 32);
        let mut ev = evidence(ToolName::Recolor, &params, &image);
        ev.validation = Some(&validation);

        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.mode, FailureMode::Validation);
        assert!(analysis.recoverable);
        assert_eq!(analysis.suggested_fixes.len(), 1);
        let fix = &analysis.suggested_fixes[0];
        assert_eq!(fix.parameter, "tolerance");
        assert_eq!(fix.current_value, json!(2));
        assert_eq!(fix.suggested_value, json!(32));
    }

    #[test]
    fn loose_tolerance_warning_lowers_tolerance_to_band_ceiling() {
        let params = params(json!({"colors": ["#ff0000"], "tolerance": 90}));
        let image = image();
        let validation = tolerance_warning(ValidationIssueKind::ToleranceTooLoose, 55);
        let mut ev = evidence(ToolName::ColorKnockout, &params, &image);
        ev.validation = Some(&validation);

        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.mode, FailureMode::Validation);
        assert!(analysis.recoverable);
        let fix = &analysis.suggested_fixes[0];
        assert_eq!(fix.current_value, json!(90));
        assert_eq!(fix.suggested_value, json!(55));
    }

    #[test]
    fn failed_result_outranks_tolerance_warning() {
        let params = params(json!({"colors": ["#ff0000"], "tolerance": 50}));
        let image = image();
        let validation = tolerance_warning(ValidationIssueKind::ToleranceTooLoose, 45);
        let result = result_with(QualityIssueKind::OverChange, 97.0);
        let mut ev = evidence(ToolName::ColorKnockout, &params, &image);
        ev.validation = Some(&validation);
        ev.result = Some(&result);

        let analysis = FailureClassifier::default().analyze(&ev);
        assert_eq!(analysis.kind, FailureKind::QualityOverChange);
        assert_eq!(analysis.suggested_fixes[0].suggested_value, json!(35));
    }
}
