mod ground_truth;
mod historical;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::analysis::ImageAnalysis;
use crate::learning::LearningStore;
use crate::settings::ValidationSettings;
use crate::tools::schema::ViolationSeverity;
use crate::tools::ToolCallProposal;

pub use self::historical::HistoricalFinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssueKind {
    Schema,
    ColorNotFound,
    PositionOutOfBounds,
    ToleranceTooTight,
    ToleranceTooLoose,
    GroundTruthUnavailable,
    HistoricalOutlier,
}

impl ValidationIssueKind {
    pub fn is_ground_truth(self) -> bool {
        matches!(
            self,
            Self::ColorNotFound
                | Self::PositionOutOfBounds
                | Self::ToleranceTooTight
                | Self::ToleranceTooLoose
                | Self::GroundTruthUnavailable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub kind: ValidationIssueKind,
    pub parameter: String,
    pub message: String,
    pub severity: ViolationSeverity,
    // Concrete correction when ground truth or history supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested: Option<Value>,
}

impl ValidationIssue {
    pub fn error(kind: ValidationIssueKind, parameter: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            parameter: parameter.to_string(),
            message: message.into(),
            severity: ViolationSeverity::Error,
            suggested: None,
        }
    }

    pub fn warning(kind: ValidationIssueKind, parameter: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            parameter: parameter.to_string(),
            message: message.into(),
            severity: ViolationSeverity::Warning,
            suggested: None,
        }
    }

    pub fn with_suggestion(mut self, value: Value) -> Self {
        self.suggested = Some(value);
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.severity, ViolationSeverity::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence: u8,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_parameters: Option<Map<String, Value>>,
    pub issues: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_confidence: Option<u8>,
}

impl ValidationResult {
    pub fn has_issue(&self, kind: ValidationIssueKind) -> bool {
        self.issues.iter().any(|issue| issue.kind == kind)
    }

    pub fn issue(&self, kind: ValidationIssueKind) -> Option<&ValidationIssue> {
        self.issues.iter().find(|issue| issue.kind == kind)
    }

    fn from_issues(
        issues: Vec<ValidationIssue>,
        settings: &ValidationSettings,
        proposal: &ToolCallProposal,
        historical_confidence: Option<u8>,
    ) -> Self {
        let mut penalty = 0u32;
        if issues
            .iter()
            .any(|i| i.kind == ValidationIssueKind::Schema && i.is_error())
        {
            penalty += u32::from(settings.schema_penalty);
        }
        if issues.iter().any(|i| i.kind.is_ground_truth() && i.is_error()) {
            penalty += u32::from(settings.ground_truth_error_penalty);
        }
        if issues.iter().any(|i| i.kind.is_ground_truth() && !i.is_error()) {
            penalty += u32::from(settings.ground_truth_warning_penalty);
        }
        if issues
            .iter()
            .any(|i| i.kind == ValidationIssueKind::HistoricalOutlier)
        {
            penalty += u32::from(settings.historical_penalty);
        }
        let confidence = 100u32.saturating_sub(penalty) as u8;

        let (errors, warnings): (Vec<_>, Vec<_>) = issues.iter().partition(|i| i.is_error());
        let errors = errors.into_iter().map(|i| i.message.clone()).collect::<Vec<_>>();
        let warnings = warnings
            .into_iter()
            .map(|i| i.message.clone())
            .collect::<Vec<_>>();

        let mut adjusted = proposal.parameters.clone();
        let mut adjusted_any = false;
        for issue in issues.iter().filter(|i| i.kind != ValidationIssueKind::HistoricalOutlier) {
            if let Some(value) = issue.suggested.as_ref() {
                adjusted.insert(issue.parameter.clone(), value.clone());
                adjusted_any = true;
            }
        }

        let reasoning = if errors.is_empty() && warnings.is_empty() {
            format!(
                "{} parameters passed schema, ground-truth and historical checks",
                proposal.tool
            )
        } else {
            let mut parts = Vec::new();
            if !errors.is_empty() {
                parts.push(format!("{} error(s): {}", errors.len(), errors.join("; ")));
            }
            if !warnings.is_empty() {
                parts.push(format!(
                    "{} warning(s): {}",
                    warnings.len(),
                    warnings.join("; ")
                ));
            }
            format!("{} parameters: {}", proposal.tool, parts.join(". "))
        };

        Self {
            is_valid: errors.is_empty(),
            confidence,
            warnings,
            errors,
            reasoning,
            adjusted_parameters: adjusted_any.then_some(adjusted),
            issues,
            historical_confidence,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterValidator {
    settings: ValidationSettings,
}

impl ParameterValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    /// Runs schema, ground-truth and historical checks. Every applicable
    /// check runs; findings accumulate rather than short-circuit.
    pub fn validate(
        &self,
        proposal: &ToolCallProposal,
        analysis: &ImageAnalysis,
        store: &dyn LearningStore,
    ) -> ValidationResult {
        let schema = proposal.tool.schema();
        let mut issues = schema
            .check(&proposal.parameters)
            .into_iter()
            .map(|violation| ValidationIssue {
                kind: ValidationIssueKind::Schema,
                parameter: violation.parameter,
                message: violation.message,
                severity: violation.severity,
                suggested: None,
            })
            .collect::<Vec<_>>();

        issues.extend(ground_truth::check(
            &schema,
            &proposal.parameters,
            analysis,
            &self.settings,
        ));

        let history = historical::check(
            &schema,
            &proposal.parameters,
            analysis,
            store,
            &self.settings,
        );
        let historical_confidence = history.as_ref().map(|h| h.confidence);
        if let Some(finding) = history {
            issues.extend(finding.issues);
        }

        let result =
            ValidationResult::from_issues(issues, &self.settings, proposal, historical_confidence);
        debug!(
            tool = %proposal.tool,
            is_valid = result.is_valid,
            confidence = result.confidence,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "parameter validation complete"
        );
        result
    }
}
