mod compare;

use image::GenericImageView;
use serde::Serialize;
use tracing::{debug, warn};

use self::compare::{compare_pixels, count_partially_transparent};
use crate::settings::QualitySettings;
use crate::tools::{DimensionExpectation, ToolIntent, ToolName};

pub use self::compare::ChangeMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssueKind {
    Corruption,
    OriginalUnreadable,
    FileSizeExplosion,
    FileSizeGrowth,
    DimensionMismatch,
    OverChange,
    UnderChange,
    OperationCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityIssue {
    pub kind: QualityIssueKind,
    pub severity: IssueSeverity,
    pub message: String,
    pub auto_fixable: bool,
}

impl QualityIssue {
    fn new(
        kind: QualityIssueKind,
        severity: IssueSeverity,
        message: impl Into<String>,
        auto_fixable: bool,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            auto_fixable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultValidation {
    pub is_valid: bool,
    pub quality_score: u8,
    pub change: ChangeMetrics,
    pub issues: Vec<QualityIssue>,
    pub matches_intent: bool,
    pub reasoning: String,
}

impl ResultValidation {
    pub fn has_issue(&self, kind: QualityIssueKind) -> bool {
        self.issues.iter().any(|issue| issue.kind == kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultValidator {
    settings: QualitySettings,
}

impl ResultValidator {
    pub fn new(settings: QualitySettings) -> Self {
        Self { settings }
    }

    pub fn validate_result(
        &self,
        before: &[u8],
        after: &[u8],
        tool: ToolName,
        intent: &ToolIntent,
    ) -> ResultValidation {
        let s = &self.settings;
        let tunable = tool.schema().tolerance_param().is_some();
        let mut issues = Vec::new();
        let mut penalty = 0u32;

        let after_image = match image::load_from_memory(after) {
            Ok(image) => image,
            Err(error) => {
                warn!(tool = %tool, error = %error, "tool output is not a decodable image");
                issues.push(QualityIssue::new(
                    QualityIssueKind::Corruption,
                    IssueSeverity::Critical,
                    format!("result image could not be decoded: {error}"),
                    false,
                ));
                return self.finish(
                    tool,
                    issues,
                    u32::from(s.corruption_penalty),
                    ChangeMetrics::default(),
                );
            }
        };

        let growth_allowance = match intent.dimensions {
            DimensionExpectation::Scale(factor) => f64::from(factor * factor),
            _ => 1.0,
        };
        let size_ratio = after.len() as f64 / before.len().max(1) as f64 / growth_allowance;
        if size_ratio > s.size_major_ratio {
            penalty += u32::from(s.size_major_penalty);
            issues.push(QualityIssue::new(
                QualityIssueKind::FileSizeExplosion,
                IssueSeverity::Major,
                format!("result file is {size_ratio:.1}x the expected size"),
                false,
            ));
        } else if size_ratio > s.size_minor_ratio {
            issues.push(QualityIssue::new(
                QualityIssueKind::FileSizeGrowth,
                IssueSeverity::Minor,
                format!("result file grew to {size_ratio:.1}x the expected size"),
                false,
            ));
        }

        let before_image = match image::load_from_memory(before) {
            Ok(image) => image,
            Err(error) => {
                issues.push(QualityIssue::new(
                    QualityIssueKind::OriginalUnreadable,
                    IssueSeverity::Minor,
                    format!("original image could not be decoded, change not measured: {error}"),
                    false,
                ));
                return self.finish(tool, issues, penalty, ChangeMetrics::default());
            }
        };

        let (bw, bh) = before_image.dimensions();
        let (aw, ah) = after_image.dimensions();
        let expected = match intent.dimensions {
            DimensionExpectation::Preserve => Some((bw, bh)),
            DimensionExpectation::Scale(factor) => {
                Some((bw.saturating_mul(factor), bh.saturating_mul(factor)))
            }
            DimensionExpectation::Free => None,
        };
        if let Some((ew, eh)) = expected {
            if aw.abs_diff(ew) > 1 || ah.abs_diff(eh) > 1 {
                penalty += u32::from(s.dimension_penalty);
                issues.push(QualityIssue::new(
                    QualityIssueKind::DimensionMismatch,
                    IssueSeverity::Major,
                    format!("expected {ew}x{eh} output, got {aw}x{ah}"),
                    false,
                ));
            }
        }

        let before_rgba = before_image.to_rgba8();
        let after_rgba = after_image.to_rgba8();
        let change = compare_pixels(&before_rgba, &after_rgba, s);

        if intent.localized && change.percentage_changed > s.over_change_percent {
            penalty += u32::from(s.change_mismatch_penalty);
            issues.push(QualityIssue::new(
                QualityIssueKind::OverChange,
                IssueSeverity::Major,
                format!(
                    "{:.1}% of pixels changed for a localized edit (limit {:.0}%)",
                    change.percentage_changed, s.over_change_percent
                ),
                tunable,
            ));
        }
        if intent.expects_visible_change && change.percentage_changed < s.under_change_percent {
            penalty += u32::from(s.change_mismatch_penalty);
            issues.push(QualityIssue::new(
                QualityIssueKind::UnderChange,
                IssueSeverity::Major,
                format!(
                    "only {:.2}% of pixels changed where a visible edit was expected",
                    change.percentage_changed
                ),
                tunable,
            ));
        }

        if intent.adds_transparency {
            let before_count = count_partially_transparent(&before_rgba);
            let after_count = count_partially_transparent(&after_rgba);
            if after_count <= before_count {
                penalty += u32::from(s.operation_penalty);
                issues.push(QualityIssue::new(
                    QualityIssueKind::OperationCheck,
                    IssueSeverity::Major,
                    format!(
                        "{tool} should add transparency but transparent pixels went from {before_count} to {after_count}"
                    ),
                    tunable,
                ));
            }
        }

        self.finish(tool, issues, penalty, change)
    }

    fn finish(
        &self,
        tool: ToolName,
        issues: Vec<QualityIssue>,
        penalty: u32,
        change: ChangeMetrics,
    ) -> ResultValidation {
        let quality_score = 100u32.saturating_sub(penalty) as u8;
        let blocking = issues
            .iter()
            .any(|issue| issue.severity >= IssueSeverity::Major);
        let matches_intent = !issues.iter().any(|issue| {
            matches!(
                issue.kind,
                QualityIssueKind::Corruption
                    | QualityIssueKind::DimensionMismatch
                    | QualityIssueKind::OverChange
                    | QualityIssueKind::UnderChange
                    | QualityIssueKind::OperationCheck
            )
        });
        let is_valid = !blocking && quality_score >= self.settings.min_quality;
        let reasoning = if issues.is_empty() {
            format!(
                "{tool} changed {:.1}% of pixels as intended; no quality issues",
                change.percentage_changed
            )
        } else {
            format!(
                "{tool} result scored {quality_score}: {}",
                issues
                    .iter()
                    .map(|issue| issue.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        };
        debug!(
            tool = %tool,
            quality_score,
            percentage_changed = change.percentage_changed,
            is_valid,
            "result validation complete"
        );
        ResultValidation {
            is_valid,
            quality_score,
            change,
            issues,
            matches_intent,
            reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolCall, ToolCallProposal};
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use serde_json::json;
    use std::io::Cursor;

    fn png(image: RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .expect("png encodes");
        out.into_inner()
    }

    fn bands() -> RgbaImage {
        RgbaImage::from_fn(100, 100, |x, _| match x {
            0..=39 => Rgba([255, 0, 0, 255]),
            40..=69 => Rgba([0, 0, 255, 255]),
            _ => Rgba([255, 255, 255, 255]),
        })
    }

    fn knocked_out(cutoff: u32) -> RgbaImage {
        let mut image = bands();
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            if x < cutoff {
                pixel[3] = 0;
            }
        }
        image
    }

    fn knockout_intent() -> ToolIntent {
        let proposal = ToolCallProposal::from_json(&json!({"tool": "color_knockout", "colors": ["#ff0000"]}))
            .expect("proposal parses");
        ToolCall::from_proposal(&proposal)
            .expect("valid call")
            .intent()
    }

    #[test]
    fn localized_knockout_scores_full_quality() {
        let result = ResultValidator::default().validate_result(
            &png(bands()),
            &png(knocked_out(40)),
            ToolName::ColorKnockout,
            &knockout_intent(),
        );
        assert!(result.is_valid, "{}", result.reasoning);
        assert_eq!(result.quality_score, 100);
        assert!(result.matches_intent);
        assert_eq!(result.change.percentage_changed, 40.0);
        assert!(result.change.significant_change);
    }

    #[test]
    fn near_total_change_is_over_change() {
        let result = ResultValidator::default().validate_result(
            &png(bands()),
            &png(knocked_out(97)),
            ToolName::ColorKnockout,
            &knockout_intent(),
        );
        assert!(!result.is_valid);
        assert!(result.has_issue(QualityIssueKind::OverChange));
        assert_eq!(result.quality_score, 60);
        assert!(result.issues.iter().all(|issue| issue.auto_fixable));
    }

    #[test]
    fn no_visible_change_is_under_change_and_fails_operation_check() {
        let result = ResultValidator::default().validate_result(
            &png(bands()),
            &png(bands()),
            ToolName::ColorKnockout,
            &knockout_intent(),
        );
        assert!(result.has_issue(QualityIssueKind::UnderChange));
        assert!(result.has_issue(QualityIssueKind::OperationCheck));
        assert_eq!(result.quality_score, 30);
        assert!(!result.matches_intent);
    }

    #[test]
    fn undecodable_output_is_corruption() {
        let result = ResultValidator::default().validate_result(
            &png(bands()),
            b"garbage",
            ToolName::ColorKnockout,
            &knockout_intent(),
        );
        assert!(!result.is_valid);
        assert_eq!(result.quality_score, 50);
        assert_eq!(result.issues[0].severity, IssueSeverity::Critical);
    }

    #[test]
    fn upscale_expects_scaled_dimensions() {
        let intent = ToolIntent {
            localized: false,
            expects_visible_change: false,
            adds_transparency: false,
            dimensions: DimensionExpectation::Scale(2),
        };
        let before = png(bands());
        let scaled = png(image::imageops::resize(
            &bands(),
            200,
            200,
            image::imageops::FilterType::Nearest,
        ));
        let ok = ResultValidator::default().validate_result(&before, &scaled, ToolName::Upscale, &intent);
        assert!(ok.is_valid, "{}", ok.reasoning);

        let wrong = ResultValidator::default().validate_result(&before, &before, ToolName::Upscale, &intent);
        assert!(wrong.has_issue(QualityIssueKind::DimensionMismatch));
        assert!(!wrong.is_valid);
    }
}
