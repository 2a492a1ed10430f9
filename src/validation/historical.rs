use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{ValidationIssue, ValidationIssueKind};
use crate::analysis::ImageAnalysis;
use crate::learning::{LearningStore, SimilarRecord};
use crate::settings::ValidationSettings;
use crate::tools::schema::ParameterSchema;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalFinding {
    pub comparable_records: usize,
    pub mean_similarity: f64,
    pub confidence: u8,
    pub issues: Vec<ValidationIssue>,
}

// Returns `None` when there is not enough comparable history to judge.
pub(super) fn check(
    schema: &ParameterSchema,
    params: &Map<String, Value>,
    analysis: &ImageAnalysis,
    store: &dyn LearningStore,
    settings: &ValidationSettings,
) -> Option<HistoricalFinding> {
    let comparable = store
        .find_similar(schema.tool, analysis, settings.historical_lookup_limit)
        .into_iter()
        .filter(|hit| hit.similarity >= settings.historical_min_similarity)
        .collect::<Vec<_>>();
    if comparable.len() < settings.historical_min_records {
        debug!(
            tool = %schema.tool,
            comparable = comparable.len(),
            "not enough comparable history for a plausibility band"
        );
        return None;
    }
    let mean_similarity =
        comparable.iter().map(|hit| hit.similarity).sum::<f64>() / comparable.len() as f64;

    let mut checked = 0usize;
    let mut in_band = 0usize;
    let mut issues = Vec::new();
    for spec in &schema.params {
        let Some((range_min, range_max)) = spec.kind.numeric_range() else {
            continue;
        };
        let Some(proposed) = params.get(spec.name).and_then(Value::as_f64) else {
            continue;
        };
        let Some((low, high)) = plausibility_band(
            &comparable,
            spec.name,
            range_max - range_min,
            settings,
        ) else {
            continue;
        };
        checked += 1;
        if proposed >= low && proposed <= high {
            in_band += 1;
        } else {
            issues.push(ValidationIssue::warning(
                ValidationIssueKind::HistoricalOutlier,
                spec.name,
                format!(
                    "{} = {proposed} is outside the historically successful range {low:.1}..={high:.1}",
                    spec.name
                ),
            ));
        }
    }

    let in_band_ratio = if checked == 0 {
        1.0
    } else {
        in_band as f64 / checked as f64
    };
    let confidence = (100.0 * (0.5 * in_band_ratio + 0.5 * mean_similarity))
        .round()
        .clamp(0.0, 100.0) as u8;
    Some(HistoricalFinding {
        comparable_records: comparable.len(),
        mean_similarity,
        confidence,
        issues,
    })
}

fn plausibility_band(
    comparable: &[SimilarRecord],
    name: &str,
    schema_span: f64,
    settings: &ValidationSettings,
) -> Option<(f64, f64)> {
    let values = comparable
        .iter()
        .filter_map(|hit| hit.record.parameters.get(name).and_then(Value::as_f64))
        .collect::<Vec<_>>();
    if values.len() < settings.historical_min_records {
        return None;
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let margin = ((max - min) * settings.historical_band_margin)
        .max(schema_span * settings.historical_min_margin_fraction);
    Some((min - margin, max + margin))
}
