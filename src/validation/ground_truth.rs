use serde_json::{Map, Value};

use super::{ValidationIssue, ValidationIssueKind};
use crate::analysis::ImageAnalysis;
use crate::settings::ValidationSettings;
use crate::tools::color::HexColor;
use crate::tools::schema::{as_integer, Axis, ParamKind, ParameterSchema, TOLERANCE_MAX, TOLERANCE_MIN};

pub(super) fn check(
    schema: &ParameterSchema,
    params: &Map<String, Value>,
    analysis: &ImageAnalysis,
    settings: &ValidationSettings,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if analysis.width == 0 || analysis.height == 0 {
        issues.push(ValidationIssue::warning(
            ValidationIssueKind::GroundTruthUnavailable,
            "image",
            "image could not be decoded; ground-truth checks skipped",
        ));
        return issues;
    }

    for spec in &schema.params {
        let provided = params.get(spec.name).filter(|v| !v.is_null());
        match &spec.kind {
            ParamKind::Color { grounded: true } => {
                let Some(color) = provided.and_then(|v| HexColor::from_json(v).ok()) else {
                    continue;
                };
                if let Some(issue) = check_single_color(spec.name, color, analysis, settings) {
                    issues.push(issue);
                }
            }
            ParamKind::ColorList { .. } => {
                let Some(items) = provided.and_then(Value::as_array) else {
                    continue;
                };
                if let Some(issue) = check_color_list(spec.name, items, analysis, settings) {
                    issues.push(issue);
                }
            }
            ParamKind::Position { axis } => {
                let Some(value) = provided.and_then(as_integer) else {
                    continue;
                };
                let limit = match axis {
                    Axis::X => analysis.width,
                    Axis::Y => analysis.height,
                };
                if value < 0 || value >= i64::from(limit) {
                    let clamped = value.clamp(0, i64::from(limit) - 1);
                    issues.push(
                        ValidationIssue::error(
                            ValidationIssueKind::PositionOutOfBounds,
                            spec.name,
                            format!(
                                "{} = {value} lies outside the image (valid range 0..{limit})",
                                spec.name
                            ),
                        )
                        .with_suggestion(Value::from(clamped)),
                    );
                }
            }
            ParamKind::Tolerance => {
                let effective = provided.or(spec.default.as_ref());
                let Some(value) = effective.and_then(as_integer) else {
                    continue;
                };
                if let Some(issue) = check_tolerance(spec.name, value, analysis.noise, settings) {
                    issues.push(issue);
                }
            }
            _ => {}
        }
    }
    issues
}

pub(crate) fn tolerance_band(noise: f64, settings: &ValidationSettings) -> (i64, i64) {
    let floor = settings.tolerance_floor_base + noise * settings.tolerance_floor_per_noise;
    let ceiling = settings.tolerance_ceiling_base + noise * settings.tolerance_ceiling_per_noise;
    let clamp = |v: f64| (v.round() as i64).clamp(TOLERANCE_MIN, TOLERANCE_MAX);
    (clamp(floor), clamp(ceiling))
}

fn check_tolerance(
    name: &str,
    value: i64,
    noise: f64,
    settings: &ValidationSettings,
) -> Option<ValidationIssue> {
    let (floor, ceiling) = tolerance_band(noise, settings);
    if value < floor {
        Some(
            ValidationIssue::warning(
                ValidationIssueKind::ToleranceTooTight,
                name,
                format!(
                    "{name} = {value} is too tight for image noise {noise:.1} (expected {floor}..={ceiling})"
                ),
            )
            .with_suggestion(Value::from(floor)),
        )
    } else if value > ceiling {
        Some(
            ValidationIssue::warning(
                ValidationIssueKind::ToleranceTooLoose,
                name,
                format!(
                    "{name} = {value} is too loose for image noise {noise:.1} (expected {floor}..={ceiling})"
                ),
            )
            .with_suggestion(Value::from(ceiling)),
        )
    } else {
        None
    }
}

fn check_single_color(
    name: &str,
    color: HexColor,
    analysis: &ImageAnalysis,
    settings: &ValidationSettings,
) -> Option<ValidationIssue> {
    let Some((nearest, distance)) = analysis.nearest_dominant_color(color) else {
        return Some(palette_unavailable(name));
    };
    (distance > settings.color_match_delta_e).then(|| {
        ValidationIssue::error(
            ValidationIssueKind::ColorNotFound,
            name,
            format!(
                "{name} {color} does not appear in the image (nearest {nearest}, delta E {distance:.1})"
            ),
        )
        .with_suggestion(Value::from(nearest.to_hex()))
    })
}

fn check_color_list(
    name: &str,
    items: &[Value],
    analysis: &ImageAnalysis,
    settings: &ValidationSettings,
) -> Option<ValidationIssue> {
    if analysis.dominant_colors.is_empty() {
        return Some(palette_unavailable(name));
    }
    let mut missing = Vec::new();
    let mut corrected = Vec::with_capacity(items.len());
    for item in items {
        let Ok(color) = HexColor::from_json(item) else {
            corrected.push(item.clone());
            continue;
        };
        match analysis.nearest_dominant_color(color) {
            Some((nearest, distance)) if distance > settings.color_match_delta_e => {
                missing.push(format!("{color} (nearest {nearest}, delta E {distance:.1})"));
                corrected.push(Value::from(nearest.to_hex()));
            }
            _ => corrected.push(Value::from(color.to_hex())),
        }
    }
    if missing.is_empty() {
        return None;
    }
    corrected.dedup();
    Some(
        ValidationIssue::error(
            ValidationIssueKind::ColorNotFound,
            name,
            format!(
                "{name} contains colors not present in the image: {}",
                missing.join(", ")
            ),
        )
        .with_suggestion(Value::Array(corrected)),
    )
}

fn palette_unavailable(name: &str) -> ValidationIssue {
    ValidationIssue::warning(
        ValidationIssueKind::GroundTruthUnavailable,
        name,
        format!("{name} could not be checked: image palette is unavailable"),
    )
}
