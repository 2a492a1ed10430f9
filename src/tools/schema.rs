use serde::Serialize;
use serde_json::{Map, Value};

use super::color::HexColor;
use super::ToolName;

pub const TOLERANCE_MIN: i64 = 0;
pub const TOLERANCE_MAX: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    // `grounded` colors must exist in the target image.
    Color { grounded: bool },
    ColorList { min_items: usize, max_items: usize },
    Integer { min: i64, max: i64 },
    Number { min: f64, max: f64 },
    Tolerance,
    Boolean,
    Choice { options: &'static [&'static str] },
    Position { axis: Axis },
}

impl ParamKind {
    pub fn numeric_range(&self) -> Option<(f64, f64)> {
        match self {
            Self::Integer { min, max } => Some((*min as f64, *max as f64)),
            Self::Number { min, max } => Some((*min, *max)),
            Self::Tolerance => Some((TOLERANCE_MIN as f64, TOLERANCE_MAX as f64)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
        }
    }

    fn optional(name: &'static str, kind: ParamKind, default: Option<Value>) -> Self {
        Self {
            name,
            kind,
            required: false,
            default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSchema {
    pub tool: ToolName,
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    pub parameter: String,
    pub message: String,
    pub severity: ViolationSeverity,
}

impl SchemaViolation {
    fn error(parameter: &str, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.to_string(),
            message: message.into(),
            severity: ViolationSeverity::Error,
        }
    }

    fn warning(parameter: &str, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.to_string(),
            message: message.into(),
            severity: ViolationSeverity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.severity, ViolationSeverity::Error)
    }
}

pub const MOCKUP_TEMPLATES: &[&str] = &["t_shirt", "mug", "poster", "tote_bag"];

impl ParameterSchema {
    pub fn for_tool(tool: ToolName) -> Self {
        let params = match tool {
            ToolName::ColorKnockout => vec![
                ParamSpec::required(
                    "colors",
                    ParamKind::ColorList {
                        min_items: 1,
                        max_items: 10,
                    },
                ),
                ParamSpec::optional("tolerance", ParamKind::Tolerance, Some(Value::from(30))),
                ParamSpec::optional("preserve_edges", ParamKind::Boolean, Some(Value::Bool(true))),
            ],
            ToolName::Recolor => vec![
                ParamSpec::required("source_color", ParamKind::Color { grounded: true }),
                ParamSpec::required("target_color", ParamKind::Color { grounded: false }),
                ParamSpec::optional("tolerance", ParamKind::Tolerance, Some(Value::from(30))),
            ],
            ToolName::Upscale => vec![
                ParamSpec::required("scale", ParamKind::Integer { min: 2, max: 4 }),
                ParamSpec::optional(
                    "target_dpi",
                    ParamKind::Integer {
                        min: 72,
                        max: 1200,
                    },
                    None,
                ),
            ],
            ToolName::RemoveBackground => vec![
                ParamSpec::optional("tolerance", ParamKind::Tolerance, Some(Value::from(20))),
                ParamSpec::optional("seed_x", ParamKind::Position { axis: Axis::X }, None),
                ParamSpec::optional("seed_y", ParamKind::Position { axis: Axis::Y }, None),
            ],
            ToolName::Mockup => vec![
                ParamSpec::required(
                    "template",
                    ParamKind::Choice {
                        options: MOCKUP_TEMPLATES,
                    },
                ),
                ParamSpec::optional("position_x", ParamKind::Position { axis: Axis::X }, None),
                ParamSpec::optional("position_y", ParamKind::Position { axis: Axis::Y }, None),
                ParamSpec::optional(
                    "scale",
                    ParamKind::Number { min: 0.1, max: 2.0 },
                    Some(Value::from(1.0)),
                ),
            ],
        };
        Self { tool, params }
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.name == name)
    }

    pub fn tolerance_param(&self) -> Option<&ParamSpec> {
        self.params
            .iter()
            .find(|spec| matches!(spec.kind, ParamKind::Tolerance))
    }

    pub fn check(&self, params: &Map<String, Value>) -> Vec<SchemaViolation> {
        let mut out = Vec::new();
        for spec in &self.params {
            match params.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        out.push(SchemaViolation::error(
                            spec.name,
                            format!("missing required parameter '{}'", spec.name),
                        ));
                    }
                }
                Some(value) => {
                    if let Some(message) = check_value(&spec.kind, value) {
                        out.push(SchemaViolation::error(
                            spec.name,
                            format!("parameter '{}' {message}", spec.name),
                        ));
                    }
                }
            }
        }
        for name in params.keys() {
            if self.get(name).is_none() {
                out.push(SchemaViolation::warning(
                    name,
                    format!(
                        "unknown parameter '{name}' is ignored by {}",
                        self.tool.as_str()
                    ),
                ));
            }
        }
        out
    }
}

fn check_value(kind: &ParamKind, value: &Value) -> Option<String> {
    match kind {
        ParamKind::Color { .. } => HexColor::from_json(value)
            .err()
            .map(|err| format!("is not a valid color: {err}")),
        ParamKind::ColorList {
            min_items,
            max_items,
        } => {
            let Some(items) = value.as_array() else {
                return Some(String::from("must be a list of colors"));
            };
            if items.len() < *min_items || items.len() > *max_items {
                return Some(format!(
                    "must contain between {min_items} and {max_items} colors, got {}",
                    items.len()
                ));
            }
            items.iter().enumerate().find_map(|(idx, item)| {
                HexColor::from_json(item)
                    .err()
                    .map(|err| format!("item {idx} is not a valid color: {err}"))
            })
        }
        ParamKind::Integer { min, max } => check_integer(value, *min, *max),
        ParamKind::Tolerance => check_integer(value, TOLERANCE_MIN, TOLERANCE_MAX),
        ParamKind::Number { min, max } => match value.as_f64() {
            Some(v) if v.is_finite() && v >= *min && v <= *max => None,
            Some(v) => Some(format!("must be within [{min}, {max}], got {v}")),
            None => Some(String::from("must be a number")),
        },
        ParamKind::Boolean => (!value.is_boolean()).then(|| String::from("must be a boolean")),
        ParamKind::Choice { options } => match value.as_str() {
            Some(v) if options.contains(&v) => None,
            Some(v) => Some(format!("must be one of [{}], got '{v}'", options.join(", "))),
            None => Some(String::from("must be a string")),
        },
        ParamKind::Position { .. } => match as_integer(value) {
            Some(v) if v >= 0 => None,
            Some(v) => Some(format!("must be a non-negative pixel coordinate, got {v}")),
            None => Some(String::from("must be an integer pixel coordinate")),
        },
    }
}

fn check_integer(value: &Value, min: i64, max: i64) -> Option<String> {
    match as_integer(value) {
        Some(v) if v >= min && v <= max => None,
        Some(v) => Some(format!("must be within [{min}, {max}], got {v}")),
        None => Some(String::from("must be an integer")),
    }
}

// Accepts whole floats like `50.0`, which LLM proposals produce routinely.
pub(crate) fn as_integer(value: &Value) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    value
        .as_f64()
        .filter(|v| v.is_finite() && v.fract() == 0.0)
        .map(|v| v as i64)
}
