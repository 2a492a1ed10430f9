pub mod color;
pub mod schema;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use self::color::HexColor;
use self::schema::{as_integer, ParameterSchema, SchemaViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ColorKnockout,
    Recolor,
    Upscale,
    RemoveBackground,
    Mockup,
}

impl ToolName {
    pub const ALL: [Self; 5] = [
        Self::ColorKnockout,
        Self::Recolor,
        Self::Upscale,
        Self::RemoveBackground,
        Self::Mockup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColorKnockout => "color_knockout",
            Self::Recolor => "recolor",
            Self::Upscale => "upscale",
            Self::RemoveBackground => "remove_background",
            Self::Mockup => "mockup",
        }
    }

    pub fn schema(self) -> ParameterSchema {
        ParameterSchema::for_tool(self)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown tool '{0}'")]
pub struct UnknownToolError(pub String);

impl FromStr for ToolName {
    type Err = UnknownToolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == normalized)
            .ok_or_else(|| UnknownToolError(raw.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProposalParseError {
    #[error("tool call proposal must be a JSON object")]
    NotAnObject,
    #[error("tool call proposal is missing string field 'tool'")]
    MissingTool,
    #[error(transparent)]
    UnknownTool(#[from] UnknownToolError),
    #[error("tool call proposal field 'parameters' must be an object")]
    ParametersNotObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct ToolCallProposal {
    pub tool: ToolName,
    pub parameters: Map<String, Value>,
}

impl ToolCallProposal {
    pub fn new(tool: ToolName, parameters: Map<String, Value>) -> Self {
        Self { tool, parameters }
    }

    // Accepts both `{"tool", "parameters": {..}}` and the flattened form.
    pub fn from_json(value: &Value) -> Result<Self, ProposalParseError> {
        let obj = value.as_object().ok_or(ProposalParseError::NotAnObject)?;
        let tool = obj
            .get("tool")
            .or_else(|| obj.get("name"))
            .and_then(Value::as_str)
            .ok_or(ProposalParseError::MissingTool)?
            .parse::<ToolName>()?;
        let nested = obj.get("parameters").or_else(|| obj.get("arguments"));
        let parameters = match nested {
            Some(Value::Object(params)) => params.clone(),
            Some(_) => return Err(ProposalParseError::ParametersNotObject),
            None => obj
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "tool" | "name"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        Ok(Self { tool, parameters })
    }
}

impl TryFrom<Value> for ToolCallProposal {
    type Error = ProposalParseError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "factor", rename_all = "snake_case")]
pub enum DimensionExpectation {
    Preserve,
    Scale(u32),
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolIntent {
    pub localized: bool,
    pub expects_visible_change: bool,
    pub adds_transparency: bool,
    pub dimensions: DimensionExpectation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorKnockoutParams {
    pub colors: Vec<HexColor>,
    pub tolerance: u8,
    pub preserve_edges: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecolorParams {
    pub source_color: HexColor,
    pub target_color: HexColor,
    pub tolerance: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleParams {
    pub scale: u32,
    pub target_dpi: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveBackgroundParams {
    pub tolerance: u8,
    pub seed: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockupTemplate {
    TShirt,
    Mug,
    Poster,
    ToteBag,
}

impl MockupTemplate {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "t_shirt" => Some(Self::TShirt),
            "mug" => Some(Self::Mug),
            "poster" => Some(Self::Poster),
            "tote_bag" => Some(Self::ToteBag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockupParams {
    pub template: MockupTemplate,
    pub position: Option<(u32, u32)>,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    ColorKnockout(ColorKnockoutParams),
    Recolor(RecolorParams),
    Upscale(UpscaleParams),
    RemoveBackground(RemoveBackgroundParams),
    Mockup(MockupParams),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("parameters for {tool} violate its schema: {}", summarize(.violations))]
    Schema {
        tool: ToolName,
        violations: Vec<SchemaViolation>,
    },
}

fn summarize(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| v.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ToolCall {
    pub fn from_proposal(proposal: &ToolCallProposal) -> Result<Self, ToolCallError> {
        Self::from_parameters(proposal.tool, &proposal.parameters)
    }

    pub fn from_parameters(
        tool: ToolName,
        params: &Map<String, Value>,
    ) -> Result<Self, ToolCallError> {
        let schema = tool.schema();
        let violations = schema
            .check(params)
            .into_iter()
            .filter(SchemaViolation::is_error)
            .collect::<Vec<_>>();
        if !violations.is_empty() {
            return Err(ToolCallError::Schema { tool, violations });
        }

        let reader = ParamReader {
            schema: &schema,
            params,
        };
        let call = match tool {
            ToolName::ColorKnockout => Self::ColorKnockout(ColorKnockoutParams {
                colors: reader.colors("colors"),
                tolerance: reader.tolerance("tolerance"),
                preserve_edges: reader.boolean("preserve_edges"),
            }),
            ToolName::Recolor => Self::Recolor(RecolorParams {
                source_color: reader.color("source_color"),
                target_color: reader.color("target_color"),
                tolerance: reader.tolerance("tolerance"),
            }),
            ToolName::Upscale => Self::Upscale(UpscaleParams {
                scale: reader.integer("scale").unwrap_or(2).clamp(2, 4) as u32,
                target_dpi: reader.integer("target_dpi").map(|v| v as u32),
            }),
            ToolName::RemoveBackground => Self::RemoveBackground(RemoveBackgroundParams {
                tolerance: reader.tolerance("tolerance"),
                seed: reader.point("seed_x", "seed_y"),
            }),
            ToolName::Mockup => Self::Mockup(MockupParams {
                template: reader
                    .string("template")
                    .and_then(MockupTemplate::parse)
                    .unwrap_or(MockupTemplate::TShirt),
                position: reader.point("position_x", "position_y"),
                scale: reader.number("scale").unwrap_or(1.0),
            }),
        };
        Ok(call)
    }

    pub fn tool(&self) -> ToolName {
        match self {
            Self::ColorKnockout(_) => ToolName::ColorKnockout,
            Self::Recolor(_) => ToolName::Recolor,
            Self::Upscale(_) => ToolName::Upscale,
            Self::RemoveBackground(_) => ToolName::RemoveBackground,
            Self::Mockup(_) => ToolName::Mockup,
        }
    }

    pub fn intent(&self) -> ToolIntent {
        match self {
            Self::ColorKnockout(_) | Self::RemoveBackground(_) => ToolIntent {
                localized: true,
                expects_visible_change: true,
                adds_transparency: true,
                dimensions: DimensionExpectation::Preserve,
            },
            Self::Recolor(_) => ToolIntent {
                localized: true,
                expects_visible_change: true,
                adds_transparency: false,
                dimensions: DimensionExpectation::Preserve,
            },
            Self::Upscale(params) => ToolIntent {
                localized: false,
                expects_visible_change: false,
                adds_transparency: false,
                dimensions: DimensionExpectation::Scale(params.scale),
            },
            Self::Mockup(_) => ToolIntent {
                localized: false,
                expects_visible_change: true,
                adds_transparency: false,
                dimensions: DimensionExpectation::Free,
            },
        }
    }
}

struct ParamReader<'a> {
    schema: &'a ParameterSchema,
    params: &'a Map<String, Value>,
}

impl ParamReader<'_> {
    fn value(&self, name: &str) -> Option<&Value> {
        self.params
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.schema.get(name).and_then(|spec| spec.default.as_ref()))
    }

    fn integer(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(as_integer)
    }

    fn number(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(Value::as_f64)
    }

    fn string(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(Value::as_str)
    }

    fn boolean(&self, name: &str) -> bool {
        self.value(name).and_then(Value::as_bool).unwrap_or(false)
    }

    fn tolerance(&self, name: &str) -> u8 {
        self.integer(name).unwrap_or(30).clamp(0, 100) as u8
    }

    fn color(&self, name: &str) -> HexColor {
        self.value(name)
            .and_then(|v| HexColor::from_json(v).ok())
            .unwrap_or_default()
    }

    fn colors(&self, name: &str) -> Vec<HexColor> {
        self.value(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| HexColor::from_json(item).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn point(&self, x_name: &str, y_name: &str) -> Option<(u32, u32)> {
        let x = self.integer(x_name)?;
        let y = self.integer(y_name)?;
        Some((x.max(0) as u32, y.max(0) as u32))
    }
}
