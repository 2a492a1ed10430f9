use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabColor {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColorParseError {
    #[error("color value must be a string like '#rrggbb' or an object with a 'hex' field")]
    UnsupportedShape,
    #[error("invalid hex color '{0}'")]
    InvalidHex(String),
}

impl HexColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn from_rgb(rgb: [u8; 3]) -> Self {
        Self::new(rgb[0], rgb[1], rgb[2])
    }

    pub fn to_rgb(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn from_json(value: &Value) -> Result<Self, ColorParseError> {
        match value {
            Value::String(raw) => raw.parse(),
            Value::Object(obj) => obj
                .get("hex")
                .and_then(Value::as_str)
                .ok_or(ColorParseError::UnsupportedShape)?
                .parse(),
            _ => Err(ColorParseError::UnsupportedShape),
        }
    }

    pub fn to_json(self) -> Value {
        serde_json::json!({ "hex": self.to_hex() })
    }

    pub fn luma(self) -> f64 {
        0.299 * f64::from(self.r) + 0.587 * f64::from(self.g) + 0.114 * f64::from(self.b)
    }

    pub fn to_lab(self) -> LabColor {
        rgb_to_lab(self.to_rgb())
    }

    pub fn delta_e(self, other: Self) -> f64 {
        self.to_lab().delta_e(other.to_lab())
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_hex().as_str())
    }
}

impl FromStr for HexColor {
    type Err = ColorParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(ColorParseError::InvalidHex(raw.to_string()));
        }
        let expanded = match digits.len() {
            3 => digits.chars().flat_map(|ch| [ch, ch]).collect::<String>(),
            6 => digits.to_string(),
            _ => return Err(ColorParseError::InvalidHex(raw.to_string())),
        };
        let channel = |idx: usize| {
            u8::from_str_radix(&expanded[idx..idx + 2], 16)
                .map_err(|_| ColorParseError::InvalidHex(raw.to_string()))
        };
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl Serialize for HexColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for HexColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl LabColor {
    // CIE76
    pub fn delta_e(self, other: Self) -> f64 {
        let dl = self.l - other.l;
        let da = self.a - other.a;
        let db = self.b - other.b;
        (dl * dl + da * da + db * db).sqrt()
    }
}

pub fn rgb_to_lab(rgb: [u8; 3]) -> LabColor {
    let linear = |channel: u8| {
        let v = f64::from(channel) / 255.0;
        if v <= 0.040_45 {
            v / 12.92
        } else {
            ((v + 0.055) / 1.055).powf(2.4)
        }
    };
    let r = linear(rgb[0]);
    let g = linear(rgb[1]);
    let b = linear(rgb[2]);

    // sRGB -> XYZ (D65), normalized by the reference white.
    let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / 0.950_47;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
    let z = (0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b) / 1.088_83;

    let f = |t: f64| {
        if t > 0.008_856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let fx = f(x);
    let fy = f(y);
    let fz = f(z);

    LabColor {
        l: 116.0 * fy - 16.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}
