use image::ImageFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::AnalysisSettings;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const INCHES_PER_METER: f64 = 39.370_078_740_157_48;
const CM_PER_INCH: f64 = 2.54;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpiReadError {
    #[error("png chunk stream is truncated at byte {0}")]
    TruncatedPng(usize),
    #[error("jpeg marker stream is truncated at byte {0}")]
    TruncatedJpeg(usize),
    #[error("png signature is missing")]
    BadPngSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrintSize {
    pub width_inches: f64,
    pub height_inches: f64,
}

pub fn read_dpi(bytes: &[u8], format: Option<ImageFormat>) -> Result<Option<f64>, DpiReadError> {
    let dpi = match format {
        Some(ImageFormat::Png) => read_png_dpi(bytes)?,
        Some(ImageFormat::Jpeg) => read_jfif_dpi(bytes)?,
        _ => None,
    };
    Ok(dpi.filter(|v| v.is_finite() && *v > 0.0).map(round_to_2))
}

fn read_png_dpi(bytes: &[u8]) -> Result<Option<f64>, DpiReadError> {
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..8] != PNG_SIGNATURE {
        return Err(DpiReadError::BadPngSignature);
    }
    let mut offset = PNG_SIGNATURE.len();
    loop {
        let header = bytes
            .get(offset..offset + 8)
            .ok_or(DpiReadError::TruncatedPng(offset))?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = &header[4..8];
        let data_start = offset + 8;
        let data = bytes
            .get(data_start..data_start + length)
            .ok_or(DpiReadError::TruncatedPng(data_start))?;
        match kind {
            b"pHYs" if length >= 9 => {
                let ppu_x = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                // unit 1 = pixels per meter; unit 0 only carries an aspect ratio.
                if data[8] == 1 {
                    return Ok(Some(f64::from(ppu_x) / INCHES_PER_METER));
                }
                return Ok(None);
            }
            b"IDAT" | b"IEND" => return Ok(None),
            _ => {}
        }
        offset = data_start + length + 4;
    }
}

fn read_jfif_dpi(bytes: &[u8]) -> Result<Option<f64>, DpiReadError> {
    let mut offset = 2usize;
    while offset + 4 <= bytes.len() {
        if bytes[offset] != 0xFF {
            return Ok(None);
        }
        let marker = bytes[offset + 1];
        if marker == 0xDA || marker == 0xD9 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        let segment = bytes
            .get(offset + 4..offset + 2 + length)
            .ok_or(DpiReadError::TruncatedJpeg(offset))?;
        if marker == 0xE0 && segment.len() >= 12 && &segment[..5] == b"JFIF\0" {
            let units = segment[7];
            let x_density = f64::from(u16::from_be_bytes([segment[8], segment[9]]));
            return Ok(match units {
                1 => Some(x_density),
                2 => Some(x_density * CM_PER_INCH),
                _ => None,
            });
        }
        offset += 2 + length;
    }
    Err(DpiReadError::TruncatedJpeg(offset))
}

pub fn max_print_size(width: u32, height: u32, settings: &AnalysisSettings) -> PrintSize {
    let dpi = settings.print_min_dpi.max(1.0);
    PrintSize {
        width_inches: round_to_2(f64::from(width) / dpi),
        height_inches: round_to_2(f64::from(height) / dpi),
    }
}

pub fn is_print_ready(
    width: u32,
    height: u32,
    dpi: Option<f64>,
    sharpness: f64,
    settings: &AnalysisSettings,
) -> bool {
    let Some(dpi) = dpi.filter(|v| *v > 0.0) else {
        return false;
    };
    let min_side_inches = f64::from(width.min(height)) / dpi;
    dpi >= settings.print_min_dpi
        && min_side_inches >= settings.print_min_inches
        && sharpness >= settings.print_min_sharpness
}

fn round_to_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
