pub mod metrics;
pub mod palette;
pub mod print;

use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use self::metrics::{noise_score, sharpness_score, LumaGrid};
use self::palette::summarize_palette;
pub use self::palette::DominantColor;
use self::print::{is_print_ready, max_print_size, read_dpi};
pub use self::print::PrintSize;
use crate::settings::AnalysisSettings;
use crate::tools::color::HexColor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStep {
    Format,
    Decode,
    Metadata,
    Palette,
    Sharpness,
    Noise,
}

impl AnalysisStep {
    // Upper bound on analysis confidence once this step has failed.
    fn confidence_cap(self) -> u8 {
        match self {
            Self::Format => 95,
            Self::Metadata => 90,
            Self::Palette => 70,
            Self::Sharpness => 60,
            Self::Noise => 50,
            Self::Decode => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub dpi: Option<f64>,
    pub file_size: u64,
    pub format: String,
    pub fingerprint: String,
    pub has_transparency: bool,
    pub dominant_colors: Vec<DominantColor>,
    pub color_depth: u16,
    pub unique_colors: u64,
    pub sharpness: f64,
    pub noise: f64,
    pub print_ready: bool,
    pub max_print_size: PrintSize,
    pub confidence: u8,
    pub failed_steps: Vec<AnalysisStep>,
}

impl ImageAnalysis {
    fn degraded(
        file_size: u64,
        format: String,
        fingerprint: String,
        failed_steps: Vec<AnalysisStep>,
    ) -> Self {
        Self {
            width: 0,
            height: 0,
            aspect_ratio: 0.0,
            dpi: None,
            file_size,
            format,
            fingerprint,
            has_transparency: false,
            dominant_colors: Vec::new(),
            color_depth: 0,
            unique_colors: 0,
            sharpness: 0.0,
            noise: 0.0,
            print_ready: false,
            max_print_size: PrintSize {
                width_inches: 0.0,
                height_inches: 0.0,
            },
            confidence: 0,
            failed_steps,
        }
    }

    pub(crate) fn unavailable(file_size: u64) -> Self {
        Self::degraded(
            file_size,
            String::from("unknown"),
            String::new(),
            vec![AnalysisStep::Decode],
        )
    }

    pub fn top_colors(&self, n: usize) -> Vec<HexColor> {
        self.dominant_colors
            .iter()
            .take(n)
            .map(|entry| entry.color)
            .collect()
    }

    pub fn nearest_dominant_color(&self, color: HexColor) -> Option<(HexColor, f64)> {
        self.dominant_colors
            .iter()
            .map(|entry| (entry.color, entry.color.delta_e(color)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroundTruthAnalyzer {
    settings: AnalysisSettings,
}

impl GroundTruthAnalyzer {
    pub fn new(settings: AnalysisSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub fn analyze(&self, bytes: &[u8]) -> ImageAnalysis {
        let file_size = bytes.len() as u64;
        let fingerprint = sha256_hex(bytes);
        let mut failed = Vec::<AnalysisStep>::new();

        let format = image::guess_format(bytes).ok();
        if format.is_none() {
            failed.push(AnalysisStep::Format);
        }
        let format_name = format_label(format);

        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(error) => {
                warn!(error = %error, file_size, "image could not be decoded for analysis");
                failed.push(AnalysisStep::Decode);
                return ImageAnalysis::degraded(file_size, format_name, fingerprint, failed);
            }
        };

        let dpi = match read_dpi(bytes, format) {
            Ok(dpi) => dpi,
            Err(error) => {
                warn!(error = %error, "image resolution metadata unreadable");
                failed.push(AnalysisStep::Metadata);
                None
            }
        };

        let (width, height) = image.dimensions();
        let has_transparency =
            image.color().has_alpha() && image.to_rgba8().pixels().any(|p| p[3] < u8::MAX);
        let sample = self.analysis_sample(&image);

        let (dominant_colors, unique_colors) = match summarize_palette(&sample, &self.settings) {
            Some(summary) => (summary.dominant_colors, summary.unique_colors),
            None => {
                failed.push(AnalysisStep::Palette);
                (Vec::new(), 0)
            }
        };

        let luma = LumaGrid::from_rgba(&sample);
        let sharpness = sharpness_score(&luma, &self.settings).unwrap_or_else(|| {
            failed.push(AnalysisStep::Sharpness);
            0.0
        });
        let noise = noise_score(&luma, &self.settings).unwrap_or_else(|| {
            failed.push(AnalysisStep::Noise);
            0.0
        });

        let confidence = failed
            .iter()
            .map(|step| step.confidence_cap())
            .min()
            .unwrap_or(100);
        if !failed.is_empty() {
            warn!(?failed, confidence, "image analysis degraded");
        }

        let analysis = ImageAnalysis {
            width,
            height,
            aspect_ratio: aspect_ratio(width, height),
            dpi,
            file_size,
            format: format_name,
            fingerprint,
            has_transparency,
            dominant_colors,
            color_depth: image.color().bits_per_pixel(),
            unique_colors,
            sharpness,
            noise,
            print_ready: is_print_ready(width, height, dpi, sharpness, &self.settings),
            max_print_size: max_print_size(width, height, &self.settings),
            confidence,
            failed_steps: failed,
        };
        debug!(
            width,
            height,
            sharpness = analysis.sharpness,
            noise = analysis.noise,
            colors = analysis.dominant_colors.len(),
            "image analysis complete"
        );
        analysis
    }

    fn analysis_sample(&self, image: &DynamicImage) -> image::RgbaImage {
        let limit = self.settings.max_analysis_dimension.max(1);
        if image.width() > limit || image.height() > limit {
            image.thumbnail(limit, limit).to_rgba8()
        } else {
            image.to_rgba8()
        }
    }
}

fn format_label(format: Option<ImageFormat>) -> String {
    format
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("unknown")
        .to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn aspect_ratio(width: u32, height: u32) -> f64 {
    if height == 0 {
        return 0.0;
    }
    (f64::from(width) / f64::from(height) * 1000.0).round() / 1000.0
}
