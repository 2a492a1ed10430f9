use std::collections::VecDeque;
use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use tracing::debug;

use super::{ToolOutput, ToolRegistry, ToolRegistryError};
use crate::tools::color::{rgb_to_lab, LabColor};
use crate::tools::{
    ColorKnockoutParams, RecolorParams, RemoveBackgroundParams, ToolCall, ToolName, UpscaleParams,
};

/// In-process pixel implementations. Tolerance is read as a CIE76 delta E
/// radius around the target color.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeToolRegistry;

impl ToolRegistry for NativeToolRegistry {
    fn invoke(&self, call: &ToolCall, image: &[u8]) -> Result<ToolOutput, ToolRegistryError> {
        let decoded = image::load_from_memory(image)?;
        let out = match call {
            ToolCall::ColorKnockout(params) => knockout(&decoded, params),
            ToolCall::Recolor(params) => recolor(&decoded, params),
            ToolCall::Upscale(params) => upscale(&decoded, params),
            ToolCall::RemoveBackground(params) => remove_background(&decoded, params),
            ToolCall::Mockup(_) => return Err(ToolRegistryError::Unsupported(ToolName::Mockup)),
        };
        debug!(
            tool = %call.tool(),
            width = out.width(),
            height = out.height(),
            "native tool produced image"
        );
        Ok(ToolOutput {
            image: encode_png(&out)?,
        })
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ToolRegistryError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

fn pixel_lab(pixel: &Rgba<u8>) -> LabColor {
    rgb_to_lab([pixel[0], pixel[1], pixel[2]])
}

fn knockout(image: &DynamicImage, params: &ColorKnockoutParams) -> DynamicImage {
    let targets = params
        .colors
        .iter()
        .map(|color| color.to_lab())
        .collect::<Vec<_>>();
    let radius = f64::from(params.tolerance);
    let soft_start = radius / 2.0;
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let lab = pixel_lab(pixel);
        let distance = targets
            .iter()
            .map(|target| target.delta_e(lab))
            .fold(f64::INFINITY, f64::min);
        if distance > radius {
            continue;
        }
        let alpha = if params.preserve_edges && distance > soft_start && radius > 0.0 {
            // feather pixels near the edge of the tolerance radius
            let keep = (distance - soft_start) / (radius - soft_start);
            (f64::from(pixel[3]) * keep).round() as u8
        } else {
            0
        };
        pixel[3] = pixel[3].min(alpha);
    }
    DynamicImage::ImageRgba8(rgba)
}

fn recolor(image: &DynamicImage, params: &RecolorParams) -> DynamicImage {
    let source = params.source_color.to_lab();
    let radius = f64::from(params.tolerance);
    let [sr, sg, sb] = params.source_color.to_rgb();
    let [tr, tg, tb] = params.target_color.to_rgb();
    let shift = [
        i16::from(tr) - i16::from(sr),
        i16::from(tg) - i16::from(sg),
        i16::from(tb) - i16::from(sb),
    ];
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        if source.delta_e(pixel_lab(pixel)) > radius {
            continue;
        }
        for channel in 0..3 {
            pixel[channel] = (i16::from(pixel[channel]) + shift[channel]).clamp(0, 255) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

fn upscale(image: &DynamicImage, params: &UpscaleParams) -> DynamicImage {
    let (width, height) = image.dimensions();
    image.resize_exact(
        width.saturating_mul(params.scale),
        height.saturating_mul(params.scale),
        FilterType::Lanczos3,
    )
}

fn remove_background(image: &DynamicImage, params: &RemoveBackgroundParams) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return DynamicImage::ImageRgba8(rgba);
    }
    let seeds = match params.seed {
        Some((x, y)) => vec![(x.min(width - 1), y.min(height - 1))],
        None => vec![
            (0, 0),
            (width - 1, 0),
            (0, height - 1),
            (width - 1, height - 1),
        ],
    };
    let radius = f64::from(params.tolerance);
    let mut cleared = vec![false; (width as usize) * (height as usize)];
    for (sx, sy) in seeds {
        let reference = pixel_lab(rgba.get_pixel(sx, sy));
        flood_clear(&mut rgba, &mut cleared, (sx, sy), reference, radius);
    }
    DynamicImage::ImageRgba8(rgba)
}

fn flood_clear(
    rgba: &mut RgbaImage,
    visited: &mut [bool],
    seed: (u32, u32),
    reference: LabColor,
    radius: f64,
) {
    let (width, height) = rgba.dimensions();
    let index = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;
    let mut queue = VecDeque::from([seed]);
    while let Some((x, y)) = queue.pop_front() {
        if visited[index(x, y)] {
            continue;
        }
        let pixel = rgba.get_pixel_mut(x, y);
        if reference.delta_e(pixel_lab(pixel)) > radius {
            continue;
        }
        visited[index(x, y)] = true;
        pixel[3] = 0;
        if x > 0 {
            queue.push_back((x - 1, y));
        }
        if x + 1 < width {
            queue.push_back((x + 1, y));
        }
        if y > 0 {
            queue.push_back((x, y - 1));
        }
        if y + 1 < height {
            queue.push_back((x, y + 1));
        }
    }
}
