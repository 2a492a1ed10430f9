use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::Serialize;

use crate::settings::QualitySettings;
use crate::tools::color::rgb_to_lab;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChangeMetrics {
    pub pixels_changed: u64,
    pub percentage_changed: f64,
    pub significant_change: bool,
}

// Compares on a regular grid so at most `max_compared_pixels` are visited.
// A result with different dimensions is resized onto the original first.
pub(super) fn compare_pixels(
    before: &RgbaImage,
    after: &RgbaImage,
    settings: &QualitySettings,
) -> ChangeMetrics {
    let (width, height) = before.dimensions();
    if width == 0 || height == 0 {
        return ChangeMetrics::default();
    }
    let resized;
    let after = if after.dimensions() == (width, height) {
        after
    } else {
        resized = imageops::resize(after, width, height, FilterType::Triangle);
        &resized
    };

    let step = grid_step(u64::from(width) * u64::from(height), settings.max_compared_pixels);
    let mut compared = 0u64;
    let mut changed = 0u64;
    for y in (0..height).step_by(step) {
        for x in (0..width).step_by(step) {
            compared += 1;
            let a = before.get_pixel(x, y);
            let b = after.get_pixel(x, y);
            if a == b {
                continue;
            }
            if a[3].abs_diff(b[3]) > settings.alpha_change_threshold {
                changed += 1;
                continue;
            }
            let distance = rgb_to_lab([a[0], a[1], a[2]]).delta_e(rgb_to_lab([b[0], b[1], b[2]]));
            if distance > settings.pixel_delta_e_threshold {
                changed += 1;
            }
        }
    }

    let percentage = if compared == 0 {
        0.0
    } else {
        ((changed as f64 / compared as f64) * 100.0 * 100.0).round() / 100.0
    };
    let scale = (step * step) as u64;
    ChangeMetrics {
        pixels_changed: changed.saturating_mul(scale).min(u64::from(width) * u64::from(height)),
        percentage_changed: percentage,
        significant_change: percentage >= settings.under_change_percent,
    }
}

pub(super) fn count_partially_transparent(image: &RgbaImage) -> u64 {
    image.pixels().filter(|pixel| pixel[3] < u8::MAX).count() as u64
}

fn grid_step(total_pixels: u64, budget: u64) -> usize {
    if budget == 0 || total_pixels <= budget {
        return 1;
    }
    (total_pixels as f64 / budget as f64).sqrt().ceil().max(1.0) as usize
}
