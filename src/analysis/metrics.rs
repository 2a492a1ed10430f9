use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::AnalysisSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct LumaGrid {
    width: u32,
    height: u32,
    values: Vec<f64>,
}

impl LumaGrid {
    pub fn from_rgba(image: &RgbaImage) -> Self {
        let values = image
            .pixels()
            .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
            .collect();
        Self {
            width: image.width(),
            height: image.height(),
            values,
        }
    }

    fn at(&self, x: u32, y: u32) -> f64 {
        self.values[(y as usize) * (self.width as usize) + x as usize]
    }
}

// Variance of the 4-neighbour Laplacian response, scaled to 0..=100.
pub fn sharpness_score(grid: &LumaGrid, settings: &AnalysisSettings) -> Option<f64> {
    if grid.width < 3 || grid.height < 3 {
        return None;
    }
    let mut responses = Vec::with_capacity(((grid.width - 2) * (grid.height - 2)) as usize);
    for y in 1..grid.height - 1 {
        for x in 1..grid.width - 1 {
            let response = grid.at(x, y - 1)
                + grid.at(x - 1, y)
                + grid.at(x + 1, y)
                + grid.at(x, y + 1)
                - 4.0 * grid.at(x, y);
            responses.push(response);
        }
    }
    let variance = variance(&responses);
    Some(normalize(variance, settings.sharpness_variance_ceiling))
}

// Mean local variance over sampled regions. The most structured regions
// (edges crossing the sample window) are trimmed before averaging.
pub fn noise_score(grid: &LumaGrid, settings: &AnalysisSettings) -> Option<f64> {
    let size = settings.noise_region_size;
    if size == 0 || grid.width < size || grid.height < size {
        return None;
    }
    let seed = (u64::from(grid.width) << 32) | u64::from(grid.height);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut region_variances = Vec::with_capacity(settings.noise_region_count);
    let mut window = Vec::with_capacity((size * size) as usize);
    for _ in 0..settings.noise_region_count {
        let x0 = rng.gen_range(0..=grid.width - size);
        let y0 = rng.gen_range(0..=grid.height - size);
        window.clear();
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                window.push(grid.at(x, y));
            }
        }
        region_variances.push(variance(&window));
    }
    if region_variances.is_empty() {
        return None;
    }
    region_variances.sort_by(f64::total_cmp);
    let keep = ((region_variances.len() as f64) * (1.0 - settings.noise_trim_fraction))
        .ceil()
        .max(1.0) as usize;
    let kept = &region_variances[..keep.min(region_variances.len())];
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    Some(normalize(mean, settings.noise_variance_ceiling))
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

fn normalize(value: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    let scaled = (value / ceiling * 100.0).clamp(0.0, 100.0);
    (scaled * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn flat(width: u32, height: u32) -> LumaGrid {
        LumaGrid::from_rgba(&RgbaImage::from_pixel(
            width,
            height,
            Rgba([120, 120, 120, 255]),
        ))
    }

    fn checkerboard(width: u32, height: u32) -> LumaGrid {
        LumaGrid::from_rgba(&RgbaImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        }))
    }

    fn speckled(width: u32, height: u32) -> LumaGrid {
        let mut rng = StdRng::seed_from_u64(7);
        LumaGrid::from_rgba(&RgbaImage::from_fn(width, height, |_, _| {
            let v = 128u8.saturating_add_signed(rng.gen_range(-40..=40));
            Rgba([v, v, v, 255])
        }))
    }

    #[test]
    fn flat_image_has_zero_sharpness_and_noise() {
        let settings = AnalysisSettings::default();
        let grid = flat(64, 64);
        assert_eq!(sharpness_score(&grid, &settings), Some(0.0));
        assert_eq!(noise_score(&grid, &settings), Some(0.0));
    }

    #[test]
    fn hard_edges_saturate_sharpness() {
        let score = sharpness_score(&checkerboard(32, 32), &AnalysisSettings::default())
            .expect("large enough");
        assert_eq!(score, 100.0);
    }

    #[test]
    fn speckle_raises_noise_above_flat() {
        let settings = AnalysisSettings::default();
        let noisy = noise_score(&speckled(64, 64), &settings).expect("large enough");
        assert!(noisy > 50.0, "noise score was {noisy}");
    }

    #[test]
    fn tiny_images_cannot_be_measured() {
        let settings = AnalysisSettings::default();
        assert_eq!(sharpness_score(&flat(2, 2), &settings), None);
        assert_eq!(noise_score(&flat(4, 4), &settings), None);
    }

    #[test]
    fn noise_sampling_is_deterministic() {
        let settings = AnalysisSettings::default();
        let grid = speckled(80, 60);
        assert_eq!(noise_score(&grid, &settings), noise_score(&grid, &settings));
    }
}
