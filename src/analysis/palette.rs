use std::collections::{HashMap, HashSet};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::settings::AnalysisSettings;
use crate::tools::color::{rgb_to_lab, HexColor, LabColor};

const TRANSPARENT_ALPHA_CUTOFF: u8 = 16;
const MAX_MERGE_CANDIDATES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantColor {
    pub color: HexColor,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaletteSummary {
    pub dominant_colors: Vec<DominantColor>,
    pub unique_colors: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    sum: [u64; 3],
    count: u64,
}

impl Bucket {
    fn mean(&self) -> [u8; 3] {
        let count = self.count.max(1);
        [
            (self.sum[0] / count) as u8,
            (self.sum[1] / count) as u8,
            (self.sum[2] / count) as u8,
        ]
    }
}

struct MergedColor {
    bucket: Bucket,
    lab: LabColor,
}

pub fn summarize_palette(image: &RgbaImage, settings: &AnalysisSettings) -> Option<PaletteSummary> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }

    let mut buckets = HashMap::<[u8; 3], Bucket>::new();
    let mut unique = HashSet::<[u8; 3]>::new();
    let mut total = 0_u64;
    for pixel in image.pixels() {
        let [r, g, b, a] = pixel.0;
        if a < TRANSPARENT_ALPHA_CUTOFF {
            continue;
        }
        unique.insert([r, g, b]);
        let bucket = buckets.entry([r >> 4, g >> 4, b >> 4]).or_default();
        bucket.sum[0] += u64::from(r);
        bucket.sum[1] += u64::from(g);
        bucket.sum[2] += u64::from(b);
        bucket.count += 1;
        total += 1;
    }

    let mut ordered = buckets.into_iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));

    let mut merged = Vec::<MergedColor>::new();
    for (_, bucket) in ordered.into_iter().take(MAX_MERGE_CANDIDATES) {
        let lab = rgb_to_lab(bucket.mean());
        match merged
            .iter_mut()
            .find(|existing| existing.lab.delta_e(lab) < settings.palette_merge_delta_e)
        {
            Some(existing) => {
                for i in 0..3 {
                    existing.bucket.sum[i] += bucket.sum[i];
                }
                existing.bucket.count += bucket.count;
            }
            None => merged.push(MergedColor { bucket, lab }),
        }
    }

    let mut dominant_colors = merged
        .into_iter()
        .map(|entry| {
            let percentage = if total == 0 {
                0.0
            } else {
                round_to_2(entry.bucket.count as f64 / total as f64 * 100.0)
            };
            (entry.bucket.count, HexColor::from_rgb(entry.bucket.mean()), percentage)
        })
        .collect::<Vec<_>>();
    dominant_colors.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    Some(PaletteSummary {
        dominant_colors: dominant_colors
            .into_iter()
            .take(settings.palette_size)
            .map(|(_, color, percentage)| DominantColor { color, percentage })
            .collect(),
        unique_colors: unique.len() as u64,
    })
}

fn round_to_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
