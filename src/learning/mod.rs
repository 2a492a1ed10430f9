pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::ImageAnalysis;
use crate::settings::{
    LearningBackendConfig, LearningSettings, SimilarityWeights, MIN_PERSIST_CONFIDENCE,
};
use crate::tools::ToolName;

pub use self::memory::InMemoryLearningStore;
pub use self::sqlite::SqliteLearningStore;

const ASPECT_RATIO_MATCH_EPSILON: f64 = 0.01;

#[derive(Debug, Error)]
pub enum LearningStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create learning store directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("record serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored record is invalid: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub has_transparency: bool,
    pub unique_colors: u64,
    pub sharpness: f64,
    pub noise: f64,
    pub print_ready: bool,
    pub fingerprint: String,
}

impl From<&ImageAnalysis> for AnalysisSnapshot {
    fn from(analysis: &ImageAnalysis) -> Self {
        Self {
            width: analysis.width,
            height: analysis.height,
            aspect_ratio: analysis.aspect_ratio,
            has_transparency: analysis.has_transparency,
            unique_colors: analysis.unique_colors,
            sharpness: analysis.sharpness,
            noise: analysis.noise,
            print_ready: analysis.print_ready,
            fingerprint: analysis.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub quality_score: u8,
    pub percentage_changed: f64,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub id: String,
    pub tool: ToolName,
    pub parameters: Map<String, Value>,
    pub success: bool,
    pub confidence: u8,
    pub metrics: ResultMetrics,
    pub image: AnalysisSnapshot,
    pub recorded_at: String,
}

impl ToolExecutionRecord {
    pub fn successful(
        tool: ToolName,
        parameters: Map<String, Value>,
        confidence: u8,
        metrics: ResultMetrics,
        analysis: &ImageAnalysis,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool,
            parameters,
            success: true,
            confidence,
            metrics,
            image: AnalysisSnapshot::from(analysis),
            recorded_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn is_persistable(&self, threshold: u8) -> bool {
        self.success && self.confidence >= threshold.max(MIN_PERSIST_CONFIDENCE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarRecord {
    pub record: ToolExecutionRecord,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LearningStats {
    pub backend: String,
    pub total_records: usize,
    pub records_by_tool: BTreeMap<String, usize>,
}

// Every operation degrades to a no-op or an empty result when the backing
// storage misbehaves; callers never see storage errors.
pub trait LearningStore: Send + Sync + 'static {
    fn backend_name(&self) -> &'static str;

    /// Appends the record when it is a success at or above the persistence
    /// threshold. Returns whether anything was written.
    fn record(&self, record: ToolExecutionRecord) -> bool;

    fn find_similar(
        &self,
        tool: ToolName,
        analysis: &ImageAnalysis,
        limit: usize,
    ) -> Vec<SimilarRecord>;

    /// Keeps the `keep_most_recent` newest records, returning how many were removed.
    fn prune(&self, keep_most_recent: usize) -> usize;

    fn stats(&self) -> LearningStats;
}

pub type SharedLearningStore = Arc<dyn LearningStore>;

pub fn open_learning_store(
    settings: &LearningSettings,
    weights: &SimilarityWeights,
) -> SharedLearningStore {
    let threshold = settings.persist_threshold;
    match settings.backend() {
        LearningBackendConfig::Memory { capacity } => Arc::new(InMemoryLearningStore::new(
            capacity,
            threshold,
            weights.clone(),
        )),
        LearningBackendConfig::Sqlite { path, capacity } => {
            let store = SqliteLearningStore::new(
                path.clone(),
                capacity,
                settings.scan_limit,
                threshold,
                weights.clone(),
            );
            match store.initialize() {
                Ok(()) => {
                    info!(path = %path.display(), "learning store backed by sqlite");
                    Arc::new(store)
                }
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        error = %error,
                        "learning store unavailable, falling back to in-memory records"
                    );
                    Arc::new(InMemoryLearningStore::new(
                        settings.memory_capacity,
                        threshold,
                        weights.clone(),
                    ))
                }
            }
        }
    }
}

pub fn similarity(weights: &SimilarityWeights, a: &AnalysisSnapshot, b: &AnalysisSnapshot) -> f64 {
    let total = weights.total();
    if total <= 0.0 {
        return 0.0;
    }
    let pixels_a = u64::from(a.width) * u64::from(a.height);
    let pixels_b = u64::from(b.width) * u64::from(b.height);
    let dimensions = ratio_closeness(pixels_a as f64, pixels_b as f64);
    let aspect = bool_score((a.aspect_ratio - b.aspect_ratio).abs() < ASPECT_RATIO_MATCH_EPSILON);
    let transparency = bool_score(a.has_transparency == b.has_transparency);
    let unique_colors = ratio_closeness(a.unique_colors as f64, b.unique_colors as f64);
    let sharpness = 1.0 - ((a.sharpness - b.sharpness).abs() / 100.0).clamp(0.0, 1.0);
    let print = bool_score(a.print_ready == b.print_ready);

    let weighted = weights.dimensions * dimensions
        + weights.aspect_ratio * aspect
        + weights.transparency * transparency
        + weights.unique_colors * unique_colors
        + weights.sharpness * sharpness
        + weights.print_readiness * print;
    (weighted / total).clamp(0.0, 1.0)
}

fn ratio_closeness(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max <= 0.0 {
        return 1.0;
    }
    a.min(b) / max
}

fn bool_score(matches: bool) -> f64 {
    if matches {
        1.0
    } else {
        0.0
    }
}

pub(crate) fn rank_similar<'a, I>(
    records: I,
    tool: ToolName,
    analysis: &ImageAnalysis,
    limit: usize,
    threshold: u8,
    weights: &SimilarityWeights,
) -> Vec<SimilarRecord>
where
    I: IntoIterator<Item = &'a ToolExecutionRecord>,
{
    let target = AnalysisSnapshot::from(analysis);
    let mut scored = records
        .into_iter()
        .filter(|record| record.tool == tool && record.is_persistable(threshold))
        .map(|record| SimilarRecord {
            similarity: similarity(weights, &target, &record.image),
            record: record.clone(),
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde_json::json;

    pub fn snapshot(width: u32, height: u32, sharpness: f64) -> AnalysisSnapshot {
        AnalysisSnapshot {
            width,
            height,
            aspect_ratio: (f64::from(width) / f64::from(height) * 1000.0).round() / 1000.0,
            has_transparency: false,
            unique_colors: 1_000,
            sharpness,
            noise: 5.0,
            print_ready: false,
            fingerprint: String::from("test"),
        }
    }

    pub fn analysis(width: u32, height: u32, sharpness: f64) -> ImageAnalysis {
        let snap = snapshot(width, height, sharpness);
        ImageAnalysis {
            width,
            height,
            aspect_ratio: snap.aspect_ratio,
            dpi: None,
            file_size: 10_000,
            format: String::from("png"),
            fingerprint: snap.fingerprint,
            has_transparency: false,
            dominant_colors: Vec::new(),
            color_depth: 32,
            unique_colors: snap.unique_colors,
            sharpness,
            noise: snap.noise,
            print_ready: false,
            max_print_size: crate::analysis::PrintSize {
                width_inches: 0.0,
                height_inches: 0.0,
            },
            confidence: 100,
            failed_steps: Vec::new(),
        }
    }

    pub fn record(tool: ToolName, tolerance: i64, confidence: u8, image: AnalysisSnapshot) -> ToolExecutionRecord {
        ToolExecutionRecord {
            id: Uuid::new_v4().to_string(),
            tool,
            parameters: json!({"colors": ["#ff0000"], "tolerance": tolerance})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            success: true,
            confidence,
            metrics: ResultMetrics {
                quality_score: 95,
                percentage_changed: 30.0,
                attempts: 1,
                duration_ms: 12,
            },
            image,
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn identical_snapshots_are_fully_similar() {
        let a = snapshot(800, 600, 40.0);
        assert!((similarity(&SimilarityWeights::default(), &a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_weights_each_feature() {
        let weights = SimilarityWeights::default();
        let a = snapshot(800, 600, 40.0);
        let mut b = a.clone();
        b.has_transparency = true;
        assert!((similarity(&weights, &a, &b) - 0.85).abs() < 1e-9);

        let mut c = a.clone();
        c.print_ready = true;
        c.sharpness = 90.0;
        // loses print (0.15) and half of sharpness (0.075)
        assert!((similarity(&weights, &a, &c) - 0.775).abs() < 1e-9);
    }

    #[test]
    fn different_aspect_ratios_lose_the_exact_match_bonus() {
        let weights = SimilarityWeights::default();
        let a = snapshot(800, 600, 40.0);
        let b = snapshot(600, 800, 40.0);
        // same pixel count, different orientation
        assert!((similarity(&weights, &a, &b) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn records_below_threshold_or_failed_are_not_persistable() {
        let image = snapshot(100, 100, 10.0);
        let mut low = record(ToolName::ColorKnockout, 30, 69, image.clone());
        assert!(!low.is_persistable(70));
        low.confidence = 70;
        assert!(low.is_persistable(70));
        low.success = false;
        assert!(!low.is_persistable(70));
        // thresholds below the floor are ignored
        let floor = record(ToolName::ColorKnockout, 30, 60, image);
        assert!(!floor.is_persistable(10));
    }

    #[test]
    fn rank_similar_filters_by_tool_and_orders_by_similarity() {
        let weights = SimilarityWeights::default();
        let records = vec![
            record(ToolName::ColorKnockout, 30, 90, snapshot(400, 400, 10.0)),
            record(ToolName::ColorKnockout, 35, 90, snapshot(800, 600, 40.0)),
            record(ToolName::Recolor, 20, 90, snapshot(800, 600, 40.0)),
        ];
        let ranked = rank_similar(
            records.iter(),
            ToolName::ColorKnockout,
            &analysis(800, 600, 40.0),
            10,
            70,
            &weights,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].record.parameters["tolerance"], 35);
        assert!(ranked[0].similarity > ranked[1].similarity);
    }
}
