use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SETTINGS_ENV: &str = "EDIT_GUARD_SETTINGS";
pub const LEARNING_DB_ENV: &str = "EDIT_GUARD_LEARNING_DB";
pub const MAX_RETRIES_ENV: &str = "EDIT_GUARD_MAX_RETRIES";
pub const EXECUTION_TIMEOUT_ENV: &str = "EDIT_GUARD_EXECUTION_TIMEOUT_MS";
pub const DEFAULT_SETTINGS_RELATIVE_PATH: &str = "config/edit_guard.settings.toml";

// Records below this confidence are never persisted, whatever the settings say.
pub const MIN_PERSIST_CONFIDENCE: u8 = 70;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("settings field '{field}' is invalid: {message}")]
    InvalidField { field: String, message: String },
}

impl SettingsError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    pub analysis: AnalysisSettings,
    pub validation: ValidationSettings,
    pub quality: QualitySettings,
    pub retry: RetrySettings,
    pub learning: LearningSettings,
    pub confidence: ConfidenceWeights,
    pub similarity: SimilarityWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub max_analysis_dimension: u32,
    pub palette_size: usize,
    pub palette_merge_delta_e: f64,
    pub sharpness_variance_ceiling: f64,
    pub noise_region_count: usize,
    pub noise_region_size: u32,
    pub noise_variance_ceiling: f64,
    pub noise_trim_fraction: f64,
    pub print_min_dpi: f64,
    pub print_min_inches: f64,
    pub print_min_sharpness: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_analysis_dimension: 512,
            palette_size: 8,
            palette_merge_delta_e: 10.0,
            sharpness_variance_ceiling: 1000.0,
            noise_region_count: 24,
            noise_region_size: 8,
            noise_variance_ceiling: 400.0,
            noise_trim_fraction: 0.25,
            print_min_dpi: 300.0,
            print_min_inches: 2.0,
            print_min_sharpness: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub color_match_delta_e: f64,
    pub schema_penalty: u8,
    pub ground_truth_error_penalty: u8,
    pub ground_truth_warning_penalty: u8,
    pub historical_penalty: u8,
    pub tolerance_floor_base: f64,
    pub tolerance_floor_per_noise: f64,
    pub tolerance_ceiling_base: f64,
    pub tolerance_ceiling_per_noise: f64,
    pub historical_lookup_limit: usize,
    pub historical_min_similarity: f64,
    pub historical_min_records: usize,
    pub historical_band_margin: f64,
    pub historical_min_margin_fraction: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            color_match_delta_e: 30.0,
            schema_penalty: 50,
            ground_truth_error_penalty: 30,
            ground_truth_warning_penalty: 10,
            historical_penalty: 15,
            tolerance_floor_base: 5.0,
            tolerance_floor_per_noise: 0.3,
            tolerance_ceiling_base: 50.0,
            tolerance_ceiling_per_noise: 0.5,
            historical_lookup_limit: 20,
            historical_min_similarity: 0.6,
            historical_min_records: 3,
            historical_band_margin: 0.25,
            historical_min_margin_fraction: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub pixel_delta_e_threshold: f64,
    pub alpha_change_threshold: u8,
    pub max_compared_pixels: u64,
    pub over_change_percent: f64,
    pub under_change_percent: f64,
    pub change_mismatch_penalty: u8,
    pub size_major_ratio: f64,
    pub size_major_penalty: u8,
    pub size_minor_ratio: f64,
    pub dimension_penalty: u8,
    pub corruption_penalty: u8,
    pub operation_penalty: u8,
    pub min_quality: u8,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            pixel_delta_e_threshold: 10.0,
            alpha_change_threshold: 32,
            max_compared_pixels: 1_000_000,
            over_change_percent: 95.0,
            under_change_percent: 1.0,
            change_mismatch_penalty: 40,
            size_major_ratio: 3.0,
            size_major_penalty: 40,
            size_minor_ratio: 2.0,
            dimension_penalty: 30,
            corruption_penalty: 50,
            operation_penalty: 30,
            min_quality: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub tolerance_step: i64,
    pub tolerance_floor: i64,
    pub tolerance_cap: i64,
    pub rate_limit_delay_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub substitute_top_colors: usize,
    pub execution_timeout_ms: u64,
    pub recoverable_patterns: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            tolerance_step: 15,
            tolerance_floor: 5,
            tolerance_cap: 100,
            rate_limit_delay_ms: 5_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            substitute_top_colors: 3,
            execution_timeout_ms: 120_000,
            recoverable_patterns: vec![
                String::from("temporarily unavailable"),
                String::from("try again"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    pub sqlite_path: Option<PathBuf>,
    pub memory_capacity: usize,
    pub sqlite_capacity: usize,
    pub scan_limit: usize,
    pub persist_threshold: u8,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            memory_capacity: 1_000,
            sqlite_capacity: 10_000,
            scan_limit: 500,
            persist_threshold: MIN_PERSIST_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearningBackendConfig {
    Memory { capacity: usize },
    Sqlite { path: PathBuf, capacity: usize },
}

impl LearningSettings {
    pub fn backend(&self) -> LearningBackendConfig {
        match self
            .sqlite_path
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
        {
            Some(path) => LearningBackendConfig::Sqlite {
                path: path.clone(),
                capacity: self.sqlite_capacity,
            },
            None => LearningBackendConfig::Memory {
                capacity: self.memory_capacity,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub validation: f64,
    pub execution: f64,
    pub historical: f64,
    pub neutral_historical: u8,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            validation: 40.0,
            execution: 40.0,
            historical: 20.0,
            neutral_historical: 75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub dimensions: f64,
    pub aspect_ratio: f64,
    pub transparency: f64,
    pub unique_colors: f64,
    pub sharpness: f64,
    pub print_readiness: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            dimensions: 30.0,
            aspect_ratio: 10.0,
            transparency: 15.0,
            unique_colors: 15.0,
            sharpness: 15.0,
            print_readiness: 15.0,
        }
    }
}

impl SimilarityWeights {
    pub fn total(&self) -> f64 {
        self.dimensions
            + self.aspect_ratio
            + self.transparency
            + self.unique_colors
            + self.sharpness
            + self.print_readiness
    }
}

impl GuardSettings {
    pub fn load(app_root: &Path, explicit_path: Option<&str>) -> Result<Self, SettingsError> {
        let env_path = std::env::var(SETTINGS_ENV).ok();
        let mut settings = match resolve_settings_path(app_root, explicit_path, env_path.as_deref())
        {
            Some(path) => Self::from_toml_path(path.as_path())?,
            None => Self::default(),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path).map_err(|error| SettingsError::ReadFile {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        Self::from_toml_str(raw.as_str()).map_err(|message| SettingsError::ParseToml {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str::<Self>(raw).map_err(|error| error.to_string())
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(path) = read(LEARNING_DB_ENV) {
            self.learning.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = read(MAX_RETRIES_ENV) {
            self.retry.max_retries = raw
                .parse()
                .map_err(|_| SettingsError::invalid(MAX_RETRIES_ENV, format!("'{raw}' is not a count")))?;
        }
        if let Some(raw) = read(EXECUTION_TIMEOUT_ENV) {
            self.retry.execution_timeout_ms = raw.parse().map_err(|_| {
                SettingsError::invalid(EXECUTION_TIMEOUT_ENV, format!("'{raw}' is not milliseconds"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let similarity_total = self.similarity.total();
        if (similarity_total - 100.0).abs() > 1e-6 {
            return Err(SettingsError::invalid(
                "similarity",
                format!("weights must sum to 100, got {similarity_total}"),
            ));
        }
        let confidence_total =
            self.confidence.validation + self.confidence.execution + self.confidence.historical;
        if (confidence_total - 100.0).abs() > 1e-6 {
            return Err(SettingsError::invalid(
                "confidence",
                format!("weights must sum to 100, got {confidence_total}"),
            ));
        }
        if self.learning.persist_threshold < MIN_PERSIST_CONFIDENCE {
            return Err(SettingsError::invalid(
                "learning.persist_threshold",
                format!("must be >= {MIN_PERSIST_CONFIDENCE}"),
            ));
        }
        if self.retry.tolerance_floor > self.retry.tolerance_cap {
            return Err(SettingsError::invalid(
                "retry.tolerance_floor",
                "must not exceed retry.tolerance_cap",
            ));
        }
        if self.retry.tolerance_step <= 0 {
            return Err(SettingsError::invalid(
                "retry.tolerance_step",
                "must be positive",
            ));
        }
        if self.quality.under_change_percent >= self.quality.over_change_percent {
            return Err(SettingsError::invalid(
                "quality.under_change_percent",
                "must be below quality.over_change_percent",
            ));
        }
        if self.analysis.noise_region_size == 0 || self.analysis.noise_region_count == 0 {
            return Err(SettingsError::invalid(
                "analysis.noise_region_size",
                "noise sampling needs at least one non-empty region",
            ));
        }
        if !(0.0..1.0).contains(&self.analysis.noise_trim_fraction) {
            return Err(SettingsError::invalid(
                "analysis.noise_trim_fraction",
                "must be within [0, 1)",
            ));
        }
        Ok(())
    }
}

fn resolve_settings_path(
    app_root: &Path,
    explicit_path: Option<&str>,
    env_path: Option<&str>,
) -> Option<PathBuf> {
    let chosen = explicit_path
        .or(env_path)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    if let Some(path) = chosen {
        return Some(if path.is_absolute() {
            path
        } else {
            app_root.join(path)
        });
    }
    let default_path = app_root.join(DEFAULT_SETTINGS_RELATIVE_PATH);
    default_path.exists().then_some(default_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        GuardSettings::default()
            .validate()
            .expect("built-in defaults should be valid");
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let settings = GuardSettings::from_toml_str(
            r#"
            [retry]
            max_retries = 5
            tolerance_step = 10

            [similarity]
            dimensions = 25.0
            aspect_ratio = 15.0
            "#,
        )
        .expect("partial settings should parse");

        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.tolerance_step, 10);
        assert_eq!(settings.retry.tolerance_floor, 5);
        assert_eq!(settings.quality, QualitySettings::default());
        settings.validate().expect("weights still sum to 100");
    }

    #[test]
    fn rejects_similarity_weights_not_summing_to_100() {
        let mut settings = GuardSettings::default();
        settings.similarity.dimensions = 50.0;
        let err = settings.validate().expect_err("weights sum to 120");
        assert!(matches!(err, SettingsError::InvalidField { field, .. } if field == "similarity"));
    }

    #[test]
    fn rejects_persist_threshold_below_floor() {
        let mut settings = GuardSettings::default();
        settings.learning.persist_threshold = 50;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn env_overrides_select_sqlite_and_retry_bound() {
        let env = HashMap::from([
            (LEARNING_DB_ENV, "/tmp/guard/learning.db"),
            (MAX_RETRIES_ENV, " 2 "),
        ]);
        let mut settings = GuardSettings::default();
        settings
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides should apply");

        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(
            settings.learning.backend(),
            LearningBackendConfig::Sqlite {
                path: PathBuf::from("/tmp/guard/learning.db"),
                capacity: 10_000,
            }
        );
    }

    #[test]
    fn env_override_rejects_non_numeric_retry_bound() {
        let mut settings = GuardSettings::default();
        let err = settings
            .apply_env_overrides(|key| (key == MAX_RETRIES_ENV).then(|| String::from("many")))
            .expect_err("non-numeric retries should fail");
        assert!(matches!(err, SettingsError::InvalidField { .. }));
    }

    #[test]
    fn memory_backend_is_selected_without_sqlite_path() {
        assert_eq!(
            LearningSettings::default().backend(),
            LearningBackendConfig::Memory { capacity: 1_000 }
        );
    }

    #[test]
    fn settings_path_prefers_explicit_then_env_then_default_file() {
        let root = Path::new("/tmp/guard-root");
        assert_eq!(
            resolve_settings_path(root, Some("custom.toml"), Some("/etc/env.toml")),
            Some(PathBuf::from("/tmp/guard-root/custom.toml"))
        );
        assert_eq!(
            resolve_settings_path(root, None, Some("/etc/env.toml")),
            Some(PathBuf::from("/etc/env.toml"))
        );
        assert_eq!(resolve_settings_path(root, None, None), None);
    }
}
