use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::PipelineError;

/// Configuration for the geo-ETL pipeline. Every path the original hardcoded
/// (or left blank) is an explicit field here and checked once by `validate()`
/// before any processing starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Monthly chlorophyll CSV with columns xCoor, yCoor, year, month, chl.
    pub chl_csv: PathBuf,
    /// Archive holding the chlorophyll 5km-grid attribute table.
    pub chl_archive: PathBuf,
    /// Entry name of the DBF file inside `chl_archive`.
    pub chl_entry: String,
    /// Archive holding the regional DEM attribute table.
    pub dem_archive: PathBuf,
    /// Entry name of the DBF file inside `dem_archive`.
    pub dem_entry: String,
    /// Text encoding of DBF character fields.
    pub text_encoding: String,
    /// First month of the spatiotemporal base (inclusive).
    pub start_date: NaiveDate,
    /// Last month of the spatiotemporal base (inclusive).
    pub end_date: NaiveDate,
    pub enable_parquet_checkpoints: bool,
    pub checkpoint_dir: PathBuf,
    /// Where the final joined table is written.
    pub output_path: PathBuf,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            chl_csv: PathBuf::from("data/chl_month.csv"),
            chl_archive: PathBuf::from("data/chl_grid_5km.zip"),
            chl_entry: String::from("chl_grid_5km.dbf"),
            dem_archive: PathBuf::from("data/region_grid_5km_dem.zip"),
            dem_entry: String::from("region_grid_5km_dem.dbf"),
            text_encoding: String::from("cp949"),
            start_date: NaiveDate::from_ymd_opt(2006, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            enable_parquet_checkpoints: true,
            checkpoint_dir: PathBuf::from("/tmp/chl_pipeline"),
            output_path: PathBuf::from("data/processed/chl_region_monthly.parquet"),
        }
    }
}

impl EtlConfig {
    /// Required-field checks, performed once at startup. Missing source files
    /// are fatal configuration errors, not per-stage log lines.
    pub fn validate(&self) -> Result<()> {
        if !self.chl_csv.is_file() {
            return Err(PipelineError::Config(format!(
                "chlorophyll CSV not found: {:?}",
                self.chl_csv
            ))
            .into());
        }
        if !self.chl_archive.is_file() {
            return Err(PipelineError::Config(format!(
                "chlorophyll archive not found: {:?}",
                self.chl_archive
            ))
            .into());
        }
        if !self.dem_archive.is_file() {
            return Err(PipelineError::Config(format!(
                "DEM archive not found: {:?}",
                self.dem_archive
            ))
            .into());
        }
        if self.start_date > self.end_date {
            return Err(PipelineError::Config(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            ))
            .into());
        }
        if crate::dbf::encoding_for_label(&self.text_encoding).is_none() {
            return Err(PipelineError::Config(format!(
                "unknown text encoding '{}'",
                self.text_encoding
            ))
            .into());
        }
        Ok(())
    }
}

/// Network topology knobs. Defaults reproduce the production model; tests
/// shrink everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Filters of the three stacked ConvLSTM layers.
    pub filters: [usize; 3],
    /// Square kernel sizes of the three ConvLSTM layers.
    pub kernels: [usize; 3],
    /// Dropout rates applied after the first two ConvLSTM layers.
    pub recurrent_dropout: [f32; 2],
    /// Units of the two hidden dense layers.
    pub dense_units: [usize; 2],
    /// Dropout rate after the first dense layer.
    pub dense_dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            filters: [128, 64, 32],
            kernels: [5, 3, 3],
            recurrent_dropout: [0.3, 0.2],
            dense_units: [128, 64],
            dense_dropout: 0.2,
        }
    }
}

/// Configuration for the forecasting pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Directory of monthly raster frames named chl_{year}_{month}.png.
    pub image_dir: PathBuf,
    pub start_year: i32,
    pub end_year: i32,
    pub start_month: u32,
    pub end_month: u32,
    /// Input window length in frames.
    pub sequence_length: usize,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    /// Expanding-window cross-validation fold count.
    pub n_splits: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// RNG seed for weight init and dropout masks.
    pub seed: u64,
    pub model: ModelConfig,
    /// Where the per-fold metrics report is written (JSON).
    pub metrics_path: PathBuf,
    /// Where the real-vs-predicted comparison frame is written (PNG).
    pub comparison_path: PathBuf,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("data/chl_frames"),
            start_year: 2006,
            end_year: 2023,
            start_month: 1,
            end_month: 12,
            sequence_length: 5,
            width: 128,
            height: 128,
            channels: 3,
            n_splits: 5,
            epochs: 10,
            batch_size: 4,
            learning_rate: 1e-3,
            seed: 42,
            model: ModelConfig::default(),
            metrics_path: PathBuf::from("data/processed/cv_metrics.json"),
            comparison_path: PathBuf::from("data/processed/comparison.png"),
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.image_dir.is_dir() {
            return Err(PipelineError::Config(format!(
                "image directory not found: {:?}",
                self.image_dir
            ))
            .into());
        }
        if self.sequence_length == 0 {
            return Err(PipelineError::Config("sequence_length must be >= 1".into()).into());
        }
        if self.n_splits < 2 {
            return Err(PipelineError::Config("n_splits must be >= 2".into()).into());
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(PipelineError::Config(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            ))
            .into());
        }
        if !(1..=12).contains(&self.start_month) || !(1..=12).contains(&self.end_month) {
            return Err(PipelineError::Config("months must be within 1..=12".into()).into());
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(PipelineError::Config("epochs and batch_size must be >= 1".into()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_etl_range_is_2006_through_2024() {
        let cfg = EtlConfig::default();
        assert_eq!(cfg.start_date, NaiveDate::from_ymd_opt(2006, 1, 1).unwrap());
        assert_eq!(cfg.end_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn forecast_validate_rejects_missing_dir() {
        let cfg = ForecastConfig {
            image_dir: PathBuf::from("/definitely/not/here"),
            ..ForecastConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn forecast_validate_rejects_zero_window() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ForecastConfig {
            image_dir: dir.path().to_path_buf(),
            sequence_length: 0,
            ..ForecastConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
