pub mod cv;
pub mod images;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod sequences;
pub mod train;
pub mod viz;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::ForecastConfig;
use crate::error::PipelineError;
use train::CvReport;

/// Staged forecasting driver: load the monthly frames, window them, run
/// expanding-window cross-validation and persist the metrics report plus a
/// real-versus-predicted comparison frame.
pub struct ForecastPipeline {
    config: ForecastConfig,
}

impl ForecastPipeline {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    pub fn run(&self) -> Result<CvReport> {
        self.config.validate()?;

        info!("Stage 1: Loading monthly chlorophyll frames...");
        let sequence = images::load_frames(&self.config)?;

        info!("Stage 2: Building sliding windows of length {}...", self.config.sequence_length);
        let windows = sequences::make_windows(&sequence.frames, self.config.sequence_length)?;
        if windows.is_empty() {
            return Err(PipelineError::MissingInput {
                stage: "forecast",
                input: format!(
                    "{} frames cannot fill a window of {}",
                    sequence.frames.len(),
                    self.config.sequence_length
                ),
            }
            .into());
        }
        info!("Built {} training pairs", windows.len());

        info!("Stage 3: Cross-validated training over {} folds...", self.config.n_splits);
        let outcome = train::run_cross_validation(&self.config, &windows)?;

        self.write_metrics(&outcome.report)?;
        if let Some((truth, prediction)) = &outcome.last_example {
            viz::save_comparison(truth, prediction, &self.config.comparison_path)?;
            info!("Comparison frame written to {:?}", self.config.comparison_path);
        }
        info!(
            "Cross-validation complete: mean mse {:.6}, mean mape {:.4}",
            outcome.report.mean_mse, outcome.report.mean_mape
        );
        Ok(outcome.report)
    }

    fn write_metrics(&self, report: &CvReport) -> Result<()> {
        let path = &self.config.metrics_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write metrics report {:?}", path))?;
        info!("Metrics report written to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use std::path::Path;

    fn write_frame(dir: &Path, year: i32, month: u32, value: u8) {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([value, value, value]));
        img.save(dir.join(format!("chl_{}_{}.png", year, month))).unwrap();
    }

    #[test]
    fn forecast_end_to_end_over_synthetic_frames() {
        let dir = tempfile::tempdir().unwrap();
        let frames_dir = dir.path().join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();
        for month in 1..=10u32 {
            write_frame(&frames_dir, 2006, month, (month * 20) as u8);
        }

        let config = ForecastConfig {
            image_dir: frames_dir,
            start_year: 2006,
            end_year: 2006,
            start_month: 1,
            end_month: 10,
            sequence_length: 1,
            width: 4,
            height: 4,
            channels: 1,
            n_splits: 2,
            epochs: 1,
            batch_size: 2,
            learning_rate: 1e-3,
            seed: 5,
            model: ModelConfig {
                filters: [2, 2, 2],
                kernels: [3, 3, 3],
                recurrent_dropout: [0.2, 0.2],
                dense_units: [8, 4],
                dense_dropout: 0.2,
            },
            metrics_path: dir.path().join("out/metrics.json"),
            comparison_path: dir.path().join("out/comparison.png"),
        };

        let report = ForecastPipeline::new(config.clone()).run().unwrap();
        assert_eq!(report.folds.len(), 2);
        assert!(report.mean_mse.is_finite());

        let json = std::fs::read_to_string(&config.metrics_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["folds"].as_array().unwrap().len(), 2);
        assert!(config.comparison_path.is_file());
    }

    #[test]
    fn too_short_a_sequence_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let frames_dir = dir.path().join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();
        write_frame(&frames_dir, 2006, 1, 100);

        let config = ForecastConfig {
            image_dir: frames_dir,
            start_year: 2006,
            end_year: 2006,
            start_month: 1,
            end_month: 1,
            sequence_length: 5,
            width: 4,
            height: 4,
            channels: 1,
            ..ForecastConfig::default()
        };
        assert!(ForecastPipeline::new(config).run().is_err());
    }
}
