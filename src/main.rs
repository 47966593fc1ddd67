use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use chl_pipeline::config::{EtlConfig, ForecastConfig};
use chl_pipeline::etl::EtlPipeline;
use chl_pipeline::forecast::ForecastPipeline;

#[derive(Parser, Debug)]
#[command(name = "chl_pipeline")]
#[command(about = "Chlorophyll geo-ETL and monthly frame forecasting", long_about = None)]
struct Args {
    /// Run only the geo-ETL pipeline
    #[arg(long)]
    etl: bool,

    /// Run only the forecasting pipeline
    #[arg(long)]
    forecast: bool,

    /// Monthly chlorophyll CSV (xCoor, yCoor, year, month, chl)
    #[arg(long, env = "CHL_CSV")]
    chl_csv: Option<PathBuf>,

    /// Archive holding the chlorophyll grid DBF
    #[arg(long, env = "CHL_ARCHIVE")]
    chl_archive: Option<PathBuf>,

    /// DBF entry name inside the chlorophyll archive
    #[arg(long)]
    chl_entry: Option<String>,

    /// Archive holding the regional DEM DBF
    #[arg(long, env = "DEM_ARCHIVE")]
    dem_archive: Option<PathBuf>,

    /// DBF entry name inside the DEM archive
    #[arg(long)]
    dem_entry: Option<String>,

    /// First month of the spatiotemporal base (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,

    /// Last month of the spatiotemporal base (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<String>,

    /// Destination of the final joined table
    #[arg(long, env = "OUTPUT_PATH")]
    output: Option<PathBuf>,

    /// Disable per-stage parquet checkpoints
    #[arg(long)]
    no_checkpoints: bool,

    /// Directory for per-stage parquet checkpoints
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Directory of monthly raster frames named chl_{year}_{month}.png
    #[arg(long, env = "IMAGE_DIR")]
    image_dir: Option<PathBuf>,

    /// First year of the frame range
    #[arg(long)]
    start_year: Option<i32>,

    /// Last year of the frame range (inclusive)
    #[arg(long)]
    end_year: Option<i32>,

    /// First month of the first year (1-12)
    #[arg(long)]
    start_month: Option<u32>,

    /// Last month of the last year (1-12)
    #[arg(long)]
    end_month: Option<u32>,

    /// Input window length in frames
    #[arg(long)]
    sequence_length: Option<usize>,

    /// Expanding-window cross-validation fold count
    #[arg(long)]
    n_splits: Option<usize>,

    /// Training epochs per fold
    #[arg(long)]
    epochs: Option<usize>,

    /// Minibatch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Adam learning rate
    #[arg(long)]
    learning_rate: Option<f32>,

    /// RNG seed for weight init and dropout
    #[arg(long)]
    seed: Option<u64>,

    /// Frame width after resizing
    #[arg(long)]
    width: Option<usize>,

    /// Frame height after resizing
    #[arg(long)]
    height: Option<usize>,

    /// Frame channels (1 or 3)
    #[arg(long)]
    channels: Option<usize>,

    /// Destination of the per-fold metrics report (JSON)
    #[arg(long)]
    metrics_path: Option<PathBuf>,

    /// Destination of the real-vs-predicted comparison frame (PNG)
    #[arg(long)]
    comparison_path: Option<PathBuf>,
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", value))
}

fn etl_config(args: &Args) -> Result<EtlConfig> {
    let mut config = EtlConfig::default();
    if let Some(path) = &args.chl_csv {
        config.chl_csv = path.clone();
    }
    if let Some(path) = &args.chl_archive {
        config.chl_archive = path.clone();
    }
    if let Some(entry) = &args.chl_entry {
        config.chl_entry = entry.clone();
    }
    if let Some(path) = &args.dem_archive {
        config.dem_archive = path.clone();
    }
    if let Some(entry) = &args.dem_entry {
        config.dem_entry = entry.clone();
    }
    if let Some(date) = &args.start_date {
        config.start_date = parse_date(date)?;
    }
    if let Some(date) = &args.end_date {
        config.end_date = parse_date(date)?;
    }
    if let Some(path) = &args.output {
        config.output_path = path.clone();
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    config.enable_parquet_checkpoints = !args.no_checkpoints;
    Ok(config)
}

fn forecast_config(args: &Args) -> ForecastConfig {
    let mut config = ForecastConfig::default();
    if let Some(dir) = &args.image_dir {
        config.image_dir = dir.clone();
    }
    if let Some(value) = args.start_year {
        config.start_year = value;
    }
    if let Some(value) = args.end_year {
        config.end_year = value;
    }
    if let Some(value) = args.start_month {
        config.start_month = value;
    }
    if let Some(value) = args.end_month {
        config.end_month = value;
    }
    if let Some(value) = args.sequence_length {
        config.sequence_length = value;
    }
    if let Some(value) = args.n_splits {
        config.n_splits = value;
    }
    if let Some(value) = args.epochs {
        config.epochs = value;
    }
    if let Some(value) = args.batch_size {
        config.batch_size = value;
    }
    if let Some(value) = args.learning_rate {
        config.learning_rate = value;
    }
    if let Some(value) = args.seed {
        config.seed = value;
    }
    if let Some(value) = args.width {
        config.width = value;
    }
    if let Some(value) = args.height {
        config.height = value;
    }
    if let Some(value) = args.channels {
        config.channels = value;
    }
    if let Some(path) = &args.metrics_path {
        config.metrics_path = path.clone();
    }
    if let Some(path) = &args.comparison_path {
        config.comparison_path = path.clone();
    }
    config
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chl_pipeline=info".parse()?),
        )
        .init();

    let args = Args::parse();
    // with no mode flag, run both pipelines in order
    let run_etl = args.etl || !args.forecast;
    let run_forecast = args.forecast || !args.etl;

    if run_etl {
        info!("Starting geo-ETL pipeline");
        let start = Instant::now();
        let table = EtlPipeline::new(etl_config(&args)?).run()?;
        info!(
            "ETL finished in {:.2?} ({} rows, {} columns)",
            start.elapsed(),
            table.height(),
            table.width()
        );
    }

    if run_forecast {
        info!("Starting forecasting pipeline");
        let start = Instant::now();
        let report = ForecastPipeline::new(forecast_config(&args)).run()?;
        info!(
            "Forecasting finished in {:.2?} ({} folds, mean mse {:.6})",
            start.elapsed(),
            report.folds.len(),
            report.mean_mse
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forecast_frame_range_is_overridable() {
        let args = Args::try_parse_from([
            "chl_pipeline",
            "--forecast",
            "--start-year",
            "2010",
            "--end-year",
            "2012",
            "--start-month",
            "3",
            "--end-month",
            "9",
        ])
        .unwrap();
        let config = forecast_config(&args);
        assert_eq!(config.start_year, 2010);
        assert_eq!(config.end_year, 2012);
        assert_eq!(config.start_month, 3);
        assert_eq!(config.end_month, 9);
    }

    #[test]
    fn forecast_frame_range_defaults_survive() {
        let args = Args::try_parse_from(["chl_pipeline", "--forecast"]).unwrap();
        let config = forecast_config(&args);
        assert_eq!(config.start_year, 2006);
        assert_eq!(config.end_year, 2023);
        assert_eq!(config.start_month, 1);
        assert_eq!(config.end_month, 12);
    }

    #[test]
    fn etl_dates_parse_and_reject_bad_input() {
        let args = Args::try_parse_from([
            "chl_pipeline",
            "--etl",
            "--start-date",
            "2010-06-01",
            "--end-date",
            "2011-01-01",
        ])
        .unwrap();
        let config = etl_config(&args).unwrap();
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2010, 6, 1).unwrap());

        let bad = Args::try_parse_from(["chl_pipeline", "--etl", "--start-date", "June 2010"]).unwrap();
        assert!(etl_config(&bad).is_err());
    }
}
