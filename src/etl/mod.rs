pub mod base;
pub mod chlorophyll;
pub mod grid;
pub mod join;

use anyhow::Result;
use encoding_rs::Encoding;
use polars::prelude::DataFrame;
use tracing::info;

use crate::config::EtlConfig;
use crate::dbf;
use crate::error::PipelineError;
use crate::io;

/// Staged geo-ETL driver. Each stage consumes named inputs and returns a
/// typed output; a missing or invalid input is a typed failure, never a
/// logged-and-skipped one.
pub struct EtlPipeline {
    config: EtlConfig,
}

impl EtlPipeline {
    pub fn new(config: EtlConfig) -> Self {
        // Create checkpoint directory if needed
        if config.enable_parquet_checkpoints {
            std::fs::create_dir_all(&config.checkpoint_dir).ok();
        }
        Self { config }
    }

    pub fn run(&self) -> Result<DataFrame> {
        self.config.validate()?;
        let encoding = dbf::encoding_for_label(&self.config.text_encoding).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown text encoding '{}'",
                self.config.text_encoding
            ))
        })?;

        let observations = self.stage1_unique_observations()?;
        self.checkpoint("stage1_observations.parquet", &observations)?;

        let chl = self.stage2_grid_chlorophyll(encoding)?;
        self.checkpoint("stage2_chl_grid.parquet", &chl)?;

        let grid = self.stage3_elevation(encoding)?;
        self.checkpoint("stage3_grid.parquet", &grid)?;

        let base = self.stage4_base(grid)?;
        self.checkpoint("stage4_base.parquet", &base)?;

        let mut joined = self.stage5_join(base, chl)?;
        io::write_polars_df_to_parquet(&mut joined, &self.config.output_path)?;
        info!(
            "Final table written to {:?} ({} rows, {} columns)",
            self.config.output_path,
            joined.height(),
            joined.width()
        );
        Ok(joined)
    }

    /// Stage 1: coordinate-level chlorophyll observations, unique rows only.
    /// This is a standalone product; later stages work at grid granularity.
    fn stage1_unique_observations(&self) -> Result<DataFrame> {
        info!("Stage 1: Selecting unique chlorophyll observations...");
        let raw = io::read_csv_to_polars_df(&self.config.chl_csv)?;
        let observations = chlorophyll::select_unique_observations(raw)?;
        info!("Stage 1 complete: {} observations", observations.height());
        Ok(observations)
    }

    /// Stage 2: pixel-level grid chlorophyll from the archived DBF, averaged
    /// per (id, year, month).
    fn stage2_grid_chlorophyll(&self, encoding: &'static Encoding) -> Result<DataFrame> {
        info!("Stage 2: Aggregating grid chlorophyll from DBF...");
        let pixels = dbf::read_dbf_from_archive(
            &self.config.chl_archive,
            &self.config.chl_entry,
            encoding,
        )?;
        let chl = chlorophyll::aggregate_grid_chlorophyll(pixels)?;
        info!("Stage 2 complete: {} cell rows", chl.height());
        Ok(chl)
    }

    /// Stage 3: mean altitude, geometry and centroid per grid cell.
    fn stage3_elevation(&self, encoding: &'static Encoding) -> Result<DataFrame> {
        info!("Stage 3: Calculating mean altitude by each grid cell...");
        let dem = dbf::read_dbf_from_archive(
            &self.config.dem_archive,
            &self.config.dem_entry,
            encoding,
        )?;
        let grid = grid::aggregate_elevation(dem)?;
        info!("Stage 3 complete: {} grid cells", grid.height());
        Ok(grid)
    }

    /// Stage 4: monthly time axis crossed with every grid cell.
    fn stage4_base(&self, grid: DataFrame) -> Result<DataFrame> {
        info!("Stage 4: Building the spatiotemporal base...");
        let base = base::build_base(grid, self.config.start_date, self.config.end_date)?;
        info!("Stage 4 complete: {} base rows", base.height());
        Ok(base)
    }

    /// Stage 5: left join the base with the chlorophyll aggregate.
    fn stage5_join(&self, base: DataFrame, chl: DataFrame) -> Result<DataFrame> {
        info!("Stage 5: Joining base with chlorophyll aggregate...");
        let joined = join::join_chlorophyll(base, chl)?;
        info!("Stage 5 complete: {} rows", joined.height());
        Ok(joined)
    }

    fn checkpoint(&self, name: &str, df: &DataFrame) -> Result<()> {
        if !self.config.enable_parquet_checkpoints {
            return Ok(());
        }
        let path = self.config.checkpoint_dir.join(name);
        info!("Saving checkpoint to {:?}", path);
        io::write_polars_df_to_parquet(&mut df.clone(), &path)
    }
}
