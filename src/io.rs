use anyhow::{Context, Result};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

pub fn read_csv_to_polars_df(file_path: &Path) -> Result<DataFrame> {
    let file = File::open(file_path)
        .with_context(|| format!("Failed to open CSV file: {:?}", file_path))?;
    CsvReader::new(file)
        .finish()
        .with_context(|| format!("Failed to read CSV file: {:?}", file_path))
}

pub fn read_parquet_to_polars_df(file_path: &Path) -> Result<DataFrame> {
    let file = File::open(file_path)
        .with_context(|| format!("Failed to open parquet file: {:?}", file_path))?;
    ParquetReader::new(file)
        .finish()
        .with_context(|| format!("Failed to read parquet schema/metadata from file: {:?}", file_path))
}

pub fn write_polars_df_to_parquet(df: &mut DataFrame, output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {:?}", output_path))?;
    ParquetWriter::new(file)
        .finish(df)
        .with_context(|| format!("Failed to write DataFrame to parquet: {:?}", output_path))?;
    Ok(())
}
