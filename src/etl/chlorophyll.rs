use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::warn;

/// Columns the coordinate-level chlorophyll product carries.
const OBSERVATION_COLUMNS: [&str; 5] = ["xCoor", "yCoor", "year", "month", "chl"];

/// Select the observation columns of the monthly chlorophyll table and keep
/// unique rows.
pub fn select_unique_observations(raw: DataFrame) -> Result<DataFrame> {
    let selected = raw
        .lazy()
        .select(OBSERVATION_COLUMNS.map(col))
        .unique_stable(None, UniqueKeepStrategy::First)
        .collect()
        .context("Failed to select unique chlorophyll observations")?;
    Ok(selected)
}

/// Aggregate pixel-level grid chlorophyll to one mean per (id, year, month),
/// then deduplicate on `id` alone, keeping the earliest (year, month) row per
/// cell. The single-column dedup key mirrors the source process; it discards
/// every month but the first per cell and is tracked as an open question in
/// DESIGN.md rather than fixed here.
pub fn aggregate_grid_chlorophyll(pixels: DataFrame) -> Result<DataFrame> {
    let before = pixels.height();
    let aggregated = pixels
        .lazy()
        .select([
            col("id").cast(DataType::Int64),
            col("year").cast(DataType::Int32),
            col("month").cast(DataType::Int32),
            col("chl").cast(DataType::Float64),
        ])
        .group_by([col("id"), col("year"), col("month")])
        .agg([col("chl").mean()])
        .sort(["id", "year", "month"], SortMultipleOptions::default())
        .unique_stable(Some(vec!["id".into()]), UniqueKeepStrategy::First)
        .sort(["id", "year", "month"], SortMultipleOptions::default())
        .collect()
        .context("Failed to aggregate grid chlorophyll")?;
    if aggregated.height() < before {
        warn!(
            "Chlorophyll aggregation kept {} of {} pixel rows (mean per key, then first month per cell)",
            aggregated.height(),
            before
        );
    }
    Ok(aggregated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_and_deduplicates_observations() {
        let raw = df![
            "xCoor" => [126.5f64, 126.5, 127.0],
            "yCoor" => [36.1f64, 36.1, 36.2],
            "year" => [2006i32, 2006, 2006],
            "month" => [1i32, 1, 1],
            "chl" => [0.4f64, 0.4, 0.9],
            "extra" => ["a", "b", "c"],
        ]
        .unwrap();
        let out = select_unique_observations(raw).unwrap();
        assert_eq!(out.shape(), (2, 5));
        assert_eq!(
            out.get_column_names_str(),
            vec!["xCoor", "yCoor", "year", "month", "chl"]
        );
    }

    #[test]
    fn means_pixels_per_cell_month() {
        let pixels = df![
            "id" => [1i64, 1, 1, 2],
            "year" => [2006i32, 2006, 2006, 2006],
            "month" => [1i32, 1, 1, 1],
            "chl" => [1.0f64, 2.0, 3.0, 5.0],
        ]
        .unwrap();
        let out = aggregate_grid_chlorophyll(pixels).unwrap();
        assert_eq!(out.height(), 2);
        let chl = out.column("chl").unwrap().f64().unwrap();
        assert_eq!(chl.get(0), Some(2.0));
        assert_eq!(chl.get(1), Some(5.0));
    }

    #[test]
    fn keeps_only_first_month_per_cell() {
        // Faithful to the source: dedup key is `id`, not (id, year, month).
        let pixels = df![
            "id" => [7i64, 7, 7],
            "year" => [2007i32, 2006, 2006],
            "month" => [3i32, 12, 2],
            "chl" => [1.0f64, 2.0, 3.0],
        ]
        .unwrap();
        let out = aggregate_grid_chlorophyll(pixels).unwrap();
        assert_eq!(out.height(), 1);
        let years = out.column("year").unwrap().i32().unwrap();
        let months = out.column("month").unwrap().i32().unwrap();
        assert_eq!(years.get(0), Some(2006));
        assert_eq!(months.get(0), Some(2));
    }
}
