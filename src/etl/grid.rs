use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::warn;

use crate::error::PipelineError;

/// Administrative-region attributes carried by every grid cell: codes and
/// names at province / district / sub-district level, in two languages.
const REGION_COLUMNS: [&str; 9] = [
    "CTPRVN_CD",
    "SIG_CD",
    "EMD_CD",
    "CTP_ENG_NM",
    "SIG_ENG_NM",
    "EMD_ENG_NM",
    "CTP_KOR_NM",
    "SIG_KOR_NM",
    "EMD_KOR_NM",
];

/// Collapse per-pixel DEM samples to one row per grid cell: `mean_altitude`
/// over all samples sharing an `id`, the first sample's attributes, a WKT
/// rectangle built from the bounding box, and its midpoint as the centroid.
///
/// Attribute survival assumes every sample of a cell carries the same
/// bounding box; disagreements are logged, not repaired (open question (b)
/// in DESIGN.md).
pub fn aggregate_elevation(dem: DataFrame) -> Result<DataFrame> {
    warn_on_bbox_disagreement(&dem)?;

    let mean_alt = dem
        .clone()
        .lazy()
        .group_by([col("id")])
        .agg([col("altitude").mean().alias("mean_altitude")]);

    let mut attr_cols: Vec<Expr> = vec![
        col("id"),
        col("left"),
        col("bottom"),
        col("right"),
        col("top"),
    ];
    attr_cols.extend(REGION_COLUMNS.iter().map(|c| col(*c)));

    let joined = dem
        .lazy()
        .select(attr_cols)
        .unique_stable(Some(vec!["id".into()]), UniqueKeepStrategy::First)
        .join(mean_alt, [col("id")], [col("id")], JoinArgs::new(JoinType::Left))
        .with_columns([
            ((col("left") + col("right")) * lit(0.5)).alias("center_x"),
            ((col("bottom") + col("top")) * lit(0.5)).alias("center_y"),
        ])
        .sort(["id"], SortMultipleOptions::default())
        .collect()
        .context("Failed to aggregate elevation samples")?;

    let geometry = wkt_boxes(&joined)?;
    let mut with_geometry = joined;
    with_geometry
        .with_column(geometry)
        .context("Failed to attach geometry column")?;

    let mut final_cols: Vec<Expr> =
        vec![col("id").cast(DataType::Int64), col("mean_altitude")];
    final_cols.extend(REGION_COLUMNS.iter().map(|c| col(*c)));
    final_cols.extend([col("center_x"), col("center_y"), col("geometry")]);

    let out = with_geometry
        .lazy()
        .select(final_cols)
        .collect()
        .context("Failed to select grid output columns")?;
    Ok(out)
}

/// Axis-aligned rectangle WKT for every row's bounding box.
fn wkt_boxes(df: &DataFrame) -> Result<Series> {
    let left = df.column("left")?.f64()?;
    let bottom = df.column("bottom")?.f64()?;
    let right = df.column("right")?.f64()?;
    let top = df.column("top")?.f64()?;

    let mut wkt = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        match (left.get(idx), bottom.get(idx), right.get(idx), top.get(idx)) {
            (Some(l), Some(b), Some(r), Some(t)) => wkt.push(format!(
                "POLYGON (({l} {b}, {r} {b}, {r} {t}, {l} {t}, {l} {b}))"
            )),
            _ => {
                return Err(PipelineError::MissingInput {
                    stage: "aggregate_elevation",
                    input: format!("bounding-box fields are null at row {}", idx),
                }
                .into())
            }
        }
    }
    Ok(Series::new("geometry".into(), wkt))
}

fn warn_on_bbox_disagreement(dem: &DataFrame) -> Result<()> {
    let disagreeing = dem
        .clone()
        .lazy()
        .group_by([col("id")])
        .agg([
            col("left").n_unique().alias("n_left"),
            col("bottom").n_unique().alias("n_bottom"),
            col("right").n_unique().alias("n_right"),
            col("top").n_unique().alias("n_top"),
        ])
        .filter(
            col("n_left")
                .gt(lit(1))
                .or(col("n_bottom").gt(lit(1)))
                .or(col("n_right").gt(lit(1)))
                .or(col("n_top").gt(lit(1))),
        )
        .collect()
        .context("Failed to check bounding-box consistency")?;
    if disagreeing.height() > 0 {
        warn!(
            "{} grid cell(s) carry disagreeing bounding boxes across altitude samples; \
             keeping each cell's first sample",
            disagreeing.height()
        );
    }
    Ok(())
}
