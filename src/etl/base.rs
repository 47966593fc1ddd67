use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;

use crate::error::PipelineError;

// Days between 0001-01-01 (CE) and 1970-01-01, for the polars Date dtype.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Every month-start date from `start` through `end`, both inclusive. Day
/// components are ignored; the axis always begins on the first of the month.
pub fn month_starts(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    while let Some(date) = NaiveDate::from_ymd_opt(year, month, 1) {
        if date > end {
            break;
        }
        out.push(date);
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

/// Cross join the monthly time axis with the grid table: one row per
/// (grid cell, month), carrying `date`, `year` and `month`.
pub fn build_base(grid: DataFrame, start: NaiveDate, end: NaiveDate) -> Result<DataFrame> {
    let months = month_starts(start, end);
    if months.is_empty() {
        return Err(PipelineError::MissingInput {
            stage: "build_base",
            input: format!("no month starts between {} and {}", start, end),
        }
        .into());
    }
    if grid.height() == 0 {
        return Err(PipelineError::MissingInput {
            stage: "build_base",
            input: "grid table is empty".to_string(),
        }
        .into());
    }

    let epoch_days: Vec<i32> = months
        .iter()
        .map(|d| d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
        .collect();
    let years: Vec<i32> = months.iter().map(|d| d.year()).collect();
    let month_numbers: Vec<i32> = months.iter().map(|d| d.month() as i32).collect();

    let date_column = Series::new("date".into(), epoch_days)
        .cast(&DataType::Date)
        .context("Failed to build the date column")?;
    let axis = DataFrame::new(vec![
        date_column.into(),
        Series::new("year".into(), years).into(),
        Series::new("month".into(), month_numbers).into(),
    ])?;

    let grid_columns: Vec<Expr> = grid
        .get_column_names_str()
        .iter()
        .map(|name| col(*name))
        .collect();
    let mut ordered: Vec<Expr> = grid_columns;
    ordered.extend([col("date"), col("year"), col("month")]);

    let base = axis
        .lazy()
        .cross_join(grid.lazy(), None)
        .select(ordered)
        .collect()
        .context("Failed to cross join the time axis with the grid")?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn full_range_has_217_months() {
        let months = month_starts(ymd(2006, 1, 1), ymd(2024, 1, 1));
        assert_eq!(months.len(), 217);
        assert_eq!(months[0], ymd(2006, 1, 1));
        assert_eq!(months[216], ymd(2024, 1, 1));
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let months = month_starts(ymd(2020, 11, 1), ymd(2021, 2, 1));
        assert_eq!(
            months,
            vec![ymd(2020, 11, 1), ymd(2020, 12, 1), ymd(2021, 1, 1), ymd(2021, 2, 1)]
        );
    }

    #[test]
    fn base_row_count_is_cells_times_months() {
        let grid = df![
            "id" => [1i64, 2, 3],
            "mean_altitude" => [10.0f64, 20.0, 30.0],
        ]
        .unwrap();
        let base = build_base(grid, ymd(2006, 1, 1), ymd(2024, 1, 1)).unwrap();
        assert_eq!(base.height(), 3 * 217);
        assert_eq!(
            base.get_column_names_str(),
            vec!["id", "mean_altitude", "date", "year", "month"]
        );
    }

    #[test]
    fn year_and_month_match_the_axis() {
        let grid = df!["id" => [1i64]].unwrap();
        let base = build_base(grid, ymd(2023, 11, 1), ymd(2024, 1, 1)).unwrap();
        let years: Vec<i32> = base.column("year").unwrap().i32().unwrap().into_no_null_iter().collect();
        let months: Vec<i32> = base.column("month").unwrap().i32().unwrap().into_no_null_iter().collect();
        assert_eq!(years, vec![2023, 2023, 2024]);
        assert_eq!(months, vec![11, 12, 1]);
    }

    #[test]
    fn empty_grid_is_a_typed_failure() {
        let grid = DataFrame::new(vec![Series::new("id".into(), Vec::<i64>::new()).into()]).unwrap();
        assert!(build_base(grid, ymd(2006, 1, 1), ymd(2006, 3, 1)).is_err());
    }
}
