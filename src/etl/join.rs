use anyhow::{Context, Result};
use polars::prelude::*;

use crate::error::PipelineError;

const JOIN_KEY: [&str; 3] = ["id", "year", "month"];

/// Left-join the spatiotemporal base with the chlorophyll aggregate on
/// (id, year, month). The right side must be unique on the key; a duplicate
/// would silently fan out base rows, so it is rejected up front.
pub fn join_chlorophyll(base: DataFrame, chl: DataFrame) -> Result<DataFrame> {
    let distinct_keys = chl
        .clone()
        .lazy()
        .select(JOIN_KEY.map(col))
        .unique_stable(None, UniqueKeepStrategy::First)
        .collect()
        .context("Failed to check chlorophyll key uniqueness")?
        .height();
    if distinct_keys != chl.height() {
        return Err(PipelineError::JoinKeyNotUnique {
            duplicates: chl.height() - distinct_keys,
        }
        .into());
    }

    let joined = base
        .lazy()
        .join(
            chl.lazy(),
            JOIN_KEY.map(col),
            JOIN_KEY.map(col),
            JoinArgs::new(JoinType::Left),
        )
        .collect()
        .context("Failed to join the base with the chlorophyll aggregate")?;
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_two_months_three_cells() -> DataFrame {
        df![
            "id" => [1i64, 2, 3, 1, 2, 3],
            "year" => [2006i32, 2006, 2006, 2006, 2006, 2006],
            "month" => [1i32, 1, 1, 2, 2, 2],
        ]
        .unwrap()
    }

    #[test]
    fn left_join_preserves_base_rows_and_leaves_nulls() {
        // 3 cells x 2 months, one (cell, month) observation missing.
        let chl = df![
            "id" => [1i64, 2, 3, 1, 2],
            "year" => [2006i32, 2006, 2006, 2006, 2006],
            "month" => [1i32, 1, 1, 2, 2],
            "chl" => [0.1f64, 0.2, 0.3, 0.4, 0.5],
        ]
        .unwrap();
        let out = join_chlorophyll(base_two_months_three_cells(), chl).unwrap();
        assert_eq!(out.height(), 6);
        assert_eq!(out.column("chl").unwrap().null_count(), 1);
    }

    #[test]
    fn duplicate_right_keys_are_rejected() {
        let chl = df![
            "id" => [1i64, 1],
            "year" => [2006i32, 2006],
            "month" => [1i32, 1],
            "chl" => [0.1f64, 0.2],
        ]
        .unwrap();
        let err = join_chlorophyll(base_two_months_three_cells(), chl).unwrap_err();
        assert!(err.to_string().contains("not unique"));
    }

    #[test]
    fn unmatched_right_rows_are_ignored() {
        let chl = df![
            "id" => [99i64],
            "year" => [2030i32],
            "month" => [1i32],
            "chl" => [9.9f64],
        ]
        .unwrap();
        let out = join_chlorophyll(base_two_months_three_cells(), chl).unwrap();
        assert_eq!(out.height(), 6);
        assert_eq!(out.column("chl").unwrap().null_count(), 6);
    }
}
