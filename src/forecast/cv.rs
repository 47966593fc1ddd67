use anyhow::Result;
use std::ops::Range;

use crate::error::PipelineError;

/// One expanding-window fold: training indices always precede test indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Range<usize>,
    pub test: Range<usize>,
}

/// Time-ordered cross-validation splitter with the same fold geometry as
/// scikit-learn's TimeSeriesSplit: the test size is n / (k + 1) and the
/// division remainder goes to the first training window.
#[derive(Debug, Clone)]
pub struct TimeSeriesSplit {
    n_splits: usize,
}

impl TimeSeriesSplit {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }

    pub fn split(&self, n_samples: usize) -> Result<Vec<Fold>> {
        if n_samples < self.n_splits + 1 {
            return Err(PipelineError::MissingInput {
                stage: "time_series_split",
                input: format!(
                    "{} samples cannot support {} expanding folds",
                    n_samples, self.n_splits
                ),
            }
            .into());
        }
        let test_size = n_samples / (self.n_splits + 1);
        let mut folds = Vec::with_capacity(self.n_splits);
        for k in 0..self.n_splits {
            let test_start = n_samples - (self.n_splits - k) * test_size;
            folds.push(Fold {
                train: 0..test_start,
                test: test_start..test_start + test_size,
            });
        }
        Ok(folds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_are_strictly_time_ordered() {
        let folds = TimeSeriesSplit::new(5).split(100).unwrap();
        assert_eq!(folds.len(), 5);
        for fold in &folds {
            assert!(!fold.train.is_empty());
            assert!(!fold.test.is_empty());
            // every train index precedes every test index
            assert!(fold.train.end <= fold.test.start);
        }
    }

    #[test]
    fn training_windows_expand_and_tests_tile_the_tail() {
        let folds = TimeSeriesSplit::new(5).split(100).unwrap();
        // 100 / 6 = 16 test samples per fold, remainder in the first train set
        for (k, fold) in folds.iter().enumerate() {
            assert_eq!(fold.test.len(), 16);
            assert_eq!(fold.train.len(), 20 + 16 * k);
            if k > 0 {
                assert_eq!(fold.test.start, folds[k - 1].test.end);
            }
        }
        assert_eq!(folds.last().unwrap().test.end, 100);
    }

    #[test]
    fn too_few_samples_are_rejected() {
        assert!(TimeSeriesSplit::new(5).split(5).is_err());
        assert!(TimeSeriesSplit::new(5).split(6).is_ok());
    }
}
