//! Expanding-window cross-validated training: each fold trains a fresh
//! network with Adam on minibatches in time order, then scores the held-out
//! tail with pixel-level regression metrics.

use anyhow::Result;
use ndarray::{Array3, ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::info;

use crate::config::ForecastConfig;
use crate::error::PipelineError;
use crate::forecast::cv::{Fold, TimeSeriesSplit};
use crate::forecast::metrics::{mape, mean_absolute_error, mean_squared_error};
use crate::forecast::model::{ConvLstmNet, NetGrads};
use crate::forecast::sequences::WindowSet;

/// Adam with bias correction; moment buffers are allocated lazily on the
/// first step, one pair per parameter array.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    moments: Vec<(ArrayD<f32>, ArrayD<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            t: 0,
            moments: Vec::new(),
        }
    }

    /// `params` and `grads` must be index-aligned and shape-aligned.
    pub fn step(&mut self, mut params: Vec<ArrayViewMutD<f32>>, grads: &[ArrayViewD<f32>]) {
        if self.moments.is_empty() {
            self.moments = grads
                .iter()
                .map(|g| (ArrayD::zeros(g.raw_dim()), ArrayD::zeros(g.raw_dim())))
                .collect();
        }
        self.t += 1;
        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.eps);
        let bias1 = 1.0 - b1.powi(self.t);
        let bias2 = 1.0 - b2.powi(self.t);
        for ((p, g), (m, v)) in params.iter_mut().zip(grads).zip(self.moments.iter_mut()) {
            Zip::from(&mut *p)
                .and(g)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

/// Mean squared error over all pixels of one frame, plus its gradient.
pub fn mse_loss_and_grad(output: &Array3<f32>, target: &Array3<f32>) -> (f64, Array3<f32>) {
    let n = output.len() as f32;
    let diff = output - target;
    let loss = diff.mapv(|d| d as f64 * d as f64).sum() / n as f64;
    let grad = diff.mapv(|d| 2.0 * d / n);
    (loss, grad)
}

#[derive(Debug, Serialize)]
pub struct FoldResult {
    pub fold: usize,
    pub train_windows: usize,
    pub test_windows: usize,
    pub mse: f64,
    pub mae: f64,
    pub mape: f64,
}

#[derive(Debug, Serialize)]
pub struct CvReport {
    pub folds: Vec<FoldResult>,
    pub mean_mse: f64,
    pub mean_mape: f64,
}

pub struct CvOutcome {
    pub report: CvReport,
    /// Ground truth and prediction of the last test window of the last fold,
    /// kept for the comparison image.
    pub last_example: Option<(Array3<f32>, Array3<f32>)>,
}

pub fn run_cross_validation(config: &ForecastConfig, windows: &WindowSet) -> Result<CvOutcome> {
    let folds = TimeSeriesSplit::new(config.n_splits).split(windows.len())?;
    let mut results = Vec::with_capacity(folds.len());
    let mut last_example = None;

    for (k, fold) in folds.iter().enumerate() {
        info!(
            "Fold {}/{}: {} train windows, {} test windows",
            k + 1,
            folds.len(),
            fold.train.len(),
            fold.test.len()
        );
        let (result, example) =
            train_fold(config, windows, k, fold).map_err(|source| PipelineError::Fold {
                fold: k,
                source,
            })?;
        info!(
            "Fold {} scores: mse {:.6}, mae {:.6}, mape {:.4}",
            k + 1,
            result.mse,
            result.mae,
            result.mape
        );
        results.push(result);
        last_example = Some(example);
    }

    let mean_mse = results.iter().map(|r| r.mse).sum::<f64>() / results.len() as f64;
    let mean_mape = results.iter().map(|r| r.mape).sum::<f64>() / results.len() as f64;
    Ok(CvOutcome {
        report: CvReport {
            folds: results,
            mean_mse,
            mean_mape,
        },
        last_example,
    })
}

fn train_fold(
    config: &ForecastConfig,
    windows: &WindowSet,
    k: usize,
    fold: &Fold,
) -> Result<(FoldResult, (Array3<f32>, Array3<f32>))> {
    let mut rng = StdRng::seed_from_u64(config.seed + k as u64);
    let mut net = ConvLstmNet::new(
        &config.model,
        config.height,
        config.width,
        config.channels,
        &mut rng,
    );
    let mut optimizer = Adam::new(config.learning_rate);

    let train_idx: Vec<usize> = fold.train.clone().collect();
    for epoch in 0..config.epochs {
        let mut epoch_loss = 0.0f64;
        let mut batches = 0usize;
        for batch in train_idx.chunks(config.batch_size) {
            let mut grads = NetGrads::zeros_like(&net);
            let mut batch_loss = 0.0f64;
            for &i in batch {
                let cache = net.forward_train(&windows.inputs[i], &mut rng)?;
                let (loss, dout) = mse_loss_and_grad(&cache.output, &windows.targets[i]);
                batch_loss += loss;
                net.backward(&cache, &dout, &mut grads)?;
            }
            grads.scale(1.0 / batch.len() as f32);
            optimizer.step(net.param_views_mut(), &grads.views());
            epoch_loss += batch_loss / batch.len() as f64;
            batches += 1;
        }
        info!(
            "Fold {} epoch {}/{}: loss {:.6}",
            k + 1,
            epoch + 1,
            config.epochs,
            epoch_loss / batches.max(1) as f64
        );
    }

    let mut truth_pixels = Vec::new();
    let mut predicted_pixels = Vec::new();
    let mut example = None;
    for i in fold.test.clone() {
        let prediction = net.predict(&windows.inputs[i])?;
        truth_pixels.extend(windows.targets[i].iter().copied());
        predicted_pixels.extend(prediction.iter().copied());
        example = Some((windows.targets[i].clone(), prediction));
    }
    let example = example.ok_or(PipelineError::MissingInput {
        stage: "train_fold",
        input: format!("fold {} has an empty test window", k),
    })?;

    Ok((
        FoldResult {
            fold: k,
            train_windows: fold.train.len(),
            test_windows: fold.test.len(),
            mse: mean_squared_error(&truth_pixels, &predicted_pixels),
            mae: mean_absolute_error(&truth_pixels, &predicted_pixels),
            mape: mape(&truth_pixels, &predicted_pixels),
        },
        example,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::forecast::sequences::make_windows;
    use approx::assert_abs_diff_eq;
    use ndarray::IxDyn;
    use std::path::PathBuf;

    #[test]
    fn adam_moves_parameters_against_the_gradient() {
        let mut p = ArrayD::from_elem(IxDyn(&[3]), 1.0f32);
        let g = ArrayD::from_elem(IxDyn(&[3]), 0.5f32);
        let mut optimizer = Adam::new(0.1);
        optimizer.step(vec![p.view_mut()], &[g.view()]);
        // first bias-corrected step is essentially lr * sign(g)
        for &v in p.iter() {
            assert_abs_diff_eq!(v, 0.9, epsilon = 1e-3);
        }
        optimizer.step(vec![p.view_mut()], &[g.view()]);
        assert!(p.iter().all(|&v| v < 0.9));
    }

    #[test]
    fn mse_loss_and_grad_on_known_values() {
        let output = Array3::from_elem((1, 2, 1), 0.75f32);
        let target = Array3::from_elem((1, 2, 1), 0.25f32);
        let (loss, grad) = mse_loss_and_grad(&output, &target);
        assert_abs_diff_eq!(loss, 0.25, epsilon = 1e-9);
        assert_abs_diff_eq!(grad[[0, 0, 0]], 2.0 * 0.5 / 2.0, epsilon = 1e-6);
    }

    fn tiny_forecast_config() -> ForecastConfig {
        ForecastConfig {
            image_dir: PathBuf::new(),
            sequence_length: 1,
            width: 4,
            height: 4,
            channels: 1,
            n_splits: 2,
            epochs: 1,
            batch_size: 2,
            learning_rate: 1e-3,
            seed: 3,
            model: ModelConfig {
                filters: [2, 2, 2],
                kernels: [3, 3, 3],
                recurrent_dropout: [0.2, 0.2],
                dense_units: [8, 4],
                dense_dropout: 0.2,
            },
            ..ForecastConfig::default()
        }
    }

    #[test]
    fn cross_validation_scores_every_fold() {
        let frames: Vec<_> = (0..8)
            .map(|v| Array3::from_elem((4, 4, 1), v as f32 / 8.0))
            .collect();
        let windows = make_windows(&frames, 1).unwrap();
        assert_eq!(windows.len(), 7);

        let outcome = run_cross_validation(&tiny_forecast_config(), &windows).unwrap();
        assert_eq!(outcome.report.folds.len(), 2);
        for fold in &outcome.report.folds {
            assert!(fold.mse.is_finite());
            assert!(fold.mape >= 0.0);
            assert_eq!(fold.test_windows, 2);
        }
        assert!(outcome.report.mean_mse.is_finite());

        let (truth, prediction) = outcome.last_example.unwrap();
        assert_eq!(truth.dim(), (4, 4, 1));
        assert_eq!(prediction.dim(), (4, 4, 1));
        // last fold's last test target is the final frame
        assert_abs_diff_eq!(truth[[0, 0, 0]], 7.0 / 8.0, epsilon = 1e-6);
    }

    #[test]
    fn too_few_windows_surface_as_an_error() {
        let frames: Vec<_> = (0..3)
            .map(|v| Array3::from_elem((4, 4, 1), v as f32))
            .collect();
        let windows = make_windows(&frames, 1).unwrap();
        assert!(run_cross_validation(&tiny_forecast_config(), &windows).is_err());
    }
}
