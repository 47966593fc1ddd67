/// Pixel-level regression metrics over flattened predictions. `mape` keeps
/// the original process's definition: mean absolute error scaled by 100, not
/// a true percentage error.
pub fn mean_squared_error(truth: &[f32], predicted: &[f32]) -> f64 {
    debug_assert_eq!(truth.len(), predicted.len());
    if truth.is_empty() {
        return 0.0;
    }
    let sum: f64 = truth
        .iter()
        .zip(predicted)
        .map(|(&t, &p)| {
            let d = (t - p) as f64;
            d * d
        })
        .sum();
    sum / truth.len() as f64
}

pub fn mean_absolute_error(truth: &[f32], predicted: &[f32]) -> f64 {
    debug_assert_eq!(truth.len(), predicted.len());
    if truth.is_empty() {
        return 0.0;
    }
    let sum: f64 = truth
        .iter()
        .zip(predicted)
        .map(|(&t, &p)| ((t - p) as f64).abs())
        .sum();
    sum / truth.len() as f64
}

pub fn mape(truth: &[f32], predicted: &[f32]) -> f64 {
    mean_absolute_error(truth, predicted) * 100.0
}
