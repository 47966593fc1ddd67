use anyhow::Result;
use ndarray::{Array3, Array4, Axis};

use crate::error::PipelineError;

/// Sliding-window training set: `inputs[i]` holds frames[i..i+L) stacked on
/// a leading time axis, `targets[i]` is frame[i+L]. The two vectors are
/// index-aligned and max(0, N-L) long.
pub struct WindowSet {
    pub inputs: Vec<Array4<f32>>,
    pub targets: Vec<Array3<f32>>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

pub fn make_windows(frames: &[Array3<f32>], sequence_length: usize) -> Result<WindowSet> {
    if let Some(first) = frames.first() {
        let dim = first.dim();
        if let Some(pos) = frames.iter().position(|f| f.dim() != dim) {
            return Err(PipelineError::MissingInput {
                stage: "make_windows",
                input: format!(
                    "frame {} has shape {:?}, expected {:?}",
                    pos,
                    frames[pos].dim(),
                    dim
                ),
            }
            .into());
        }
    }

    let count = frames.len().saturating_sub(sequence_length);
    let mut inputs = Vec::with_capacity(count);
    let mut targets = Vec::with_capacity(count);
    for i in 0..count {
        let (h, w, c) = frames[i].dim();
        let mut window = Array4::<f32>::zeros((sequence_length, h, w, c));
        for (t, frame) in frames[i..i + sequence_length].iter().enumerate() {
            window.index_axis_mut(Axis(0), t).assign(frame);
        }
        inputs.push(window);
        targets.push(frames[i + sequence_length].clone());
    }
    Ok(WindowSet { inputs, targets })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: f32) -> Array3<f32> {
        Array3::from_elem((2, 2, 1), value)
    }

    #[test]
    fn seven_frames_window_five_gives_two_pairs() {
        let frames: Vec<_> = (0..7).map(|v| frame(v as f32)).collect();
        let set = make_windows(&frames, 5).unwrap();
        assert_eq!(set.len(), 2);
        // pair 0 target = frame 5, pair 1 target = frame 6
        assert_eq!(set.targets[0][[0, 0, 0]], 5.0);
        assert_eq!(set.targets[1][[0, 0, 0]], 6.0);
        // pair 1 input covers frames 1..6
        for t in 0..5 {
            assert_eq!(set.inputs[1][[t, 0, 0, 0]], (t + 1) as f32);
        }
    }

    #[test]
    fn too_few_frames_give_no_pairs() {
        let frames: Vec<_> = (0..5).map(|v| frame(v as f32)).collect();
        assert!(make_windows(&frames, 5).unwrap().is_empty());
        assert!(make_windows(&[], 5).unwrap().is_empty());
    }

    #[test]
    fn mismatched_frame_shapes_are_rejected() {
        let frames = vec![frame(0.0), Array3::zeros((3, 2, 1))];
        assert!(make_windows(&frames, 1).is_err());
    }
}
