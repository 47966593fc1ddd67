use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use ndarray::Array3;
use std::path::Path;

use crate::error::PipelineError;

const GAP: usize = 4;

/// Render ground truth and prediction side by side into one PNG, truth on
/// the left, separated by a white gutter. Pixel values are clamped to [0, 1]
/// before quantization; single-channel frames render as gray.
pub fn save_comparison(
    truth: &Array3<f32>,
    prediction: &Array3<f32>,
    path: &Path,
) -> Result<()> {
    if truth.dim() != prediction.dim() {
        return Err(PipelineError::MissingInput {
            stage: "save_comparison",
            input: format!(
                "truth shape {:?} differs from prediction shape {:?}",
                truth.dim(),
                prediction.dim()
            ),
        }
        .into());
    }
    let (h, w, _) = truth.dim();
    let mut img = RgbImage::from_pixel((2 * w + GAP) as u32, h as u32, Rgb([255, 255, 255]));
    paint(&mut img, truth, 0);
    paint(&mut img, prediction, w + GAP);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    img.save(path)
        .with_context(|| format!("Failed to write comparison image {:?}", path))
}

fn paint(img: &mut RgbImage, frame: &Array3<f32>, x_offset: usize) {
    let (h, w, c) = frame.dim();
    let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    for y in 0..h {
        for x in 0..w {
            let pixel = if c == 1 {
                let g = quantize(frame[[y, x, 0]]);
                Rgb([g, g, g])
            } else {
                Rgb([
                    quantize(frame[[y, x, 0]]),
                    quantize(frame[[y, x, 1]]),
                    quantize(frame[[y, x, 2]]),
                ])
            };
            img.put_pixel((x_offset + x) as u32, y as u32, pixel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn writes_truth_left_and_prediction_right() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comparison.png");
        let truth = Array3::from_elem((4, 4, 3), 0.0f32);
        let prediction = Array3::from_elem((4, 4, 3), 1.0f32);
        save_comparison(&truth, &prediction, &path).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.dimensions(), ((2 * 4 + GAP) as u32, 4));
        assert_eq!(img.to_rgb8().get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.to_rgb8().get_pixel((4 + GAP) as u32, 0).0, [255, 255, 255]);
    }

    #[test]
    fn grayscale_frames_render_as_gray() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        let frame = Array3::from_elem((2, 2, 1), 0.5f32);
        save_comparison(&frame, &frame, &path).unwrap();
        let img = image::open(&path).unwrap().to_rgb8();
        let px = img.get_pixel(0, 0).0;
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let truth = Array3::zeros((2, 2, 1));
        let prediction = Array3::zeros((3, 2, 1));
        assert!(save_comparison(&truth, &prediction, &dir.path().join("x.png")).is_err());
    }
}
