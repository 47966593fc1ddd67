use anyhow::{Context, Result};
use image::imageops::FilterType;
use ndarray::Array3;
use std::path::Path;
use tracing::{info, warn};

use crate::config::ForecastConfig;
use crate::error::PipelineError;

/// Frames loaded for the configured month span. Missing months are counted
/// and skipped, so `frames` is dense: index does NOT map onto the calendar
/// when `missing > 0`.
pub struct LoadedSequence {
    pub frames: Vec<Array3<f32>>,
    pub missing: usize,
    pub requested: usize,
}

/// Every (year, month) the loader will request, replicating the original
/// span logic: the first year starts at `start_month`, the last year stops
/// at `end_month`, all years in between run January through December.
pub fn month_span(
    start_year: i32,
    start_month: u32,
    end_year: i32,
    end_month: u32,
) -> Vec<(i32, u32)> {
    let mut out = Vec::new();
    for year in start_year..=end_year {
        let first = if year == start_year { start_month } else { 1 };
        let last = if year == end_year { end_month } else { 12 };
        for month in first..=last {
            out.push((year, month));
        }
    }
    out
}

/// Load, resize and normalize every available monthly frame. A missing file
/// is an expected, counted, non-fatal event; a missing image directory is a
/// fatal configuration error raised by `ForecastConfig::validate` before
/// this runs.
pub fn load_frames(config: &ForecastConfig) -> Result<LoadedSequence> {
    if !config.image_dir.is_dir() {
        return Err(PipelineError::MissingInput {
            stage: "load_frames",
            input: format!("image directory {:?}", config.image_dir),
        }
        .into());
    }

    let span = month_span(
        config.start_year,
        config.start_month,
        config.end_year,
        config.end_month,
    );
    let mut frames = Vec::with_capacity(span.len());
    let mut missing = 0usize;
    for (year, month) in &span {
        let filename = format!("chl_{}_{}.png", year, month);
        let path = config.image_dir.join(&filename);
        if !path.exists() {
            missing += 1;
            warn!("Missing: {}", filename);
            continue;
        }
        frames.push(load_frame(
            &path,
            config.width,
            config.height,
            config.channels,
        )?);
    }
    if missing > 0 {
        warn!("Total missing files: {}", missing);
    }
    info!("Loaded {} images out of {} requested.", frames.len(), span.len());

    Ok(LoadedSequence {
        frames,
        missing,
        requested: span.len(),
    })
}

/// Decode one raster, resize it to (width, height) and scale pixel values
/// into [0, 1]. Layout is (height, width, channels).
pub fn load_frame(path: &Path, width: usize, height: usize, channels: usize) -> Result<Array3<f32>> {
    let img = image::open(path).with_context(|| format!("Failed to decode image {:?}", path))?;
    let resized = img.resize_exact(width as u32, height as u32, FilterType::Triangle);
    let mut frame = Array3::<f32>::zeros((height, width, channels));
    match channels {
        1 => {
            let gray = resized.to_luma8();
            for (x, y, pixel) in gray.enumerate_pixels() {
                frame[[y as usize, x as usize, 0]] = pixel.0[0] as f32 / 255.0;
            }
        }
        _ => {
            let rgb = resized.to_rgb8();
            for (x, y, pixel) in rgb.enumerate_pixels() {
                for (c, &value) in pixel.0.iter().enumerate() {
                    frame[[y as usize, x as usize, c]] = value as f32 / 255.0;
                }
            }
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_png(dir: &Path, name: &str, value: u8) {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([value, value, value]));
        img.save(dir.join(name)).unwrap();
    }

    fn test_config(dir: PathBuf) -> ForecastConfig {
        ForecastConfig {
            image_dir: dir,
            start_year: 2006,
            end_year: 2006,
            start_month: 1,
            end_month: 5,
            width: 8,
            height: 8,
            channels: 3,
            ..ForecastConfig::default()
        }
    }

    #[test]
    fn span_honors_partial_first_and_last_years() {
        let span = month_span(2006, 11, 2008, 2);
        assert_eq!(span.len(), 2 + 12 + 2);
        assert_eq!(span[0], (2006, 11));
        assert_eq!(*span.last().unwrap(), (2008, 2));
    }

    #[test]
    fn full_default_span_is_216_months() {
        assert_eq!(month_span(2006, 1, 2023, 12).len(), 216);
    }

    #[test]
    fn counts_missing_and_compacts_gaps() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "chl_2006_1.png", 10);
        write_png(dir.path(), "chl_2006_2.png", 20);
        // month 3 missing
        write_png(dir.path(), "chl_2006_4.png", 40);
        write_png(dir.path(), "chl_2006_5.png", 50);

        let seq = load_frames(&test_config(dir.path().to_path_buf())).unwrap();
        assert_eq!(seq.requested, 5);
        assert_eq!(seq.missing, 1);
        assert_eq!(seq.frames.len(), seq.requested - seq.missing);
        // the gap is compacted: index 2 now holds April's frame
        let april = &seq.frames[2];
        assert!((april[[0, 0, 0]] - 40.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn frames_are_resized_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "chl_2006_1.png", 255);
        let frame = load_frame(&dir.path().join("chl_2006_1.png"), 8, 8, 3).unwrap();
        assert_eq!(frame.dim(), (8, 8, 3));
        assert!(frame.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!((frame[[3, 3, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn single_channel_frames_use_luma() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "chl_2006_1.png", 128);
        let frame = load_frame(&dir.path().join("chl_2006_1.png"), 4, 4, 1).unwrap();
        assert_eq!(frame.dim(), (4, 4, 1));
    }
}
