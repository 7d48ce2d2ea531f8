//! Reading inputs from disk and writing run results.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};
use ndarray::{ArrayD, IxDyn};
use serde::Deserialize;
use tracing::{debug, info};

use patchwise_core::controller::RunOutput;
use patchwise_core::reconstruct::{OutputValue, PatchRows};
use patchwise_core::volume::ImageVolume;

/// Loads a 2-D image as a single-slice, single-frame volume. Sample values keep
/// their native range (0..255 for 8-bit, 0..65535 for 16-bit).
pub fn load_image(path: &Path) -> Result<ImageVolume> {
    let img = image::open(path).with_context(|| format!("failed to open image: {}", path.display()))?;
    let (width, height) = img.dimensions();
    let (width, height) = (width as usize, height as usize);

    let (channels, samples): (usize, Vec<f32>) = match &img {
        DynamicImage::ImageLuma8(buf) => (1, buf.as_raw().iter().map(|&v| f32::from(v)).collect()),
        DynamicImage::ImageLuma16(buf) => (1, buf.as_raw().iter().map(|&v| f32::from(v)).collect()),
        DynamicImage::ImageRgb8(buf) => (3, buf.as_raw().iter().map(|&v| f32::from(v)).collect()),
        DynamicImage::ImageRgb16(buf) => (3, buf.as_raw().iter().map(|&v| f32::from(v)).collect()),
        DynamicImage::ImageRgb32F(buf) => (3, buf.as_raw().clone()),
        other => (4, other.to_rgba32f().into_raw()),
    };

    let volume = ImageVolume::from_fn([width, height, channels, 1, 1], |[x, y, c, _, _]| {
        samples[(y * width + x) * channels + c]
    });
    let title = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());

    debug!(path = %path.display(), size = %volume.size_label(), "Loaded image");
    Ok(volume.with_title(title))
}

#[derive(Debug, Deserialize)]
struct ParameterFile {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Reads a parameter tensor stored as `{ "shape": [...], "data": [...] }`.
pub fn load_parameter(path: &Path) -> Result<ArrayD<f32>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read parameter file: {}", path.display()))?;
    let file: ParameterFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse parameter file: {}", path.display()))?;
    let expected: usize = file.shape.iter().product();
    if expected != file.data.len() {
        bail!(
            "parameter file {} declares shape {:?} ({expected} values) but holds {} values",
            path.display(),
            file.shape,
            file.data.len()
        );
    }
    ArrayD::from_shape_vec(IxDyn(&file.shape), file.data)
        .with_context(|| format!("invalid parameter shape in {}", path.display()))
}

/// Splits a `NAME=FILE` argument.
pub fn parse_param_arg(arg: &str) -> Result<(String, PathBuf)> {
    let (name, file) = arg
        .split_once('=')
        .with_context(|| format!("invalid --param '{arg}' (expected NAME=FILE.json)"))?;
    if name.trim().is_empty() || file.trim().is_empty() {
        bail!("invalid --param '{arg}' (expected NAME=FILE.json)");
    }
    Ok((name.trim().to_string(), PathBuf::from(file.trim())))
}

/// Writes every output plus `report.json`; returns the written paths.
pub fn write_outputs(dir: &Path, output: &RunOutput) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory: {}", dir.display()))?;

    let mut names: Vec<&String> = output.outputs.keys().collect();
    names.sort();

    let mut written = Vec::new();
    for name in names {
        match &output.outputs[name] {
            OutputValue::Image(volume) => written.extend(write_volume_pngs(dir, name, volume)?),
            OutputValue::Rows(tables) => {
                let path = dir.join(format!("{}.csv", file_stem(name)));
                fs::write(&path, rows_to_csv(tables))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                written.push(path);
            }
        }
    }

    let report_path = dir.join("report.json");
    let report = serde_json::to_string_pretty(&output.report).context("failed to encode run report")?;
    fs::write(&report_path, report)
        .with_context(|| format!("failed to write {}", report_path.display()))?;
    written.push(report_path);

    for path in &written {
        info!(path = %path.display(), "Wrote output");
    }
    Ok(written)
}

/// One 16-bit grayscale PNG per channel, slice and frame, scaled by the
/// volume-wide minimum and maximum so slices stay comparable.
fn write_volume_pngs(dir: &Path, name: &str, volume: &ImageVolume) -> Result<Vec<PathBuf>> {
    let [width, height, channels, depth, frames] = volume.dims();
    let (lo, hi) = value_range(volume);
    let data = volume.data();
    let stem = file_stem(name);

    let mut written = Vec::with_capacity(channels * depth * frames);
    for t in 0..frames {
        for z in 0..depth {
            for c in 0..channels {
                let slice: ImageBuffer<Luma<u16>, Vec<u16>> =
                    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                        Luma([to_u16(data[[x as usize, y as usize, c, z, t]], lo, hi)])
                    });
                let path = dir.join(format!("{stem}_c{c}_z{z}_t{t}.png"));
                slice
                    .save(&path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                written.push(path);
            }
        }
    }
    Ok(written)
}

fn value_range(volume: &ImageVolume) -> (f32, f32) {
    volume
        .data()
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

fn to_u16(value: f32, lo: f32, hi: f32) -> u16 {
    if !value.is_finite() || hi <= lo {
        return 0;
    }
    let scaled = (value - lo) / (hi - lo) * f32::from(u16::MAX);
    scaled.round().clamp(0.0, f32::from(u16::MAX)) as u16
}

fn rows_to_csv(tables: &[PatchRows]) -> String {
    let columns = tables
        .iter()
        .flat_map(|table| table.rows.iter().map(Vec::len))
        .max()
        .unwrap_or(0);

    let mut csv = String::from("patch");
    for column in 0..columns {
        let _ = write!(csv, ",col{column}");
    }
    csv.push('\n');

    for table in tables {
        for row in &table.rows {
            let _ = write!(csv, "{}", table.patch_index);
            for value in row {
                let _ = write!(csv, ",{value}");
            }
            csv.push('\n');
        }
    }
    csv
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use patchwise_core::controller::RunReport;
    use patchwise_core::model_spec::{ModelSpec, RunOptions, TensorKind, TensorSpec};
    use patchwise_core::planner::PatchPlanner;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn gray16_png_loads_with_native_values() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cells.png");
        let source: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(3, 2, |x, y| Luma([(x * 1000 + y) as u16]));
        source.save(&path).expect("write png");

        let volume = load_image(&path).expect("load");
        assert_eq!(volume.dims(), [3, 2, 1, 1, 1]);
        assert_eq!(volume.title(), "cells.png");
        assert_eq!(volume.data()[[2, 1, 0, 0, 0]], 2001.0);
    }

    #[test]
    fn parameter_file_shape_must_match_data() {
        let dir = tempdir().expect("tempdir");
        let good = dir.path().join("good.json");
        fs::write(&good, r#"{"shape": [2, 2], "data": [1, 2, 3, 4]}"#).expect("write");
        let tensor = load_parameter(&good).expect("load");
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor[[1, 0]], 3.0);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, r#"{"shape": [3], "data": [1, 2]}"#).expect("write");
        let err = load_parameter(&bad).expect_err("length mismatch");
        assert!(err.to_string().contains("holds 2 values"));
    }

    #[test]
    fn param_args_need_name_and_file() {
        let (name, file) = parse_param_arg("threshold=thr.json").expect("parse");
        assert_eq!(name, "threshold");
        assert_eq!(file, PathBuf::from("thr.json"));
        assert!(parse_param_arg("threshold").is_err());
        assert!(parse_param_arg("=thr.json").is_err());
    }

    #[test]
    fn normalisation_spans_full_u16_range() {
        assert_eq!(to_u16(2.0, 2.0, 4.0), 0);
        assert_eq!(to_u16(4.0, 2.0, 4.0), u16::MAX);
        assert_eq!(to_u16(3.0, 3.0, 3.0), 0);
        assert_eq!(to_u16(f32::NAN, 0.0, 1.0), 0);
    }

    #[test]
    fn csv_tags_rows_with_patch_index() {
        let tables = vec![
            PatchRows {
                patch_index: 1,
                rows: vec![vec![1.5, 2.0]],
            },
            PatchRows {
                patch_index: 2,
                rows: vec![vec![3.0], vec![4.0, 5.0]],
            },
        ];
        assert_eq!(
            rows_to_csv(&tables),
            "patch,col0,col1\n1,1.5,2\n2,3\n2,4,5\n"
        );
    }

    #[test]
    fn outputs_are_written_per_slice_with_report() {
        let model = ModelSpec {
            name: "seg".to_string(),
            inputs: vec![TensorSpec::new("image", TensorKind::Image, "XYC")
                .expect("layout")
                .with_patch(vec![4, 4, 1])],
            outputs: vec![TensorSpec::new("mask", TensorKind::Image, "XYC").expect("layout")],
        };
        let plan = PatchPlanner::new(&model, RunOptions::default())
            .plan([4, 4, 2, 1])
            .expect("plan");
        let mask = ImageVolume::from_fn([4, 4, 2, 1, 1], |[x, _, c, _, _]| (x + c) as f32);
        let output = RunOutput {
            outputs: HashMap::from([("mask".to_string(), OutputValue::Image(mask))]),
            report: RunReport {
                model: "seg".to_string(),
                image: "cells.png".to_string(),
                input_size: "4x4x2x1x1".to_string(),
                pixel_size: "1x1x1 pixel".to_string(),
                total_patches: plan.total_patches(),
                grid: plan.grid(),
                plan,
                runtime_secs: 0.1,
                peak_memory_bytes: 256,
            },
        };

        let dir = tempdir().expect("tempdir");
        let written = write_outputs(dir.path(), &output).expect("write");
        assert_eq!(written.len(), 3);
        assert!(dir.path().join("mask_c0_z0_t0.png").is_file());
        assert!(dir.path().join("mask_c1_z0_t0.png").is_file());

        let report: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("report.json")).expect("read report"),
        )
        .expect("parse report");
        assert_eq!(report["total_patches"], 1);
        assert_eq!(report["peak_memory_bytes"], 256);
        assert_eq!(report["plan"]["width"]["axis"], "X");
    }
}
