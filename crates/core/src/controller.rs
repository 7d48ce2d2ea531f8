//! Drives one tiled run: plan, mirror, then extract, infer and stitch every patch.

use std::collections::HashMap;
use std::time::Instant;

use ndarray::ArrayD;
use serde::Serialize;
use tracing::{debug, error, info, trace};

use crate::error::{ConfigError, TilingError, TilingResult};
use crate::extract::extract_patch;
use crate::inference::{PatchInference, TensorMap};
use crate::logging::track_active_run;
use crate::mirror::mirror_volume;
use crate::model_spec::{ModelSpec, RunOptions, TensorKind};
use crate::planner::{PatchPlan, PatchPlanner};
use crate::progress::{RunHandle, RunPhase};
use crate::reconstruct::{results_byte_size, OutputValue, PatchReconstructor};
use crate::volume::{array_byte_size, volume_to_tensor, ImageVolume};

/// A value supplied for one declared input.
#[derive(Debug, Clone)]
pub enum InputValue {
    Image(ImageVolume),
    /// Fed unchanged with every patch.
    Tensor(ArrayD<f32>),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model: String,
    pub image: String,
    pub input_size: String,
    pub pixel_size: String,
    pub total_patches: usize,
    /// Patch counts along X, Y, C, Z.
    pub grid: [usize; 4],
    pub plan: PatchPlan,
    pub runtime_secs: f64,
    pub peak_memory_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outputs: HashMap<String, OutputValue>,
    pub report: RunReport,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunOutput),
    /// `at_patch` is the index that observed the request; earlier patches finished.
    Cancelled { at_patch: usize, completed: usize },
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn into_output(self) -> Option<RunOutput> {
        match self {
            Self::Completed(output) => Some(output),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Runs a model over an image patch by patch. One controller serves one run.
pub struct TilingController {
    model: ModelSpec,
    options: RunOptions,
    handle: RunHandle,
    consumed: bool,
}

impl TilingController {
    pub fn new(model: &ModelSpec, options: RunOptions) -> Self {
        Self {
            model: model.clone(),
            options,
            handle: RunHandle::new(),
            consumed: false,
        }
    }

    /// Observer and cancellation handle; clone it before calling [`Self::run`].
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn run<I>(
        &mut self,
        inputs: &HashMap<String, InputValue>,
        inference: &mut I,
    ) -> TilingResult<RunOutcome>
    where
        I: PatchInference + ?Sized,
    {
        if self.consumed {
            let err = TilingError::internal("tiling controller has already run");
            error!(kind = err.kind(), error = %err, "Tiled run rejected");
            return Err(err);
        }
        self.consumed = true;

        let result = self.drive(inputs, inference);
        match &result {
            Ok(RunOutcome::Completed(_)) => self.handle.set_phase(RunPhase::Done),
            Ok(RunOutcome::Cancelled { .. }) => self.handle.set_phase(RunPhase::Cancelled),
            Err(err) => {
                error!(
                    kind = err.kind(),
                    patch = self.handle.current_patch(),
                    error = %err,
                    "Tiled run failed"
                );
                self.handle.set_phase(RunPhase::Done);
            }
        }
        result
    }

    fn drive<I>(
        &self,
        inputs: &HashMap<String, InputValue>,
        inference: &mut I,
    ) -> TilingResult<RunOutcome>
    where
        I: PatchInference + ?Sized,
    {
        let handle = &self.handle;
        handle.set_phase(RunPhase::Planning);

        self.model.validate()?;
        let (image, mut feeds) = resolve_inputs(&self.model, inputs)?;
        let input_spec = self.model.image_input()?;
        let [nx, ny, nc, nz, _] = image.dims();
        let plan = PatchPlanner::new(&self.model, self.options).plan([nx, ny, nc, nz])?;
        let total = plan.total_patches();
        handle.start(total);
        let _crash_context = track_active_run(
            format!("{} on {}", self.model.name, display_title(image)),
            handle.clone(),
        );

        info!(
            model = %self.model.name,
            image = %image.title(),
            size = %image.size_label(),
            grid = ?plan.grid(),
            total,
            whole_image = plan.whole_image,
            "Starting tiled run"
        );

        handle.set_phase(RunPhase::Extending);
        let mirrored = mirror_volume(image, &plan.mirror_padding());
        let mut reconstructor = PatchReconstructor::new(&self.model, &plan, self.options, image)?;
        let parameter_bytes: u64 = feeds.values().map(array_byte_size).sum();
        let resident_bytes = mirrored.byte_size() + parameter_bytes;
        handle.record_memory(resident_bytes);
        debug!(
            mirrored = %mirrored.size_label(),
            bytes = resident_bytes,
            "Mirrored image ready"
        );

        let mut total_extract_ms = 0.0_f64;
        let mut total_infer_ms = 0.0_f64;
        let mut total_stitch_ms = 0.0_f64;

        for ix in 0..plan.width.count {
            for iy in 0..plan.height.count {
                for iz in 0..plan.depth.count {
                    let patch_index = handle.begin_patch();
                    handle.set_phase(RunPhase::Iterating);
                    if handle.is_cancelled() {
                        let completed = patch_index - 1;
                        info!(at_patch = patch_index, completed, total, "Tiled run cancelled");
                        return Ok(RunOutcome::Cancelled {
                            at_patch: patch_index,
                            completed,
                        });
                    }

                    let region = plan.region(ix, iy, iz);
                    let t_extract = Instant::now();
                    let patch = extract_patch(&mirrored, &plan, &region)?;
                    let patch_bytes = patch.byte_size();
                    feeds.insert(
                        input_spec.name.clone(),
                        volume_to_tensor(patch.data().view(), input_spec)?,
                    );
                    total_extract_ms += t_extract.elapsed().as_secs_f64() * 1000.0;

                    handle.set_phase(RunPhase::Inferring);
                    let t_infer = Instant::now();
                    let results = inference
                        .infer(&feeds)
                        .map_err(|source| TilingError::Inference {
                            patch: patch_index,
                            source,
                        })?;
                    total_infer_ms += t_infer.elapsed().as_secs_f64() * 1000.0;

                    handle.record_memory(
                        resident_bytes
                            + 2 * patch_bytes
                            + reconstructor.buffer_bytes()
                            + results_byte_size(&results),
                    );

                    handle.set_phase(RunPhase::Reconstructing);
                    let t_stitch = Instant::now();
                    reconstructor.accept(patch_index, &region, results)?;
                    total_stitch_ms += t_stitch.elapsed().as_secs_f64() * 1000.0;
                    handle.record_memory(resident_bytes + reconstructor.buffer_bytes());

                    trace!(patch = patch_index, total, ix, iy, iz, "Patch finished");
                }
            }
        }

        let outputs = reconstructor.finish()?;
        let report = RunReport {
            model: self.model.name.clone(),
            image: image.title().to_string(),
            input_size: image.size_label(),
            pixel_size: pixel_size_label(image),
            total_patches: total,
            grid: plan.grid(),
            plan,
            runtime_secs: handle.elapsed().as_secs_f64(),
            peak_memory_bytes: handle.peak_memory_bytes(),
        };

        let done = total.max(1) as f64;
        info!(
            patches = total,
            avg_extract_ms = format!("{:.1}", total_extract_ms / done),
            avg_infer_ms = format!("{:.1}", total_infer_ms / done),
            avg_stitch_ms = format!("{:.1}", total_stitch_ms / done),
            total_infer_ms = format!("{:.0}", total_infer_ms),
            peak_memory_bytes = report.peak_memory_bytes,
            runtime_secs = format!("{:.2}", report.runtime_secs),
            "Tiled run summary"
        );

        Ok(RunOutcome::Completed(RunOutput { outputs, report }))
    }
}

/// Matches supplied values to declared inputs. Returns the image and the
/// parameter feeds.
fn resolve_inputs<'a>(
    model: &ModelSpec,
    inputs: &'a HashMap<String, InputValue>,
) -> Result<(&'a ImageVolume, TensorMap), ConfigError> {
    let mut image = None;
    let mut feeds = TensorMap::new();

    for spec in &model.inputs {
        let value = inputs
            .get(&spec.name)
            .ok_or_else(|| ConfigError::MissingInput(spec.name.clone()))?;
        match (spec.kind, value) {
            (TensorKind::Image, InputValue::Image(volume)) => image = Some(volume),
            (TensorKind::Parameter, InputValue::Tensor(tensor)) => {
                feeds.insert(spec.name.clone(), tensor.clone());
            }
            (TensorKind::Image, _) => {
                return Err(ConfigError::WrongInputKind {
                    name: spec.name.clone(),
                    expected: "image",
                })
            }
            (_, _) => {
                return Err(ConfigError::WrongInputKind {
                    name: spec.name.clone(),
                    expected: "tensor",
                })
            }
        }
    }

    for name in inputs.keys() {
        if !model.inputs.iter().any(|spec| &spec.name == name) {
            debug!(input = %name, "Ignoring undeclared input");
        }
    }

    let image = image.ok_or(ConfigError::NoImageInput)?;
    Ok((image, feeds))
}

fn display_title(image: &ImageVolume) -> &str {
    if image.title().is_empty() {
        "image"
    } else {
        image.title()
    }
}

fn pixel_size_label(image: &ImageVolume) -> String {
    let calibration = image.calibration();
    format!(
        "{}x{}x{} {}",
        calibration.pixel_width, calibration.pixel_height, calibration.pixel_depth, calibration.unit
    )
}
