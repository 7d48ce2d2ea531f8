//! ONNX Runtime sessions and the [`OrtInference`] patch adapter.
//!
//! [`build_session`] registers the requested execution providers; TensorRT
//! falls back to CUDA, and ORT itself falls back to CPU when CUDA is missing.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use half::f16;
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{Tensor, ValueType},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::inference::{InferenceError, PatchInference, TensorMap};

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    /// Needs the TensorRT runtime; CUDA is registered behind it as fallback.
    Tensorrt,
}

impl InferenceBackend {
    /// Case-insensitive; unknown names select the CPU.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct EngineCache {
    files: u64,
    bytes: u64,
}

impl EngineCache {
    fn scan(root: &Path) -> Self {
        let mut cache = Self::default();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(meta) = entry.metadata() {
                    cache.files += 1;
                    cache.bytes += meta.len();
                }
            }
        }
        cache
    }

    fn grew_since(&self, before: &Self) -> bool {
        self.files > before.files || self.bytes > before.bytes
    }
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("failed to load ONNX model: {}", config.model_path.display());

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with the default CPU provider");
            builder.commit_from_file(config.model_path).with_context(load_context)
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA execution provider unavailable; inference will run on the CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(err) = std::fs::create_dir_all(cache_dir) {
                warn!(dir = %cache_dir.display(), error = %err, "Failed to create TensorRT cache directory");
            }

            let before = EngineCache::scan(cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.files,
                "Building TensorRT engine; the first run for a patch size can take minutes"
            );

            // Engine builds are silent for a long time; keep the log alive.
            let (stop_tx, stop_rx) = channel::<()>();
            let heartbeat = thread::spawn(move || {
                let mut waited = Duration::ZERO;
                loop {
                    match stop_rx.recv_timeout(TRT_PROGRESS_TICK) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            waited += TRT_PROGRESS_TICK;
                            info!(elapsed_secs = waited.as_secs(), "TensorRT engine build in progress");
                        }
                    }
                }
            });

            let cache_path = cache_dir.to_string_lossy().to_string();
            let session = (|| -> Result<Session> {
                builder
                    .with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .with_engine_cache_path(&cache_path)
                            .with_device_id(0)
                            .build(),
                        CUDAExecutionProvider::default().build(),
                    ])?
                    .commit_from_file(config.model_path)
                    .with_context(load_context)
            })();

            let _ = stop_tx.send(());
            let _ = heartbeat.join();

            let after = EngineCache::scan(cache_dir);
            let elapsed_secs = started.elapsed().as_secs_f64();
            match &session {
                Ok(_) => info!(
                    elapsed_secs,
                    cache_files = after.files,
                    cache_bytes = after.bytes,
                    cache_updated = after.grew_since(&before),
                    "TensorRT session ready"
                ),
                Err(err) => error!(
                    elapsed_secs,
                    cache_dir = %cache_dir.display(),
                    error = %err,
                    "TensorRT session initialization failed"
                ),
            }
            session
        }
    }
}

/// TensorRT engines are shape-specific, so the cache is keyed by model and patch shape.
pub fn trt_cache_key(model_name: &str, patch_shape: &[usize]) -> String {
    let shape = patch_shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x");
    let model: String = model_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{model}_{shape}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionTensor {
    name: String,
    fp16: bool,
}

impl SessionTensor {
    fn new(name: &str, dtype: &ValueType) -> Self {
        let fp16 = matches!(
            dtype,
            ValueType::Tensor { ty, .. } if *ty == TensorElementType::Float16
        );
        Self {
            name: name.to_string(),
            fp16,
        }
    }
}

/// Runs patches through an ONNX Runtime session.
///
/// Float16 model inputs and outputs are converted from and to `f32` at the boundary.
pub struct OrtInference {
    session: Session,
    inputs: Vec<SessionTensor>,
    outputs: Vec<SessionTensor>,
}

impl OrtInference {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        let session = build_session(config)?;
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session) -> Self {
        let inputs: Vec<SessionTensor> = session
            .inputs()
            .iter()
            .map(|input| SessionTensor::new(input.name(), input.dtype()))
            .collect();
        let outputs: Vec<SessionTensor> = session
            .outputs()
            .iter()
            .map(|output| SessionTensor::new(output.name(), output.dtype()))
            .collect();

        debug!(
            inputs = ?inputs.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            outputs = ?outputs.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            fp16 = inputs.iter().any(|t| t.fp16),
            "Detected model IO"
        );

        Self {
            session,
            inputs,
            outputs,
        }
    }
}

fn ort_failure(err: ort::Error) -> InferenceError {
    InferenceError::classify(err.to_string())
}

impl PatchInference for OrtInference {
    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap, InferenceError> {
        let mut feeds: Vec<(String, SessionInputValue<'static>)> = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let array = inputs.get(&input.name).ok_or_else(|| {
                InferenceError::Backend(format!("no value supplied for model input '{}'", input.name))
            })?;
            let value: SessionInputValue<'static> = if input.fp16 {
                Tensor::from_array(array.mapv(f16::from_f32))
                    .map_err(ort_failure)?
                    .into()
            } else {
                Tensor::from_array(array.clone()).map_err(ort_failure)?.into()
            };
            feeds.push((input.name.clone(), value));
        }

        let results = self.session.run(feeds).map_err(ort_failure)?;

        let mut outputs = TensorMap::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let value = results.get(output.name.as_str()).ok_or_else(|| {
                InferenceError::Backend(format!("session produced no output '{}'", output.name))
            })?;
            let array = if output.fp16 {
                value
                    .try_extract_array::<f16>()
                    .map_err(ort_failure)?
                    .mapv(f32::from)
            } else {
                value
                    .try_extract_array::<f32>()
                    .map_err(ort_failure)?
                    .to_owned()
            };
            outputs.insert(output.name.clone(), array);
        }
        Ok(outputs)
    }
}
