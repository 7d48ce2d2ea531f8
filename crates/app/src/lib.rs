use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use patchwise_core::backend::{
    resolve_trt_cache_dir, trt_cache_key, InferenceBackend, OrtInference, SessionConfig,
};
use patchwise_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use patchwise_core::controller::{InputValue, RunOutcome, TilingController};
use patchwise_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use patchwise_core::model_spec::{ModelSpec, RunOptions};
use patchwise_core::planner::{PatchPlan, PatchPlanner};
use patchwise_core::progress::{ProgressReporter, ProgressSnapshot};

pub mod io;

#[derive(Parser)]
#[command(name = "patchwise", about = "Tiled model inference for large images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the patch grid for a model and image size without running anything.
    Plan(PlanArgs),
    /// Run a model over an image patch by patch.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct ModeArgs {
    #[arg(long, help = "Feed the whole image in one call")]
    no_patching: bool,
    #[arg(long, help = "The model is pyramidal (whole image in, declared size out)")]
    pyramidal: bool,
}

impl ModeArgs {
    fn apply(self, mut options: RunOptions) -> RunOptions {
        if self.no_patching {
            options.allow_patching = false;
        }
        if self.pyramidal {
            options.pyramidal = true;
        }
        options
    }
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long, help = "Model description (TOML)")]
    model: PathBuf,
    #[arg(long, value_name = "WxHxCxZ", value_parser = parse_size)]
    size: [usize; 4],
    #[command(flatten)]
    mode: ModeArgs,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, help = "Model description (TOML)")]
    model: PathBuf,
    #[arg(long, help = "ONNX model file")]
    onnx: PathBuf,
    #[arg(short = 'i', long)]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output directory (defaults to the configured output dir)")]
    output: Option<PathBuf>,
    #[arg(
        long = "param",
        value_name = "NAME=FILE.json",
        help = "Parameter tensor for a declared input (repeatable)"
    )]
    params: Vec<String>,
    #[arg(long, help = "cpu, cuda or tensorrt (overrides config)")]
    backend: Option<String>,
    #[command(flatten)]
    mode: ModeArgs,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    patchwise_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    patchwise_core::runtime::log_runtime_lib_status();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Plan(args) => plan_command(args, &config, &resolved_data_dir),
        Commands::Run(args) => run_command(args, config, resolved_data_dir).await,
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_env_filter);

    let (file_layer, fallback) = match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_env_filter = parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(ready.appender)
                .with_filter(file_env_filter);
            (Some(layer), None)
        }
        FileSinkPlan::Fallback(fallback) => (None, Some(fallback)),
    };

    let subscriber = tracing_subscriber::registry().with(console_layer).with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return;
    }

    if let Some(fallback) = fallback {
        let attempted_log_dir = fallback
            .attempted_log_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        warn!(
            attempted_log_dir = %attempted_log_dir,
            reason = %fallback.reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Accepts `W`, `WxH`, `WxHxC` or `WxHxCxZ`; missing trailing extents are 1.
fn parse_size(raw: &str) -> Result<[usize; 4], String> {
    let parts: Vec<&str> = raw.split(['x', 'X']).collect();
    if parts.is_empty() || parts.len() > 4 {
        return Err(format!("expected WxHxCxZ, got '{raw}'"));
    }
    let mut size = [1usize; 4];
    for (slot, part) in parts.iter().enumerate() {
        let value: usize = part
            .trim()
            .parse()
            .map_err(|_| format!("'{part}' in '{raw}' is not a size"))?;
        if value == 0 {
            return Err(format!("extents must be positive, got '{raw}'"));
        }
        size[slot] = value;
    }
    Ok(size)
}

/// Paths that do not exist as given are looked up under the configured models dir.
fn resolve_model_file(data_dir: &Path, config: &AppConfig, path: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }
    resolve_relative_to(&resolve_relative_to(data_dir, &config.paths.models_dir), path)
}

fn plan_command(args: PlanArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model = ModelSpec::load_from_path(&resolve_model_file(data_dir, config, &args.model))?;
    let options = args.mode.apply(config.tiling.run_options());
    let plan = PatchPlanner::new(&model, options)
        .plan(args.size)
        .with_context(|| format!("cannot plan '{}' for {:?}", model.name, args.size))?;
    print!("{}", format_plan(&plan));
    Ok(())
}

fn format_plan(plan: &PatchPlan) -> String {
    let mut out = format!(
        "{:<6}{:>8}{:>8}{:>8}{:>8}{:>8}{:>10}{:>14}\n",
        "axis", "extent", "patch", "roi", "pad", "count", "overlap", "mirror"
    );
    for axis in plan.axes() {
        out.push_str(&format!(
            "{:<6}{:>8}{:>8}{:>8}{:>8}{:>8}{:>10}{:>14}\n",
            axis.axis.symbol(),
            axis.extent,
            axis.patch,
            axis.roi,
            axis.padding,
            axis.count,
            axis.overlap,
            format!("{}+{}", axis.mirror.before, axis.mirror.after),
        ));
    }
    out.push_str(&format!(
        "total patches: {}{}\n",
        plan.total_patches(),
        if plan.whole_image { " (whole image)" } else { "" }
    ));
    out
}

async fn run_command(args: RunArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    let model = ModelSpec::load_from_path(&resolve_model_file(&data_dir, &config, &args.model))?;
    let options = args.mode.apply(config.tiling.run_options());
    let image_input = model.image_input()?.clone();

    let mut inputs = HashMap::new();
    let image = io::load_image(&args.input)?;
    info!(image = %image.title(), size = %image.size_label(), "Loaded input image");
    inputs.insert(image_input.name.clone(), InputValue::Image(image));
    for raw in &args.params {
        let (name, file) = io::parse_param_arg(raw)?;
        inputs.insert(name, InputValue::Tensor(io::load_parameter(&file)?));
    }

    let backend = args
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.inference.backend);
    let trt_cache_dir = resolve_trt_cache_dir(
        &resolve_relative_to(&data_dir, &config.paths.trt_cache_dir),
        Some(&trt_cache_key(&model.name, &image_input.recommended_patch)),
    );
    let output_dir = args
        .output
        .unwrap_or_else(|| resolve_relative_to(&data_dir, &config.paths.output_dir));

    let mut controller = TilingController::new(&model, options);
    let handle = controller.handle();

    let reporter = config.progress.enabled.then(|| {
        ProgressReporter::spawn(handle.clone(), config.progress.interval(), |snapshot| {
            print_progress(snapshot, snapshot.elapsed.as_secs_f64());
        })
    });

    let cancel_handle = handle.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current patch");
            cancel_handle.request_cancel();
        }
    });

    let onnx = resolve_model_file(&data_dir, &config, &args.onnx);
    info!(model = %model.name, backend = %backend, onnx = %onnx.display(), "Starting run");
    let outcome = tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
        let mut inference = OrtInference::load(&SessionConfig {
            model_path: &onnx,
            backend,
            trt_cache_dir: Some(trt_cache_dir.as_path()),
        })?;
        Ok(controller.run(&inputs, &mut inference)?)
    })
    .await
    .context("tiling task panicked")?;

    interrupt.abort();
    if let Some(reporter) = reporter {
        reporter.stop();
        eprintln!();
    }

    match outcome? {
        RunOutcome::Cancelled {
            at_patch,
            completed,
        } => {
            warn!(at_patch, completed, "Run cancelled; no outputs written");
            Ok(())
        }
        RunOutcome::Completed(output) => {
            io::write_outputs(&output_dir, &output)?;
            info!(
                runtime = %format_duration(output.report.runtime_secs),
                patches = output.report.total_patches,
                peak_memory_bytes = output.report.peak_memory_bytes,
                output_dir = %output_dir.display(),
                "Run completed"
            );
            Ok(())
        }
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_line(snapshot: &ProgressSnapshot, elapsed: f64) -> String {
    let fraction = snapshot.fraction();
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let done = snapshot.current_patch.saturating_sub(1);
    let eta = if done > 0 && snapshot.total_patches > done {
        let per_patch = elapsed / done as f64;
        let remaining = (snapshot.total_patches - done) as f64 * per_patch;
        format!(" | ETA: {}", format_duration(remaining))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Patch {}/{} | {} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        snapshot.current_patch,
        snapshot.total_patches,
        snapshot.phase.label(),
        format_duration(elapsed),
        eta,
    )
}

fn print_progress(snapshot: &ProgressSnapshot, elapsed: f64) {
    eprint!("\r{}    ", progress_line(snapshot, elapsed));
}
