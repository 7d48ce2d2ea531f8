use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::progress::RunHandle;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
/// Per-patch records are emitted at debug level; the file sink keeps them
/// even when the console stays at the default level.
pub const DEFAULT_FILE_DETAIL_FILTER: &str = "patchwise_core=debug";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "patchwise";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);
static ACTIVE_RUN: Mutex<Option<ActiveRun>> = Mutex::new(None);

struct ActiveRun {
    label: String,
    handle: RunHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub file_detail_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            file_detail_filter: DEFAULT_FILE_DETAIL_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct PanicArtifactRecord {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    active_run: String,
    source_location: String,
    payload: String,
    backtrace_policy: String,
    backtrace_text: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing_crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing_crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing_crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing_crash_dir.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let crash_dir_for_hook = crash_dir.clone();
    panic::set_hook(Box::new(move |panic_info| {
        write_panic_artifact_with_fallback(&crash_dir_for_hook, panic_info);
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the default.
/// The noise filter only applies when the user did not pick a level explicitly.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;
    let include_noise = options.include_noise_filter_when_implicit && implicit;

    let console_filter = join_directives(&[
        include_noise.then_some(options.noise_filter.as_str()),
        Some(user_filter.as_str()),
    ]);
    let file_filter = join_directives(&[
        include_noise.then_some(options.noise_filter.as_str()),
        implicit.then_some(options.file_detail_filter.as_str()),
        Some(user_filter.as_str()),
    ]);

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

// EnvFilter lets later directives for the same target win, so the user filter goes last.
fn join_directives(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .flatten()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn write_panic_artifact_with_fallback(crash_dir: &Path, panic_info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let write_result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let report = build_panic_artifact_record(panic_info);
        write_panic_artifact_file(crash_dir, &report)
    }));

    match write_result {
        Ok(Ok(_artifact_path)) => {}
        Ok(Err(error)) => {
            eprintln!(
                "Warning: failed to write panic crash artifact under '{}': {error}",
                crash_dir.display()
            );
        }
        Err(_) => {
            eprintln!(
                "Warning: panic hook failed while writing crash artifact under '{}'.",
                crash_dir.display()
            );
        }
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn build_panic_artifact_record(panic_info: &PanicHookInfo<'_>) -> PanicArtifactRecord {
    let backtrace = Backtrace::capture();
    let (backtrace_policy, backtrace_text) = match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1/full to enable)".to_string(),
            "<disabled by backtrace policy>".to_string(),
        ),
        _ => (
            "unavailable".to_string(),
            "<backtrace unavailable on this platform>".to_string(),
        ),
    };

    let source_location = panic_info
        .location()
        .map(|location| format!("{}:{}:{}", location.file(), location.line(), location.column()))
        .unwrap_or_else(|| "<unknown>".to_string());

    PanicArtifactRecord {
        timestamp: chrono::Utc::now(),
        thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
        active_run: active_run_summary(),
        source_location,
        payload: panic_payload_to_string(panic_info.payload()),
        backtrace_policy,
        backtrace_text,
    }
}

fn write_panic_artifact_file(
    crash_dir: &Path,
    report: &PanicArtifactRecord,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let filename = format!(
        "panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    );
    let artifact_path = crash_dir.join(filename);

    let mut file = fs::File::create(&artifact_path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "run={}", report.active_run)?;
    writeln!(file, "location={}", report.source_location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace_text)?;
    file.flush()?;

    Ok(artifact_path)
}

/// Registers the run whose position is written into crash artifacts until
/// the guard is dropped.
pub fn track_active_run(label: impl Into<String>, handle: RunHandle) -> ActiveRunGuard {
    let mut active = ACTIVE_RUN
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *active = Some(ActiveRun {
        label: label.into(),
        handle,
    });
    ActiveRunGuard { _private: () }
}

#[must_use = "the run is untracked as soon as the guard is dropped"]
pub struct ActiveRunGuard {
    _private: (),
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE_RUN
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = None;
    }
}

// try_lock: the panic may come from a thread that holds the lock.
fn active_run_summary() -> String {
    let Ok(active) = ACTIVE_RUN.try_lock() else {
        return "<busy>".to_string();
    };
    match active.as_ref() {
        Some(run) => describe_run(&run.label, &run.handle),
        None => "<none>".to_string(),
    }
}

fn describe_run(label: &str, handle: &RunHandle) -> String {
    format!(
        "{label} patch={}/{} phase={}",
        handle.current_patch(),
        handle.total_patches(),
        handle.phase().label()
    )
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("patchwise_core::controller=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "patchwise_core::controller=trace");
        assert_eq!(filters.console_filter, "patchwise_core::controller=trace");
        assert_eq!(filters.file_filter, "patchwise_core::controller=trace");
    }

    #[test]
    fn verbose_levels_map_to_debug_and_trace() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 2,
            ..Default::default()
        };

        assert_eq!(compose_logging_filters(&debug).console_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).console_filter, "trace");
    }

    #[test]
    fn rust_log_env_used_when_no_cli_or_verbose() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,patchwise_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "warn,patchwise_core=debug");
        assert_eq!(filters.console_filter, "ort=error,warn,patchwise_core=debug");
    }

    #[test]
    fn implicit_selection_keeps_patch_detail_in_file_sink_only() {
        let filters = compose_logging_filters(&LoggingInitOptions::default());

        assert_eq!(filters.console_filter, "ort=error,info");
        assert_eq!(filters.file_filter, "ort=error,patchwise_core=debug,info");
    }

    #[test]
    fn noise_filter_can_be_disabled() {
        let options = LoggingInitOptions {
            include_noise_filter_when_implicit: false,
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, "info");
        assert_eq!(filters.file_filter, "patchwise_core=debug,info");
    }

    #[test]
    fn file_sink_uses_default_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        let expected_log_dir = data_dir.path().join(DEFAULT_LOG_DIR_NAME);

        match plan {
            FileSinkPlan::Ready(ready) => {
                assert_eq!(ready.log_dir, expected_log_dir);
                assert_eq!(ready.retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(ready.log_dir.exists());
            }
            FileSinkPlan::Fallback(fallback) => panic!(
                "expected ready file sink, got fallback: {}",
                fallback.reason
            ),
        }
    }

    #[test]
    fn file_sink_falls_back_without_data_dir() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());

        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert!(plan
            .fallback_reason()
            .is_some_and(|reason| reason.contains("data_dir is not configured")));
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let data_dir_file = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir_file.path().to_path_buf()),
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        let expected_log_dir = data_dir_file.path().join(DEFAULT_LOG_DIR_NAME);

        match plan {
            FileSinkPlan::Ready(_) => panic!("expected fallback file sink"),
            FileSinkPlan::Fallback(fallback) => {
                assert_eq!(fallback.attempted_log_dir, Some(expected_log_dir));
                assert!(fallback.reason.contains("failed to create log directory"));
            }
        }
    }

    #[test]
    fn panic_artifact_file_contains_required_sections() {
        let crash_dir = tempdir().expect("tempdir");
        let report = PanicArtifactRecord {
            timestamp: chrono::Utc::now(),
            thread_name: "tiling".to_string(),
            active_run: "unet on cells.tif patch=3/9 phase=inferring".to_string(),
            source_location: "src/controller.rs:12:7".to_string(),
            payload: "panic payload".to_string(),
            backtrace_policy: "captured".to_string(),
            backtrace_text: "fake backtrace".to_string(),
        };

        let artifact_path =
            write_panic_artifact_file(crash_dir.path(), &report).expect("write artifact");
        let contents = stdfs::read_to_string(&artifact_path).expect("read artifact");

        assert!(artifact_path.starts_with(crash_dir.path()));
        assert_eq!(
            artifact_path.extension().and_then(|ext| ext.to_str()),
            Some("log")
        );
        assert!(contents.contains("timestamp_utc="));
        assert!(contents.contains("thread=tiling"));
        assert!(contents.contains("run=unet on cells.tif patch=3/9 phase=inferring"));
        assert!(contents.contains("location=src/controller.rs:12:7"));
        assert!(contents.contains("payload=panic payload"));
        assert!(contents.contains("backtrace_policy=captured"));
        assert!(contents.contains("fake backtrace"));
    }

    #[test]
    fn panic_payload_to_string_handles_common_payload_types() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(panic_payload_to_string(str_payload), "boom");
        assert_eq!(panic_payload_to_string(string_payload), "kaboom");
        assert_eq!(
            panic_payload_to_string(int_payload),
            "<non-string panic payload>"
        );
    }

    #[test]
    fn run_description_reports_position_and_phase() {
        let handle = RunHandle::new();
        assert_eq!(describe_run("unet", &handle), "unet patch=0/0 phase=planning");
    }
}
