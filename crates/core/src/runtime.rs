use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Where the ONNX Runtime shared library was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLibrarySource {
    /// `ORT_DYLIB_PATH` was already set by the caller.
    Environment(PathBuf),
    /// Found in one of the probed directories.
    Discovered(PathBuf),
    NotFound,
}

/// Directories probed for the ONNX Runtime library, in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

fn resolve_ort_library(existing: Option<PathBuf>, dirs: &[PathBuf]) -> OrtLibrarySource {
    if let Some(path) = existing {
        return OrtLibrarySource::Environment(path);
    }
    find_ort_dylib_in_dirs(dirs)
        .map(OrtLibrarySource::Discovered)
        .unwrap_or(OrtLibrarySource::NotFound)
}

/// Points `ORT_DYLIB_PATH` at a bundled ONNX Runtime before the first session is built.
///
/// Call this at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() -> OrtLibrarySource {
    let existing = env::var_os(ORT_DYLIB_ENV).map(PathBuf::from);
    let source = resolve_ort_library(existing, &candidate_lib_dirs());
    if let OrtLibrarySource::Discovered(path) = &source {
        env::set_var(ORT_DYLIB_ENV, path);
    }
    source
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set, ORT will try default search paths"),
    }
}
