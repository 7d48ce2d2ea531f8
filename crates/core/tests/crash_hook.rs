use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use patchwise_core::controller::{InputValue, TilingController};
use patchwise_core::inference::{InferenceError, TensorMap};
use patchwise_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};
use patchwise_core::model_spec::{ModelSpec, RunOptions, TensorKind, TensorSpec};
use patchwise_core::volume::ImageVolume;
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "PATCHWISE_CRASH_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "PATCHWISE_CRASH_CHILD_DATA_DIR";

fn spawn_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["crash_child_entrypoint", "--exact", "--nocapture"])
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run crash child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(DEFAULT_LOG_DIR_NAME).join(DEFAULT_CRASH_DIR_NAME)
}

fn crash_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    paths.sort();
    paths
}

/// Runs a four-patch model whose inference panics on the second patch.
fn run_model_that_panics() {
    let model = ModelSpec {
        name: "fragile".to_string(),
        inputs: vec![TensorSpec::new("image", TensorKind::Image, "XYC")
            .expect("layout")
            .with_patch(vec![4, 4, 1])],
        outputs: vec![TensorSpec::new("out", TensorKind::Image, "XYC").expect("layout")],
    };
    let inputs = HashMap::from([(
        "image".to_string(),
        InputValue::Image(ImageVolume::zeros([8, 8, 1, 1, 1])),
    )]);

    let mut seen = 0;
    let mut fragile = |feeds: &TensorMap| -> Result<TensorMap, InferenceError> {
        seen += 1;
        if seen == 2 {
            panic!("model crashed on patch {seen}");
        }
        Ok(TensorMap::from([("out".to_string(), feeds["image"].clone())]))
    };

    let _ = TilingController::new(&model, RunOptions::default()).run(&inputs, &mut fragile);
}

#[test]
fn crash_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir"));

    let plan = install_panic_hook(Some(&data_dir));
    assert!(matches!(plan, PanicHookInstallPlan::Installed { .. }));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "inference_panic" => run_model_that_panics(),
        "unwritable" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash directory");
            fs::write(&dir, b"occupied").expect("block crash directory with a file");
            run_model_that_panics();
        }
        other => panic!("unknown crash child mode: {other}"),
    }
}

#[test]
fn panic_during_inference_leaves_crash_artifact() {
    let data_dir = tempdir().expect("tempdir");
    let output = spawn_child("inference_panic", data_dir.path());
    assert!(!output.status.success(), "child should die from the panic");

    let artifacts = crash_artifacts(&crash_dir(data_dir.path()));
    let newest = artifacts.last().expect("crash artifact");
    let contents = fs::read_to_string(newest).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=model crashed on patch 2"));
    assert!(contents.contains("location="));
    assert!(contents.contains("crash_hook.rs"));
    assert!(contents.contains("run=fragile on image patch=2/4 phase=inferring"));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_without_double_panic() {
    let data_dir = tempdir().expect("tempdir");
    let output = spawn_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child should die from the panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("model crashed on patch 2"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn hook_without_data_dir_falls_back() {
    let plan = install_panic_hook(None);
    assert!(matches!(
        plan,
        PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            ..
        }
    ));
}
