//! Shared fixtures for run BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;
use withvol::test_support::{Journal, RecordingBackend, ScriptedDeviceProbe, ScriptedRunner};
use withvol::{RunSettings, VolumeHandle};

/// How the scripted child process ends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChildScript {
    Exits(i32),
    Terminated,
}

#[derive(Clone, Debug)]
pub struct RunContext {
    pub journal: Journal,
    pub backend: RecordingBackend,
    pub runner: ScriptedRunner,
    pub probe: ScriptedDeviceProbe,
    pub settings: RunSettings,
    pub child: ChildScript,
    pub outcome: Option<RunResult>,
    pub(crate) mount_tmp: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum RunResult {
    Success,
    Failure { exit_code: i32, message: String },
}

#[derive(Clone, Debug, Error)]
pub enum RunTestError {
    #[error("failed to create mount root: {0}")]
    MountRoot(String),
    #[error("invalid volume: {0}")]
    Volume(String),
}

#[fixture]
pub fn run_context_result() -> Result<RunContext, RunTestError> {
    build_run_context()
}

#[fixture]
pub fn run_context(run_context_result: Result<RunContext, RunTestError>) -> RunContext {
    run_context_result.unwrap_or_else(|err| panic!("run context fixture should initialise: {err}"))
}

pub fn build_run_context() -> Result<RunContext, RunTestError> {
    let tmp_dir =
        TempDir::new().map_err(|err| RunTestError::MountRoot(format!("tempdir: {err}")))?;
    let mount_root = Utf8PathBuf::from_path_buf(tmp_dir.path().to_path_buf()).map_err(|path| {
        RunTestError::MountRoot(format!("non-utf8 tempdir path: {}", path.display()))
    })?;

    let journal = Journal::new();
    let mut settings = settings_for("vol-placeholder")?;
    settings.mount.path = mount_root.join("volume");

    Ok(RunContext {
        backend: RecordingBackend::new(journal.clone()),
        runner: ScriptedRunner::new(journal.clone()),
        probe: ScriptedDeviceProbe::new(),
        journal,
        settings,
        child: ChildScript::Exits(0),
        outcome: None,
        mount_tmp: Arc::new(tmp_dir),
    })
}

/// Settings tuned for fast scenarios: attach waits are milliseconds long.
pub fn settings_for(volume_id: &str) -> Result<RunSettings, RunTestError> {
    let volume =
        VolumeHandle::new(volume_id).map_err(|err| RunTestError::Volume(err.to_string()))?;
    let mut settings = RunSettings::new(volume);
    settings.attach_timeout = Duration::from_millis(40);
    settings.poll_interval = Duration::from_millis(5);
    Ok(settings)
}
