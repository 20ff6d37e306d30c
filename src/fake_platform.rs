//! In-memory platform used by the CLI behaviour tests.
//!
//! Setting `WITHVOL_FAKE_PLATFORM` swaps the cloud API, the device
//! namespace, and the OS utilities for the fakes in `test_support`. The
//! caller's command still runs for real. Every recorded side effect is
//! echoed to stderr as a `journal:` line once the run finishes.

use std::env;
use std::io::{self, Write};

use withvol::RunSettings;
use withvol::guard::{GuardedCommandRunner, OsSignals};
use withvol::identity::StaticIdentitySource;
use withvol::test_support::{
    Journal, JournalingLauncher, RecordingBackend, ScriptedDeviceProbe, ScriptedRunner,
};

use super::{Action, CliError, dispatch, finish};

const FAKE_PLATFORM_ENV: &str = "WITHVOL_FAKE_PLATFORM";

pub(crate) fn from_env() -> Option<String> {
    env::var(FAKE_PLATFORM_ENV).ok()
}

pub(crate) async fn run(
    settings: RunSettings,
    action: &Action,
    platform: &str,
) -> Result<i32, CliError> {
    let journal = Journal::new();
    let probe = ScriptedDeviceProbe::new();
    let backend = RecordingBackend::new(journal.clone());
    let runner = ScriptedRunner::new(journal.clone()).succeeding_by_default();

    match platform {
        "ready" => backend.materialize_devices(&probe, 0),
        "blank" => {
            backend.materialize_devices(&probe, 0);
            runner.push_exit_code(settings.filesystem_tools.blank_exit_code);
        }
        "attach-fails" => backend.fail_on_attach(),
        "never-appears" => {}
        "mount-fails" => {
            backend.materialize_devices(&probe, 0);
            runner.push_success();
            runner.push_failure(32);
        }
        "busy-unmount" => {
            backend.materialize_devices(&probe, 0);
            runner.push_success();
            runner.push_success();
            runner.push_exit_code(settings.mount_tools.umount_idle_exit_code);
        }
        other => return Err(CliError::FakePlatform(other.to_owned())),
    }

    let launcher = JournalingLauncher::new(journal.clone(), GuardedCommandRunner);
    let orchestrator =
        withvol::RunOrchestrator::new(settings, backend, runner, probe, launcher, OsSignals);
    let identity = StaticIdentitySource::new("srv-fake", "fr-par-1");

    let code = finish(dispatch(&orchestrator, &identity, action).await);

    let mut stderr = io::stderr();
    for event in journal.events() {
        writeln!(stderr, "journal: {event}").ok();
    }
    Ok(code)
}
