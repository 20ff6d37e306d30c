//! BDD step definitions for the `withvol` run workflow.

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use withvol::test_support::{ScriptedDeviceProbe, ScriptedInterrupts, ScriptedLauncher};
use withvol::{CommandLine, RunOrchestrator, StaticIdentitySource, TerminationSignal, VolumeHandle};

use super::test_helpers::{ChildScript, RunContext, RunResult};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a volume \"{volume_id}\" on a ready instance")]
fn ready_instance(mut run_context: RunContext, volume_id: String) -> Result<RunContext, StepError> {
    run_context.settings.volume = VolumeHandle::new(volume_id.trim())
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    run_context
        .backend
        .materialize_devices(&run_context.probe, 1);
    Ok(run_context)
}

#[given("the device never appears")]
fn device_never_appears(run_context: RunContext) -> RunContext {
    // Attaches land in a namespace the orchestrator never polls.
    run_context
        .backend
        .materialize_devices(&ScriptedDeviceProbe::new(), 0);
    run_context
}

#[given("the volume already carries a filesystem")]
fn volume_has_filesystem(run_context: RunContext) -> RunContext {
    run_context.runner.push_success();
    run_context.runner.push_success();
    run_context
}

#[given("the volume is blank")]
fn volume_is_blank(run_context: RunContext) -> RunContext {
    let blank = run_context.settings.filesystem_tools.blank_exit_code;
    run_context.runner.push_exit_code(blank);
    run_context.runner.push_success();
    run_context.runner.push_success();
    run_context
}

#[given("unmount succeeds")]
fn unmount_succeeds(run_context: RunContext) -> RunContext {
    run_context.runner.push_success();
    run_context
}

#[given("unmount exits with code \"{code}\"")]
fn unmount_exits_with(run_context: RunContext, code: i32) -> RunContext {
    run_context.runner.push_exit_code(code);
    run_context
}

#[given("the command exits with code \"{code}\"")]
fn command_exits_with(mut run_context: RunContext, code: i32) -> RunContext {
    run_context.child = ChildScript::Exits(code);
    run_context
}

#[given("a termination signal arrives while the command runs")]
fn termination_signal(mut run_context: RunContext) -> RunContext {
    run_context.child = ChildScript::Terminated;
    run_context
}

#[given("the provider rejects the attach")]
fn provider_rejects_attach(run_context: RunContext) -> RunContext {
    run_context.backend.fail_on_attach();
    run_context
}

#[when("I run \"{command}\" against the volume")]
fn run_against_volume(run_context: RunContext, command: String) -> Result<RunContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
    let command_line =
        CommandLine::new(&argv).map_err(|err| StepError::Assertion(err.to_string()))?;

    let launcher = match run_context.child {
        ChildScript::Exits(code) => ScriptedLauncher::exiting(run_context.journal.clone(), code),
        ChildScript::Terminated => ScriptedLauncher::interrupted(
            run_context.journal.clone(),
            TerminationSignal::Terminate,
        ),
    };
    let orchestrator = RunOrchestrator::new(
        run_context.settings.clone(),
        run_context.backend.clone(),
        run_context.runner.clone(),
        run_context.probe.clone(),
        launcher,
        ScriptedInterrupts::never(),
    );
    let identity = StaticIdentitySource::new("srv-bdd", "fr-par-1");

    let result = runtime.block_on(async { orchestrator.execute(&identity, &command_line).await });

    let outcome = match result {
        Ok(_) => RunResult::Success,
        Err(err) => RunResult::Failure {
            exit_code: err.exit_code(),
            message: err.to_string(),
        },
    };

    Ok(RunContext {
        outcome: Some(outcome),
        ..run_context
    })
}

fn outcome(run_context: &RunContext) -> Result<&RunResult, StepError> {
    run_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the run succeeds")]
fn run_succeeds(run_context: &RunContext) -> Result<(), StepError> {
    match outcome(run_context)? {
        RunResult::Success => Ok(()),
        RunResult::Failure { message, .. } => Err(StepError::Assertion(format!(
            "run failed unexpectedly: {message}"
        ))),
    }
}

#[then("the run fails with exit code \"{code}\"")]
fn run_fails_with(run_context: &RunContext, code: i32) -> Result<(), StepError> {
    match outcome(run_context)? {
        RunResult::Failure { exit_code, .. } if *exit_code == code => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected exit code {code}, got {other:?}"
        ))),
    }
}

#[then("the run error mentions \"{text}\"")]
fn run_error_mentions(run_context: &RunContext, text: String) -> Result<(), StepError> {
    match outcome(run_context)? {
        RunResult::Failure { message, .. } if message.contains(text.as_str()) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an error mentioning '{text}', got {other:?}"
        ))),
    }
}

#[then("the operations are \"{labels}\"")]
fn operations_are(run_context: &RunContext, labels: String) -> Result<(), StepError> {
    let expected: Vec<String> = labels.split(',').map(|label| label.trim().to_owned()).collect();
    let actual = run_context.journal.labels();
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected operations {expected:?}, got {actual:?}"
        )))
    }
}
