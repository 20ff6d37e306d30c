//! BDD scenarios for the run workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RunContext, run_context};

#[scenario(
    path = "tests/features/run.feature",
    name = "Release resources in reverse order after a successful command"
)]
fn scenario_release_in_reverse_order(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Format a blank volume before mounting it"
)]
fn scenario_format_blank_volume(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Propagate the command exit code and still release the volume"
)]
fn scenario_propagate_exit_code(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Detach a volume whose device never appears"
)]
fn scenario_device_never_appears(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Release the volume when the command is terminated"
)]
fn scenario_terminated_command(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "A rejected attach leaves nothing to release"
)]
fn scenario_rejected_attach(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Tolerate an unmount that reports nothing mounted"
)]
fn scenario_idle_unmount(run_context: RunContext) {
    let _ = run_context;
}
