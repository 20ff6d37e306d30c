//! Binary entry point for the `withvol` CLI.

use std::io::{self, IsTerminal, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use withvol::{
    ChildLauncher, CommandError, CommandLine, CommandRunner, ConfigError, ConfigOverrides,
    DeviceProbe, FsDeviceProbe, GuardedCommandRunner, IdentitySource, InterruptSource, OsSignals,
    ProcessCommandRunner, RunError, RunOrchestrator, ScalewayBackend, ScalewayBackendError,
    ScalewayConfig, VolumeBackend, VolumeConfig,
};

mod cli;
#[cfg(feature = "test-backdoors")]
mod fake_platform;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(#[from] ScalewayBackendError),
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),
    #[cfg(feature = "test-backdoors")]
    #[error("unknown fake platform: {0}")]
    FakePlatform(String),
}

/// What the invocation was asked to do.
#[derive(Debug, Eq, PartialEq)]
enum Action {
    Run(CommandLine),
    Mount,
    Unmount,
}

impl Action {
    fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        if cli.mount {
            return Ok(Self::Mount);
        }
        if cli.unmount {
            return Ok(Self::Unmount);
        }
        Ok(Self::Run(CommandLine::new(&cli.command)?))
    }
}

fn overrides(cli: &Cli) -> ConfigOverrides {
    ConfigOverrides {
        volume_id: cli.volume.clone(),
        mount_path: cli.mountpoint.clone(),
        fs_type: cli.fs_type.clone(),
        attach_timeout_secs: cli.attach_timeout,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let exit_code = match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if let Err(err) = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .with_env_filter(filter)
        .try_init()
    {
        writeln!(io::stderr(), "withvol: logging unavailable: {err}").ok();
    }
}

async fn run(cli: &Cli) -> Result<i32, CliError> {
    let action = Action::from_cli(cli)?;
    let mut config = VolumeConfig::load_without_cli_args()?;
    config.apply_overrides(overrides(cli));
    let settings = config.to_settings()?;

    #[cfg(feature = "test-backdoors")]
    if let Some(platform) = fake_platform::from_env() {
        return fake_platform::run(settings, &action, &platform).await;
    }

    let scaleway = ScalewayConfig::load_without_cli_args()?;
    let identity = scaleway.identity_source()?;
    let backend = ScalewayBackend::new(&scaleway)?;
    let orchestrator = RunOrchestrator::new(
        settings,
        backend,
        ProcessCommandRunner,
        FsDeviceProbe,
        GuardedCommandRunner,
        OsSignals,
    );

    Ok(finish(
        dispatch(&orchestrator, identity.as_ref(), &action).await,
    ))
}

async fn dispatch<B, R, P, L, I, S>(
    orchestrator: &RunOrchestrator<B, R, P, L, I>,
    identity: &S,
    action: &Action,
) -> Result<(), RunError<B::Error>>
where
    B: VolumeBackend,
    R: CommandRunner + Clone,
    P: DeviceProbe + Clone,
    L: ChildLauncher,
    I: InterruptSource,
    S: IdentitySource + ?Sized,
{
    match action {
        Action::Run(command) => {
            let summary = orchestrator.execute(identity, command).await?;
            tracing::info!(
                device = %summary.slot.os_path,
                cleanup_failures = summary.cleanup.failure_count(),
                "command completed"
            );
        }
        Action::Mount => {
            let summary = orchestrator.mount_only(identity).await?;
            tracing::info!(
                device = %summary.slot.os_path,
                path = %orchestrator.settings().mount.path,
                "volume mounted"
            );
        }
        Action::Unmount => {
            orchestrator.unmount_only(identity).await?;
        }
    }
    Ok(())
}

/// Converts the run outcome into the process exit code, reporting any
/// failure on stderr.
fn finish<E>(result: Result<(), RunError<E>>) -> i32
where
    E: std::error::Error + 'static,
{
    match result {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            err.exit_code()
        }
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &dyn std::fmt::Display) {
    writeln!(target, "withvol: {err}").ok();
}
