//! End-to-end CLI runs against the in-memory platform.
//!
//! The binary is built with the `test-backdoors` feature so
//! `WITHVOL_FAKE_PLATFORM` can replace the cloud API and OS utilities. The
//! child command still runs for real.

use std::fs::{self, File};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use escargot::CargoBuild;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[expect(
    clippy::expect_used,
    reason = "test setup requires panic on build failure"
)]
static WITHVOL_BIN: LazyLock<escargot::CargoRun> = LazyLock::new(|| {
    CargoBuild::new()
        .bin("withvol")
        .features("test-backdoors")
        .run()
        .expect("failed to build withvol with test-backdoors feature")
});

#[derive(Debug)]
struct CliOutput {
    status_code: i32,
    stderr: String,
}

impl CliOutput {
    /// First word of every `journal:` line, in order.
    fn operations(&self) -> Vec<String> {
        self.stderr
            .lines()
            .filter_map(|line| line.strip_prefix("journal: "))
            .filter_map(|event| event.split_whitespace().next())
            .map(str::to_owned)
            .collect()
    }
}

struct Sandbox {
    home: TempDir,
}

impl Sandbox {
    fn command(&self, platform: &str, args: &[&str]) -> Command {
        let mut command = WITHVOL_BIN.command();
        command
            .current_dir(self.home.path())
            .env("HOME", self.home.path())
            .env("XDG_CONFIG_HOME", self.home.path())
            .env_remove("WITHVOL_CONFIG_PATH")
            .env_remove("RUST_LOG")
            .env("WITHVOL_FAKE_PLATFORM", platform)
            .env("WITHVOL_VOLUME_ID", "vol-cli")
            .arg("--mountpoint")
            .arg(self.home.path().join("mnt"))
            .args(args);
        command
    }

    fn run(&self, platform: &str, args: &[&str]) -> CliOutput {
        let output = self
            .command(platform, args)
            .output()
            .unwrap_or_else(|err| panic!("failed to run withvol: {err}"));
        CliOutput {
            status_code: output.status.code().unwrap_or(1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Runs the binary and sends it SIGTERM once `delay` has passed.
    ///
    /// Only withvol receives the signal. Its child keeps running, so stderr
    /// goes to a file rather than a pipe that the child would hold open.
    fn run_terminated(&self, platform: &str, args: &[&str], delay: Duration) -> CliOutput {
        let log_path = self.home.path().join("stderr.log");
        let log = File::create(&log_path).unwrap_or_else(|err| panic!("stderr log: {err}"));
        let mut child = self
            .command(platform, args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log)
            .spawn()
            .unwrap_or_else(|err| panic!("failed to spawn withvol: {err}"));
        thread::sleep(delay);
        let kill = Command::new("kill")
            .args(["-TERM", &child.id().to_string()])
            .status()
            .unwrap_or_else(|err| panic!("failed to run kill: {err}"));
        assert!(kill.success(), "kill exited with {kill}");
        let status = child
            .wait()
            .unwrap_or_else(|err| panic!("failed to wait for withvol: {err}"));
        CliOutput {
            status_code: status.code().unwrap_or(1),
            stderr: fs::read_to_string(&log_path)
                .unwrap_or_else(|err| panic!("read stderr log: {err}")),
        }
    }
}

#[fixture]
fn sandbox() -> Sandbox {
    Sandbox {
        home: TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}")),
    }
}

fn ops(expected: &[&str]) -> Vec<String> {
    expected.iter().map(|op| (*op).to_owned()).collect()
}

#[rstest]
fn command_exit_code_becomes_the_process_exit_code(sandbox: Sandbox) {
    let output = sandbox.run("ready", &["--", "sh", "-c", "exit 3"]);

    assert_eq!(output.status_code, 3, "stderr: {}", output.stderr);
    assert_eq!(
        output.operations(),
        ops(&["attach", "blkid", "mount", "run", "umount", "detach"])
    );
}

#[rstest]
fn successful_command_exits_zero(sandbox: Sandbox) {
    let output = sandbox.run("ready", &["--", "true"]);

    assert_eq!(output.status_code, 0, "stderr: {}", output.stderr);
    assert!(
        output.stderr.contains("journal: attach vol-cli srv-fake"),
        "stderr: {}",
        output.stderr
    );
}

#[rstest]
fn blank_volume_is_formatted_with_the_requested_filesystem(sandbox: Sandbox) {
    let output = sandbox.run("blank", &["--fs", "xfs", "--", "true"]);

    assert_eq!(output.status_code, 0, "stderr: {}", output.stderr);
    assert_eq!(
        output.operations(),
        ops(&["attach", "blkid", "mkfs.xfs", "mount", "run", "umount", "detach"])
    );
}

#[rstest]
fn rejected_attach_exits_one_without_detaching(sandbox: Sandbox) {
    let output = sandbox.run("attach-fails", &["--", "true"]);

    assert_eq!(output.status_code, 1);
    assert!(output.stderr.contains("withvol: "), "stderr: {}", output.stderr);
    assert_eq!(output.operations(), ops(&["attach"]));
}

#[rstest]
fn device_that_never_appears_is_detached(sandbox: Sandbox) {
    let output = sandbox.run("never-appears", &["--attach-timeout", "0", "--", "true"]);

    assert_eq!(output.status_code, 1);
    assert!(
        output.stderr.contains("did not appear"),
        "stderr: {}",
        output.stderr
    );
    assert_eq!(output.operations(), ops(&["attach", "detach"]));
}

#[rstest]
fn mount_failure_detaches_without_running_the_command(sandbox: Sandbox) {
    let output = sandbox.run("mount-fails", &["--", "true"]);

    assert_eq!(output.status_code, 1);
    assert_eq!(output.operations(), ops(&["attach", "blkid", "mount", "detach"]));
}

#[rstest]
fn idle_unmount_is_not_an_error(sandbox: Sandbox) {
    let output = sandbox.run("busy-unmount", &["--", "true"]);

    assert_eq!(output.status_code, 0, "stderr: {}", output.stderr);
}

#[rstest]
fn mount_mode_leaves_the_volume_attached(sandbox: Sandbox) {
    let output = sandbox.run("ready", &["--mount"]);

    assert_eq!(output.status_code, 0, "stderr: {}", output.stderr);
    assert_eq!(output.operations(), ops(&["attach", "blkid", "mount"]));
}

#[rstest]
fn unmount_mode_unmounts_then_detaches(sandbox: Sandbox) {
    let output = sandbox.run("ready", &["--unmount"]);

    assert_eq!(output.status_code, 0, "stderr: {}", output.stderr);
    assert_eq!(output.operations(), ops(&["umount", "detach"]));
}

#[rstest]
fn sigterm_while_the_command_runs_releases_the_volume(sandbox: Sandbox) {
    let output =
        sandbox.run_terminated("ready", &["--", "sleep", "30"], Duration::from_secs(1));

    assert_eq!(output.status_code, 143, "stderr: {}", output.stderr);
    assert_eq!(
        output.operations(),
        ops(&["attach", "blkid", "mount", "run", "umount", "detach"])
    );
}

#[rstest]
fn sigterm_while_waiting_for_the_device_detaches(sandbox: Sandbox) {
    let output = sandbox.run_terminated(
        "never-appears",
        &["--attach-timeout", "30", "--", "true"],
        Duration::from_secs(1),
    );

    assert_eq!(output.status_code, 143, "stderr: {}", output.stderr);
    assert_eq!(output.operations(), ops(&["attach", "detach"]));
}

#[rstest]
fn verbose_logs_to_a_pipe_carry_no_colour_codes(sandbox: Sandbox) {
    let output = sandbox.run("ready", &["-v", "--", "true"]);

    assert_eq!(output.status_code, 0, "stderr: {}", output.stderr);
    assert!(
        output.stderr.contains("invoking command"),
        "stderr: {}",
        output.stderr
    );
    assert!(!output.stderr.contains('\u{1b}'), "stderr: {:?}", output.stderr);
}
