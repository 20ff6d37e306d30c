//! Configuration loading from the environment and from `withvol.toml`.

use std::fs;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use withvol::test_support::EnvGuard;
use withvol::{ConfigError, VolumeConfig};

#[tokio::test]
async fn environment_supplies_volume_settings() {
    let _guard = EnvGuard::set_vars(&[
        ("WITHVOL_VOLUME_ID", "vol-env"),
        ("WITHVOL_FS_TYPE", "xfs"),
        ("WITHVOL_ATTACH_TIMEOUT_SECS", "7"),
    ])
    .await;

    let config = VolumeConfig::load_without_cli_args().expect("config loads");
    let settings = config.to_settings().expect("settings");

    assert_eq!(settings.volume.id(), "vol-env");
    assert_eq!(settings.mount.filesystem_type, "xfs");
    assert_eq!(settings.mount.path, Utf8PathBuf::from("/mnt/vol-env"));
    assert_eq!(settings.attach_timeout.as_secs(), 7);
}

#[tokio::test]
async fn config_file_is_read_from_the_configured_path() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("withvol.toml");
    fs::write(
        &path,
        "volume_id = \"vol-file\"\nmount_path = \"/srv/data\"\numount_idle_exit_code = 1\n",
    )
    .expect("write config");
    let path_text = path.to_str().expect("utf8 path");

    let _guard = EnvGuard::set_var("WITHVOL_CONFIG_PATH", path_text).await;

    let config = VolumeConfig::load_without_cli_args().expect("config loads");
    let settings = config.to_settings().expect("settings");

    assert_eq!(settings.volume.id(), "vol-file");
    assert_eq!(settings.mount.path, Utf8PathBuf::from("/srv/data"));
    assert_eq!(settings.mount_tools.umount_idle_exit_code, 1);
}

#[tokio::test]
async fn zero_poll_interval_is_invalid() {
    let _guard = EnvGuard::set_vars(&[
        ("WITHVOL_VOLUME_ID", "vol-env"),
        ("WITHVOL_ATTACH_POLL_INTERVAL_MS", "0"),
    ])
    .await;

    let config = VolumeConfig::load_without_cli_args().expect("config loads");
    let err = config.to_settings().expect_err("zero poll interval");

    assert!(matches!(err, ConfigError::Invalid { .. }), "got {err:?}");
}
