// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration loading

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use pitv::config::{Cli, Settings};
use pitv::errors::ConfigError;

fn cli(args: &[&str]) -> Cli {
    Cli::parse_from(std::iter::once("pitv-server").chain(args.iter().copied()))
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let settings = Settings::load(&cli(&["--config", path.to_str().unwrap()])).unwrap();

    assert!(settings.config_file.is_none());
    assert_eq!(settings.server.user_db, "usernames.txt");
    assert_eq!(settings.pipeline.recording_path, PathBuf::from("recordings"));
    assert!(settings.logging.dir.is_none());
}

#[test]
fn test_relative_paths_follow_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pitv-config.toml");
    fs::write(
        &path,
        r#"
        user-db = "users.csv"
        tls-cert = "/etc/ssl/pitv.crt"
        log-dir = "logs"
        recording-path = "clips"
        listen = ["https://127.0.0.1:5443"]
        max-leases-per-user = 4
        "#,
    )
    .unwrap();

    let settings = Settings::load(&cli(&["--config", path.to_str().unwrap()])).unwrap();

    assert_eq!(settings.config_file.as_deref(), Some(path.as_path()));
    assert_eq!(
        PathBuf::from(&settings.server.user_db),
        dir.path().join("users.csv")
    );
    assert_eq!(settings.server.tls_cert, PathBuf::from("/etc/ssl/pitv.crt"));
    assert_eq!(settings.logging.dir, Some(dir.path().join("logs")));
    assert_eq!(settings.server.recording_dir, dir.path().join("clips"));
    assert!(settings.server.needs_tls());
    assert_eq!(settings.lease.max_leases_per_user, 4);
}

#[test]
fn test_user_db_urls_are_not_rebased() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pitv-config.toml");
    fs::write(&path, "user-db = \"file:///srv/pitv/users.csv\"\n").unwrap();

    let settings = Settings::load(&cli(&["--config", path.to_str().unwrap()])).unwrap();
    assert_eq!(settings.server.user_db, "file:///srv/pitv/users.csv");
}

#[test]
fn test_malformed_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pitv-config.toml");
    fs::write(&path, "video-width = \"wide\"\n").unwrap();

    let result = Settings::load(&cli(&["--config", path.to_str().unwrap()]));
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

#[test]
fn test_invalid_values_are_rejected() {
    for args in [
        &["--video-width", "0"][..],
        &["--video-fps-denominator", "0"][..],
        &["--recording-segment-duration", "0"][..],
        &["--listen", "ftp://0.0.0.0:21"][..],
    ] {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("absent.toml");
        let mut full = vec!["--config", config.to_str().unwrap()];
        full.extend_from_slice(args);
        assert!(
            matches!(Settings::load(&cli(&full)), Err(ConfigError::Invalid(_))),
            "{args:?} should be rejected"
        );
    }
}

#[test]
fn test_force_mkdirs_takes_an_explicit_value() {
    let settings = Settings::load(&cli(&[
        "--config",
        "/nonexistent/pitv-config.toml",
        "--force-mkdirs",
        "false",
    ]))
    .unwrap();
    assert!(!settings.pipeline.force_mkdirs);
    assert!(!settings.logging.force_mkdirs);
}
