//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing and configuration loading.

use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use session_registry::cli::{parse_args_from, Args};
use session_registry::config::Config;

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("sessiond")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-c",
        "/etc/sessiond.json",
        "-l",
        "trace",
        "--sweep-secs",
        "10",
        "--max-live-ms",
        "7200000",
    ]))
    .unwrap();

    assert_eq!(
        result.config.unwrap().to_str().unwrap(),
        "/etc/sessiond.json"
    );
    assert_eq!(result.log_level, Some("trace".to_string()));
    assert_eq!(result.sweep_secs, Some(10));
    assert_eq!(result.max_live_ms, Some(7_200_000));
    assert!(result.max_idle_ms.is_none());
}

#[test]
fn test_cli_unknown_flag() {
    assert!(parse_args_from(args(&["--port", "3000"])).is_err());
}

// ============================================================================
// Config Loading Tests
// ============================================================================

#[test]
fn test_file_then_args_priority() {
    let json = r#"{
        "sessions": {
            "sweep_interval_secs": 60,
            "max_time_to_idle_ms": 1200000
        },
        "logging": { "level": "warn" }
    }"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let mut config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.sessions.sweep_interval_secs, 60);

    let args = Args {
        sweep_secs: Some(5),
        ..Args::default()
    };
    config.apply_args(&args);

    assert_eq!(config.sessions.sweep_interval_secs, 5);
    assert_eq!(config.sessions.max_time_to_idle_ms, 1_200_000);
    assert_eq!(config.log_filter(), "warn");

    let sessions = config.to_session_config().unwrap();
    assert_eq!(sessions.sweep_interval, Duration::from_secs(5));
    assert_eq!(sessions.max_time_to_idle, Duration::from_secs(1200));
}

#[test]
fn test_identity_users_from_file() {
    let json = r#"{
        "identity": {
            "users": [
                {"name": "alice", "password": "secret", "groups": ["users", "lab"], "roles": ["user"]},
                {"name": "root", "password": "toor", "groups": ["system"], "leader_of": ["system"]}
            ]
        }
    }"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();
    let users = &config.identity.users;
    assert_eq!(users.len(), 2);
    assert_eq!(users[1].leader_of, vec!["system".to_string()]);
    assert!(users[0].leader_of.is_empty());
}
