//! Layered configuration loading: file, environment overrides and validation.
//!
//! These tests mutate process environment variables, so they run serially.

use std::io::Write;

use lattice_core::config::{LatticeConfig, SelectionMode};
use serial_test::serial;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
environment = "staging"

[pool]
chain_id = 10
selection_mode = "PriorityLevel"
poll_interval_ms = 2000
poll_failure_threshold = 3

[[nodes]]
name = "primary-a"
ws_url = "ws://a.local/ws"
http_url = "http://a.local"
order = 1

[[nodes]]
name = "relay"
http_url = "http://relay.local"
send_only = true

[logging]
level = "debug"
format = "json"
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

struct EnvGuard(Vec<&'static str>);

impl EnvGuard {
    fn set(vars: &[(&'static str, &str)]) -> Self {
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        Self(vars.iter().map(|(k, _)| *k).collect())
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.0 {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_load_reads_file_named_by_env() {
    let file = config_file(CONFIG);
    let _env = EnvGuard::set(&[("LATTICE_CONFIG", file.path().to_str().unwrap())]);

    let config = LatticeConfig::load().unwrap();
    assert_eq!(config.environment, "staging");
    assert_eq!(config.pool.chain_id, 10);
    assert_eq!(config.pool.selection_mode, SelectionMode::PriorityLevel);
    assert_eq!(config.pool.poll_interval_ms, 2000);
    assert_eq!(config.nodes.len(), 2);
    assert_eq!(config.nodes[0].order, 1);
    assert_eq!(config.nodes[1].order, 100);
    assert!(config.nodes[1].send_only);
    assert_eq!(config.logging.format, "json");
    assert!(config.metrics.enabled);
    config.validate().unwrap();
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = config_file(CONFIG);
    let _env = EnvGuard::set(&[
        ("LATTICE__POOL__CHAIN_ID", "42161"),
        ("LATTICE__POOL__SELECTION_MODE", "RoundRobin"),
        ("LATTICE__METRICS__ENABLED", "false"),
    ]);

    let config = LatticeConfig::from_file(file.path()).unwrap();
    assert_eq!(config.pool.chain_id, 42161);
    assert_eq!(config.pool.selection_mode, SelectionMode::RoundRobin);
    assert!(!config.metrics.enabled);
    assert_eq!(config.pool.poll_failure_threshold, 3);
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = LatticeConfig::from_file(dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.environment, "development");
    assert_eq!(config.pool.chain_id, 1);
    assert!(config.nodes.is_empty());
    assert_eq!(config.validate().unwrap_err(), "No primary RPC nodes configured");
}

#[test]
#[serial]
fn test_malformed_file_is_an_error() {
    let file = config_file("[pool]\nchain_id = \"not a number\"\n");
    assert!(LatticeConfig::from_file(file.path()).is_err());
}

#[test]
fn test_validation_messages() {
    let cases = [
        (
            "[[nodes]]\nname = \"a\"\nhttp_url = \"http://a\"\n",
            "Primary node a requires a ws_url",
        ),
        (
            "[[nodes]]\nname = \"a\"\nws_url = \"ws://a\"\n[[nodes]]\nname = \"a\"\nws_url = \"ws://b\"\n",
            "Duplicate node name: a",
        ),
        (
            "[[nodes]]\nname = \"a\"\nws_url = \"ws://a\"\n[[nodes]]\nname = \"tx\"\nsend_only = true\n",
            "Send-only node tx requires an http_url",
        ),
        (
            "[[nodes]]\nname = \"a\"\nws_url = \"http://a\"\n",
            "Invalid WebSocket URL for node a: http://a",
        ),
        (
            "[pool]\nchain_id = 1\nsweep_interval_ms = 0\n[[nodes]]\nname = \"a\"\nws_url = \"ws://a\"\n",
            "Sweep interval must be greater than 0",
        ),
    ];

    for (toml_text, expected) in cases {
        let config: LatticeConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.validate().unwrap_err(), expected, "{toml_text}");
    }
}
