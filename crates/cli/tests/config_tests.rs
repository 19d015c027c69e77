//! Integration tests for configuration parsing
//!
//! Tests loopback tool configuration, including:
//! - Minimal and full TOML files
//! - Defaults for omitted sections
//! - Save and reload through a file
//! - Invalid configuration handling

use cli::config::LoopbackConfig;
use engine::BackendKind;
use protocol::EndpointType;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
[logging]
level = "debug"

[transport]
backend = "discard"
latency_ms = 5
fault_rate = 0.1
stalled_endpoints = [0x82]

[pipe]
out_endpoint = 0x02
in_endpoint = 0x83
max_packet_size = 64
transfer_type = "interrupt"

[scenario]
transfers = 16
buffer_size = 32
composite_children = 5
resubmit_count = 2
read_timeout_ms = 250
"#;

// ============================================================================
// Parsing Tests
// ============================================================================

#[test]
fn test_parse_empty_config_uses_defaults() {
    let config = LoopbackConfig::parse("").unwrap();
    assert_eq!(config, LoopbackConfig::default());
}

#[test]
fn test_parse_partial_config() {
    let config = LoopbackConfig::parse(
        r#"
[scenario]
transfers = 2
"#,
    )
    .unwrap();

    assert_eq!(config.scenario.transfers, 2);
    assert_eq!(config.scenario.buffer_size, 64);
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.pipe.in_endpoint, 0x81);
}

#[test]
fn test_parse_full_config() {
    let config = LoopbackConfig::parse(FULL_CONFIG).unwrap();

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.transport.backend, BackendKind::Discard);
    assert_eq!(config.transport.latency_ms, 5);
    assert_eq!(config.transport.stalled_endpoints, vec![0x82]);
    assert_eq!(config.pipe.out_endpoint, 0x02);
    assert_eq!(config.pipe.in_endpoint, 0x83);
    assert_eq!(config.pipe.max_packet_size, 64);
    assert_eq!(config.pipe.transfer_type, EndpointType::Interrupt);
    assert_eq!(config.scenario.transfers, 16);
    assert_eq!(config.scenario.composite_children, 5);
    assert_eq!(config.scenario.read_timeout_ms, 250);
}

#[test]
fn test_parse_rejects_invalid_values() {
    let invalid = [
        "[logging]\nlevel = \"loud\"",
        "[transport]\nfault_rate = 2.0",
        "[transport]\nbackend = \"usbfs\"",
        "[pipe]\nout_endpoint = 0x81",
        "[pipe]\nin_endpoint = 0x90",
        "[pipe]\nmax_packet_size = 0",
        "[scenario]\nbuffer_size = 0",
    ];
    for content in invalid {
        assert!(
            LoopbackConfig::parse(content).is_err(),
            "accepted invalid config: {}",
            content
        );
    }
}

// ============================================================================
// File Tests
// ============================================================================

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("loopback.toml");

    let mut config = LoopbackConfig::default();
    config.scenario.transfers = 3;
    config.transport.latency_ms = 7;
    config.save(&path).unwrap();

    let loaded = LoopbackConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempdir().unwrap();
    assert!(LoopbackConfig::load(Some(dir.path().join("missing.toml"))).is_err());
}

#[test]
fn test_load_reports_invalid_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[transport]\nfault_rate = -1.0\n").unwrap();

    let error = LoopbackConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", error).contains("fault rate"));
}

#[test]
fn test_default_path_names_tool() {
    let path = LoopbackConfig::default_path();
    assert!(path.ends_with("usb-irp/loopback.toml"));
}
