//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use covert_mux::config::{TunnelConfig, MAX_OBFS_LEVEL, PLUGGABLE_LISTEN_ADDRESS};
use covert_mux::core::token::TransportMode;
use std::time::Duration;
use tracing::Level;

fn has_error(config: &TunnelConfig, needle: &str) -> bool {
    config.validate().iter().any(|e| e.contains(needle))
}

#[test]
fn test_default_config_validates() {
    let config = TunnelConfig::default();
    let errors = config.validate();
    assert!(errors.is_empty(), "Default config should be valid, got: {errors:?}");
}

#[test]
fn test_empty_control_domain() {
    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.ctl_domain = ".".into());
    assert!(has_error(&config, "Control domain cannot be empty"));
}

#[test]
fn test_control_domain_with_empty_label() {
    let config =
        TunnelConfig::default_with_overrides(|c| c.coordinator.ctl_domain = "ctl..example".into());
    assert!(has_error(&config, "Invalid control domain"));
}

#[test]
fn test_resolvers_required_and_parsed() {
    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.resolvers.clear());
    assert!(has_error(&config, "At least one resolver"));

    let config = TunnelConfig::default_with_overrides(|c| {
        c.coordinator.resolvers = vec!["8.8.8.8".into()];
    });
    assert!(has_error(&config, "Invalid resolver address"));
}

#[test]
fn test_req_num_bounds() {
    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.req_num = 0);
    assert!(has_error(&config, "req_num must be greater than 0"));

    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.req_num = 256);
    assert!(has_error(&config, "req_num too large"));

    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.req_num = 255);
    assert!(config.validate().is_empty());
}

#[test]
fn test_request_interval_bounds() {
    let config = TunnelConfig::default_with_overrides(|c| {
        c.coordinator.request_interval = Duration::from_millis(1);
    });
    assert!(has_error(&config, "Request interval too short"));

    let config = TunnelConfig::default_with_overrides(|c| {
        c.coordinator.request_interval = Duration::from_secs(120);
    });
    assert!(has_error(&config, "Request interval too long"));
}

#[test]
fn test_obfuscation_levels() {
    let config = TunnelConfig::default_with_overrides(|c| {
        c.coordinator.obfs_level = MAX_OBFS_LEVEL + 1;
    });
    assert!(has_error(&config, "Invalid obfuscation level"));

    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.obfs_level = 1);
    assert!(has_error(&config, "certificate must be specified"));

    let config = TunnelConfig::default_with_overrides(|c| {
        c.coordinator.obfs_level = 2;
        c.coordinator.certificate = Some("cert=abc".into());
    });
    assert!(config.validate().is_empty());

    // padding-only level needs no certificate
    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.obfs_level = 3);
    assert!(config.validate().is_empty());
}

#[test]
fn test_effective_listen_address_follows_obfuscation() {
    let mut config = TunnelConfig::default();
    assert_eq!(config.effective_listen_address(), "0.0.0.0:8000");

    config.coordinator.obfs_level = 3;
    assert_eq!(config.effective_listen_address(), PLUGGABLE_LISTEN_ADDRESS);
}

#[test]
fn test_invalid_requester_ip() {
    let config =
        TunnelConfig::default_with_overrides(|c| c.coordinator.requester_ip = "not-an-ip".into());
    assert!(has_error(&config, "Invalid requester IP"));
}

#[test]
fn test_listener_address() {
    let config = TunnelConfig::default_with_overrides(|c| c.listener.address = String::new());
    assert!(has_error(&config, "Listen address cannot be empty"));

    let config =
        TunnelConfig::default_with_overrides(|c| c.listener.address = "localhost".into());
    assert!(has_error(&config, "Invalid listen address format"));
}

#[test]
fn test_handshake_timing() {
    let config = TunnelConfig::default_with_overrides(|c| {
        c.listener.handshake_timeout = Duration::from_millis(50);
    });
    assert!(has_error(&config, "Handshake timeout too short"));

    let config = TunnelConfig::default_with_overrides(|c| {
        c.listener.handshake_timeout = Duration::from_secs(1);
        c.listener.handshake_initial_delay = Duration::from_secs(2);
    });
    assert!(has_error(&config, "initial delay must be shorter"));

    let config = TunnelConfig::default_with_overrides(|c| c.listener.max_empty_reads = 0);
    assert!(has_error(&config, "max_empty_reads"));
}

#[test]
fn test_key_material_validation() {
    let config = TunnelConfig::default_with_overrides(|c| {
        c.keys.local_secret = Some("zz".into());
    });
    assert!(has_error(&config, "keys.local_secret"));

    let config = TunnelConfig::default_with_overrides(|c| {
        c.keys.local_secret = Some("11".repeat(32));
    });
    assert!(config.validate().is_empty());
    assert!(config.keys.local_secret().is_ok());
    assert!(config.keys.remote_public().is_err());
}

#[test]
fn test_multiple_errors_reported() {
    let config = TunnelConfig::default_with_overrides(|c| {
        c.coordinator.req_num = 0;
        c.coordinator.resolvers.clear();
        c.listener.address = String::new();
    });
    assert!(config.validate().len() >= 3);
}

#[test]
fn test_validate_strict() {
    assert!(TunnelConfig::default().validate_strict().is_ok());

    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.swapcount = 0);
    let err = config.validate_strict().unwrap_err();
    assert!(err.to_string().contains("swapcount"));
}

#[test]
fn test_toml_partial_sections_use_defaults() {
    let config = TunnelConfig::from_toml(
        r#"
        [coordinator]
        ctl_domain = "t.example.org"
        resolvers = ["1.1.1.1:53", "9.9.9.9:53"]
        req_num = 4
        request_interval = 250
        swapcount = 2
        mode = "gae"
        obfs_level = 0
        requester_ip = "10.1.2.3"
        "#,
    )
    .unwrap();

    assert_eq!(config.coordinator.req_num, 4);
    assert_eq!(config.coordinator.mode, TransportMode::Gae);
    assert_eq!(config.coordinator.request_interval, Duration::from_millis(250));
    assert_eq!(config.listener.address, "0.0.0.0:8000");
    assert_eq!(config.logging.log_level, Level::INFO);
    assert!(config.validate().is_empty());
}

#[test]
fn test_example_config_parses() {
    let example = TunnelConfig::example_config();
    let parsed = TunnelConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_save_and_load_file() {
    let path = std::env::temp_dir().join(format!("covert-mux-{}.toml", std::process::id()));
    let config = TunnelConfig::default_with_overrides(|c| c.coordinator.req_num = 7);
    config.save_to_file(&path).unwrap();

    let loaded = TunnelConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded.coordinator.req_num, 7);
}

#[test]
fn test_missing_file_is_config_error() {
    let err = TunnelConfig::from_file("/nonexistent/covert-mux.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}
