//! ---
//! aasb_section: "15-testing-qa-runbook"
//! aasb_subsection: "integration-tests"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Shipped configuration files load and validate."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use aasb_common::{AppConfig, LogFormat};
use aasb_msg::TransportKind;

fn workspace_file(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

#[test]
fn example_config_is_valid() {
    let config = AppConfig::from_path(&workspace_file("configs/aasb.example.toml"))
        .expect("example config loads");
    assert_eq!(config.broker.default_reply_timeout, Duration::from_millis(500));
    assert_eq!(config.transport.kind, TransportKind::UnixSocket);
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert!(config.metrics.enabled);
    assert!(config.journal.enabled);
    assert_eq!(config.responders.len(), 2);
    let responder = config
        .responder("AlexaClient", "GetState")
        .expect("state responder");
    assert_eq!(responder.payload, r#"{"state":"IDLE"}"#);
}

#[test]
fn example_config_round_trips_through_toml() {
    let config = AppConfig::from_path(&workspace_file("configs/aasb.example.toml"))
        .expect("example config loads");
    let rendered = toml::to_string(&config).expect("render");
    let reparsed: AppConfig = rendered.parse().expect("reparse");
    assert_eq!(reparsed.broker, config.broker);
    assert_eq!(reparsed.transport, config.transport);
    assert_eq!(reparsed.responders, config.responders);
}
