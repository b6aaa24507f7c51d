//! Integration tests for the configuration layers

use crate::integration::test_utils::{key_ring, with_xdg_env};
use context_broker::config::{BrokerConfig, ConfigLoader};
use context_broker::error::ConfigError;
use context_broker::ContextBroker;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_global_file_is_read_from_xdg_config_home() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    fs::create_dir_all(&workspace).unwrap();

    let config = with_xdg_env(&temp_dir, || {
        let global = ConfigLoader::global_config_path().unwrap();
        assert!(global.starts_with(temp_dir.path().join("xdg")));
        fs::create_dir_all(global.parent().unwrap()).unwrap();
        fs::write(
            &global,
            r#"
[broker]
vector_k = 64
admin_capability = "superuser"
"#,
        )
        .unwrap();
        ConfigLoader::load(&workspace).unwrap()
    });

    assert_eq!(config.broker.vector_k, 64);
    assert_eq!(config.broker.admin_capability, "superuser");
    assert_eq!(config.broker.lineage_depth, 3);
}

#[test]
fn test_environment_specific_workspace_file() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    fs::create_dir_all(workspace.join("config")).unwrap();
    fs::write(
        workspace.join("config").join("config.toml"),
        r#"
[broker]
exploration_fraction = 0.05
channel_timeout_ms = 500
"#,
    )
    .unwrap();
    fs::write(
        workspace.join("config").join("staging.toml"),
        r#"
[broker]
exploration_fraction = 0.1
"#,
    )
    .unwrap();

    let (development, staging) = with_xdg_env(&temp_dir, || {
        let development = ConfigLoader::load(&workspace).unwrap();
        std::env::set_var("CONTEXT_BROKER_ENV", "staging");
        let staging = ConfigLoader::load(&workspace).unwrap();
        (development, staging)
    });

    assert_eq!(development.broker.exploration_fraction, 0.05);
    assert_eq!(staging.broker.exploration_fraction, 0.1);
    assert_eq!(staging.broker.channel_timeout_ms, 500);
}

#[test]
fn test_invalid_workspace_file_reports_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    fs::create_dir_all(workspace.join("config")).unwrap();
    fs::write(
        workspace.join("config").join("config.toml"),
        r#"
[broker]
exploration_fraction = 0.5

[ledger]
writer_id = "bad:id"
"#,
    )
    .unwrap();

    let result = with_xdg_env(&temp_dir, || ConfigLoader::load(&workspace));
    match result {
        Err(ConfigError::Invalid(message)) => {
            assert!(message.contains("exploration_fraction"));
            assert!(message.contains("writer_id"));
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn test_file_config_drives_broker_layout() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("broker.toml");
    fs::write(
        &config_file,
        r#"
[ledger]
path = "state/lineage.ndjson"
writer_id = "node-a"

[storage]
bundle_store_path = "state/bundles"
frames_dir = "schema"

[logging]
level = "debug"
format = "json"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    assert_eq!(config.ledger.writer_id, "node-a");
    assert_eq!(config.logging.format, "json");
    assert_eq!(config.broker, BrokerConfig::default().broker);

    let broker = ContextBroker::open(temp_dir.path(), config, key_ring())
        .unwrap()
        .build();
    assert!(broker.store().is_empty());
    assert!(temp_dir.path().join("state").join("lineage.ndjson").exists());
    assert!(temp_dir.path().join("state").join("bundles").exists());
}
