use std::io::Write;

use trellis_core::config::AppConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
workers = 2
node_timeout_secs = 120
max_tool_rounds = 4

[model]
base_url = "http://localhost:11434/v1"
api_key = "sk-test-key"
default_model = "llama3.2"
max_tokens = 2048
temperature = 0.5

[retry]
max_retries = 5
initial_backoff_ms = 100

[queue]
visibility_timeout_secs = 30

[store]
path = "/tmp/trellis-test/engine.db"

[gateway]
bind = "0.0.0.0:9999"
token = "test-token"

[[gateway.api_keys]]
name = "ada"
key = "tk_ada"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.workers, 2);
    assert_eq!(config.engine.node_timeout_secs, 120);
    assert_eq!(config.engine.max_tool_rounds, 4);
    assert_eq!(config.model.base_url, "http://localhost:11434/v1");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.default_model, "llama3.2");
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.queue.visibility_timeout_secs, 30);
    assert_eq!(config.store.path, "/tmp/trellis-test/engine.db");

    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.bind, "0.0.0.0:9999");
    assert_eq!(gw.token.as_deref(), Some("test-token"));
    assert_eq!(gw.api_keys.len(), 1);
    assert_eq!(gw.api_keys[0].name, "ada");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("TRELLIS_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
api_key = "${TRELLIS_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("TRELLIS_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = "";

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.workers, 4);
    assert_eq!(config.engine.node_timeout_secs, 300);
    assert_eq!(config.engine.max_tool_rounds, 8);
    assert_eq!(config.engine.max_virtual_nodes, 20);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.initial_backoff_ms, 500);
    assert_eq!(config.model.request_timeout_secs, 30);
    assert_eq!(config.store.path, "data/trellis.db");
    assert!(config.gateway.is_none());
}

#[test]
fn test_missing_config_file_errors() {
    let result = AppConfig::load(std::path::Path::new("/nonexistent/trellis.toml"));
    assert!(result.is_err());
}
