//! Configuration tests

use super::*;

#[test]
fn defaults_apply() {
    let config = Config::parse("listen = \":1883\"").unwrap();
    assert_eq!(config.listen, ":1883");
    assert_eq!(config.websockets.path, "/ws");
    assert_eq!(config.storage.path, ".sessions.store");
    assert!(config.plugins.is_empty());
    assert!(!config.tls.enabled());
    assert!(!config.websockets.wss.enabled());
}

#[test]
fn full_document_parses() {
    let config = Config::parse(
        r#"
listen = ":1883"
plugins = ["audit", "auth"]

[tls]
listen = ":8883"
cert = "/etc/embermq/cert.pem"
key = "/etc/embermq/key.pem"

[websockets]
listen = ":8083"
path = "/mqtt"
reject_empty_origin = true
origins = ["https://example.com"]

[websockets.wss]
listen = ":8084"
cert = "/etc/embermq/cert.pem"
key = "/etc/embermq/key.pem"

[logging]
log_level = "info"
filename = "broker.log"
max_size = 10
max_backups = 5
max_age = 7
enable_compression = false

[storage]
path = "/var/lib/embermq/sessions"
"#,
    )
    .unwrap();

    assert!(config.tls.enabled());
    assert_eq!(config.websockets.listen, ":8083");
    assert_eq!(config.websockets.path, "/mqtt");
    assert!(config.websockets.reject_empty_origin);
    assert_eq!(config.websockets.origins.len(), 1);
    assert!(config.websockets.wss.enabled());
    assert_eq!(config.logging.level(), tracing::Level::INFO);
    assert_eq!(config.logging.max_size, 10);
    assert_eq!(config.plugins, vec!["audit", "auth"]);
    assert_eq!(config.storage.path, "/var/lib/embermq/sessions");
}

#[test]
fn tls_requires_all_three_fields() {
    let config = Config::parse(
        r#"
listen = ":1883"

[tls]
listen = ":8883"
cert = "/etc/cert.pem"
"#,
    )
    .unwrap();

    // Partial TLS config means the TLS listener stays disabled
    assert!(!config.tls.enabled());
}

#[test]
fn unknown_log_level_coerces_to_error() {
    let config = Config::parse(
        r#"
listen = ":1883"

[logging]
log_level = "verbose"
"#,
    )
    .unwrap();

    assert_eq!(config.logging.level(), tracing::Level::ERROR);
}

#[test]
fn fatal_maps_to_error_level() {
    let config = Config::parse(
        r#"
listen = ":1883"

[logging]
log_level = "fatal"
"#,
    )
    .unwrap();

    assert_eq!(config.logging.level(), tracing::Level::ERROR);
}

#[test]
fn rejects_no_listeners() {
    let err = Config::parse("listen = \"\"").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn env_substitution() {
    std::env::set_var("EMBERMQ_TEST_PORT", ":2883");
    let content = substitute_env_vars("listen = \"${EMBERMQ_TEST_PORT}\"");
    assert_eq!(content, "listen = \":2883\"");

    let content = substitute_env_vars("listen = \"${EMBERMQ_UNSET_VAR:-:1883}\"");
    assert_eq!(content, "listen = \":1883\"");
}

#[test]
fn bind_addr_expands_bare_port() {
    assert_eq!(bind_addr(":1883"), "0.0.0.0:1883");
    assert_eq!(bind_addr("127.0.0.1:1883"), "127.0.0.1:1883");
}
