use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{load_config, load_config_from};
use crate::persistence::StorageDriver;
use crate::transport::acl::{Ace, Acl};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.route_prefix, "");
    assert_eq!(settings.broker.retry_interval_secs, 5);
    assert_eq!(settings.broker.ack_timeout_secs, None);
    assert_eq!(settings.broker.storage, "memory");
    assert_eq!(settings.broker.storage_path, "wsqueue_db");
    assert!(settings.queues.is_empty());
    assert!(settings.topics.is_empty());
    assert_eq!(settings.address(), "127.0.0.1:8080");
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000
        route_prefix = "/bus"

        [broker]
        retry_interval_secs = 2
        ack_timeout_secs = 30
        storage = "sled"
        storage_path = "data/queues"

        [[queues]]
        name = "jobs"
        acl = [{ scheme = "DIGEST", username = "alice", password = "secret" }]

        [[queues]]
        name = "open"

        [[topics]]
        name = "news"
        acl = [{ scheme = "WORLD" }, { scheme = "IP", ip = "10.0.0.7" }]
    "#;
    fs::write(tmp.path().join("default.toml"), toml).expect("write config file");

    let stem = tmp.path().join("default");
    let cfg = load_config_from(stem.to_str().expect("utf-8 path")).expect("load_config failed");

    assert_eq!(cfg.address(), "0.0.0.0:9000");
    assert_eq!(cfg.server.route_prefix, "/bus");
    assert_eq!(cfg.broker.retry_interval_secs, 2);
    assert_eq!(cfg.broker.ack_timeout_secs, Some(30));
    assert_eq!(cfg.broker.storage, "sled");
    assert_eq!(cfg.broker.storage_path, "data/queues");

    assert_eq!(cfg.queues.len(), 2);
    assert_eq!(cfg.queues[0].name, "jobs");
    assert_eq!(
        cfg.queues[0].acl,
        Acl::new(vec![Ace::Digest {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }])
    );
    assert!(cfg.queues[1].acl.is_empty());

    assert_eq!(cfg.topics[0].name, "news");
    assert_eq!(
        cfg.topics[0].options().acl,
        Acl::new(vec![
            Ace::World,
            Ace::Ip {
                ip: "10.0.0.7".to_string()
            },
        ])
    );
}

#[test]
#[serial]
fn test_partial_file_keeps_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    fs::write(tmp.path().join("default.toml"), "[server]\nport = 9001\n")
        .expect("write config file");

    let stem = tmp.path().join("default");
    let cfg = load_config_from(stem.to_str().expect("utf-8 path")).expect("load_config failed");

    assert_eq!(cfg.server.port, 9001);
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.broker, Settings::default().broker);
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("WSQUEUE_SERVER__PORT", Some("9100")),
            ("WSQUEUE_BROKER__RETRY_INTERVAL_SECS", Some("7")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.broker.retry_interval_secs, 7);
            assert_eq!(cfg.server.host, "127.0.0.1");
        },
    );
}

#[test]
fn test_queue_options_from_broker_settings() {
    let mut broker = Settings::default().broker;
    broker.ack_timeout_secs = Some(10);

    let options = broker.queue_options(Acl::world()).expect("memory driver");
    assert_eq!(options.storage, StorageDriver::Memory);
    assert!(options.storage_options.is_empty());
    assert_eq!(options.retry_interval, Duration::from_secs(5));
    assert_eq!(options.ack_timeout, Some(Duration::from_secs(10)));
    assert_eq!(options.acl, Acl::world());

    broker.storage = "SLED".to_string();
    broker.retry_interval_secs = 0;
    let options = broker.queue_options(Acl::default()).expect("sled driver");
    assert_eq!(options.storage, StorageDriver::Sled);
    assert_eq!(
        options.storage_options.get("path").map(String::as_str),
        Some("wsqueue_db")
    );
    assert_eq!(options.retry_interval, Duration::from_secs(1));
}

#[test]
fn test_unknown_storage_driver_is_rejected() {
    let mut broker = Settings::default().broker;
    broker.storage = "redis".to_string();
    let err = broker.queue_options(Acl::default()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid storage option `storage`: unknown driver `redis`"
    );
}
