use std::time::Duration;

use serde::Deserialize;

use crate::broker::queue::{DEFAULT_RETRY_INTERVAL, QueueOptions};
use crate::broker::topic::TopicOptions;
use crate::persistence::sled_store::DEFAULT_PATH;
use crate::persistence::{StorageDriver, StorageOptions};
use crate::transport::acl::Acl;
use crate::utils::error::StorageError;

/// Top-level configuration for the application.
///
/// Includes the listening server, broker-wide defaults, and the queues and
/// topics to create at startup.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub queues: Vec<QueueSettings>,
    pub topics: Vec<TopicSettings>,
}

/// Address the server binds to and the prefix put in front of every route.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub route_prefix: String,
}

/// Defaults applied to every configured queue.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub retry_interval_secs: u64,
    pub ack_timeout_secs: Option<u64>,
    /// `memory` or `sled`.
    pub storage: String,
    pub storage_path: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    #[serde(default)]
    pub acl: Acl,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TopicSettings {
    pub name: String,
    #[serde(default)]
    pub acl: Acl,
}

/// Partial configuration loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub queues: Option<Vec<QueueSettings>>,
    pub topics: Option<Vec<TopicSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub route_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub retry_interval_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
    pub storage: Option<String>,
    pub storage_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                route_prefix: String::new(),
            },
            broker: BrokerSettings {
                retry_interval_secs: DEFAULT_RETRY_INTERVAL.as_secs(),
                ack_timeout_secs: None,
                storage: "memory".to_string(),
                storage_path: DEFAULT_PATH.to_string(),
            },
            queues: Vec::new(),
            topics: Vec::new(),
        }
    }
}

impl Settings {
    /// `host:port` to bind.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl BrokerSettings {
    /// Options for a queue guarded by `acl`, using the broker-wide storage
    /// and timing defaults.
    pub fn queue_options(&self, acl: Acl) -> Result<QueueOptions, StorageError> {
        let storage =
            StorageDriver::parse(&self.storage).ok_or_else(|| StorageError::InvalidOption {
                key: "storage".to_string(),
                reason: format!("unknown driver `{}`", self.storage),
            })?;

        let mut storage_options = StorageOptions::new();
        if storage == StorageDriver::Sled {
            storage_options.insert("path".to_string(), self.storage_path.clone());
        }

        Ok(QueueOptions {
            acl,
            storage,
            storage_options,
            // a zero period would make the retry interval panic
            retry_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            ack_timeout: self.ack_timeout_secs.map(Duration::from_secs),
        })
    }
}

impl TopicSettings {
    pub fn options(&self) -> TopicOptions {
        TopicOptions {
            acl: self.acl.clone(),
        }
    }
}
