mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, QueueSettings, ServerSettings, Settings, TopicSettings,
};

/// Loads `config/default.{toml,yaml,json,…}` (optional) and `WSQUEUE_*`
/// environment variables, merged over `Settings::default()`.
///
/// Nested keys use a double underscore, e.g. `WSQUEUE_SERVER__PORT=9000`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("WSQUEUE")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            route_prefix: server
                .as_ref()
                .and_then(|s| s.route_prefix.clone())
                .unwrap_or(default.server.route_prefix),
        },
        broker: BrokerSettings {
            retry_interval_secs: broker
                .as_ref()
                .and_then(|b| b.retry_interval_secs)
                .unwrap_or(default.broker.retry_interval_secs),
            ack_timeout_secs: broker
                .as_ref()
                .and_then(|b| b.ack_timeout_secs)
                .or(default.broker.ack_timeout_secs),
            storage: broker
                .as_ref()
                .and_then(|b| b.storage.clone())
                .unwrap_or(default.broker.storage),
            storage_path: broker
                .as_ref()
                .and_then(|b| b.storage_path.clone())
                .unwrap_or(default.broker.storage_path),
        },
        queues: partial.queues.unwrap_or(default.queues),
        topics: partial.topics.unwrap_or(default.topics),
    }
}

#[cfg(test)]
mod tests;
