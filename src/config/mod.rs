mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    DurableSettings, EphemeralSettings, PushSettings, ServerSettings, Settings,
};

/// Loads configuration from the default file and environment variables,
/// merging whatever is present over built-in defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;

    // Deserialize what is available; everything else comes from defaults.
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        server: merge_server(partial.server, default.server),
        durable: merge_durable(partial.durable, default.durable),
        ephemeral: merge_ephemeral(partial.ephemeral, default.ephemeral),
        push: merge_push(partial.push, default.push),
    })
}

fn merge_server(
    partial: Option<settings::PartialServerSettings>,
    default: ServerSettings,
) -> ServerSettings {
    let Some(p) = partial else { return default };
    ServerSettings {
        host: p.host.unwrap_or(default.host),
        port: p.port.unwrap_or(default.port),
        log_level: p.log_level.unwrap_or(default.log_level),
    }
}

fn merge_durable(
    partial: Option<settings::PartialDurableSettings>,
    default: DurableSettings,
) -> DurableSettings {
    let Some(p) = partial else { return default };
    DurableSettings {
        enabled: p.enabled.unwrap_or(default.enabled),
        url: p.url.unwrap_or(default.url),
        exchange: p.exchange.unwrap_or(default.exchange),
        prefetch: p.prefetch.unwrap_or(default.prefetch),
        message_ttl_secs: p.message_ttl_secs.or(default.message_ttl_secs),
    }
}

fn merge_ephemeral(
    partial: Option<settings::PartialEphemeralSettings>,
    default: EphemeralSettings,
) -> EphemeralSettings {
    let Some(p) = partial else { return default };
    EphemeralSettings {
        enabled: p.enabled.unwrap_or(default.enabled),
        persistence: p.persistence.unwrap_or(default.persistence),
        store_path: p.store_path.unwrap_or(default.store_path),
        replay_ttl_secs: p.replay_ttl_secs.or(default.replay_ttl_secs),
        replay_capacity: p.replay_capacity.unwrap_or(default.replay_capacity),
        poll_interval_ms: p.poll_interval_ms.unwrap_or(default.poll_interval_ms),
        retry_backoff_ms: p.retry_backoff_ms.unwrap_or(default.retry_backoff_ms),
    }
}

fn merge_push(
    partial: Option<settings::PartialPushSettings>,
    default: PushSettings,
) -> PushSettings {
    let Some(p) = partial else { return default };
    PushSettings {
        enabled: p.enabled.unwrap_or(default.enabled),
        max_connections: p.max_connections.unwrap_or(default.max_connections),
        queue_size: p.queue_size.unwrap_or(default.queue_size),
        ping_interval_secs: p.ping_interval_secs.unwrap_or(default.ping_interval_secs),
        connection_timeout_secs: p
            .connection_timeout_secs
            .unwrap_or(default.connection_timeout_secs),
        cleanup_interval_secs: p
            .cleanup_interval_secs
            .unwrap_or(default.cleanup_interval_secs),
    }
}
