use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the engine, connection health, the
/// consumer-side client and logging.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub connection: ConnectionSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Producer and delivery tuning for the engine.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    /// Delay between two producer ticks for one topic.
    pub tick_interval_ms: u64,
    /// Deadline after which a producer that ignores cancellation is aborted.
    pub producer_stop_timeout_ms: u64,
    /// Consecutive source failures tolerated before the topic is torn down.
    pub producer_max_retries: u32,
    pub producer_retry_base_ms: u64,
    pub producer_retry_max_ms: u64,
    /// Per-connection delivery buffer; the oldest update is dropped on overflow.
    pub outbox_capacity: usize,
}

/// Connection health parameters enforced by the server.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval_ms: u64,
    /// `0` disables the lifetime limit.
    pub max_connection_lifetime_ms: u64,
}

/// Settings for the consumer-side `ClientConnection`.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub url: String,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl EngineSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn producer_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_stop_timeout_ms)
    }
}

impl ConnectionSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn max_connection_lifetime(&self) -> Option<Duration> {
        (self.max_connection_lifetime_ms > 0)
            .then(|| Duration::from_millis(self.max_connection_lifetime_ms))
    }
}

impl ClientSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            producer_stop_timeout_ms: 3000,
            producer_max_retries: 5,
            producer_retry_base_ms: 250,
            producer_retry_max_ms: 5000,
            outbox_capacity: 1024,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            max_connection_lifetime_ms: 0,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            max_retries: None,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub engine: Option<PartialEngineSettings>,
    pub connection: Option<PartialConnectionSettings>,
    pub client: Option<PartialClientSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialEngineSettings {
    pub tick_interval_ms: Option<u64>,
    pub producer_stop_timeout_ms: Option<u64>,
    pub producer_max_retries: Option<u32>,
    pub producer_retry_base_ms: Option<u64>,
    pub producer_retry_max_ms: Option<u64>,
    pub outbox_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConnectionSettings {
    pub heartbeat_interval_ms: Option<u64>,
    pub max_connection_lifetime_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub url: Option<String>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Overlays the values present in `self` on top of `base`.
    pub fn merge_over(self, base: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let engine = self.engine.unwrap_or_default();
        let connection = self.connection.unwrap_or_default();
        let client = self.client.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(base.server.host),
                port: server.port.unwrap_or(base.server.port),
            },
            engine: EngineSettings {
                tick_interval_ms: engine
                    .tick_interval_ms
                    .unwrap_or(base.engine.tick_interval_ms),
                producer_stop_timeout_ms: engine
                    .producer_stop_timeout_ms
                    .unwrap_or(base.engine.producer_stop_timeout_ms),
                producer_max_retries: engine
                    .producer_max_retries
                    .unwrap_or(base.engine.producer_max_retries),
                producer_retry_base_ms: engine
                    .producer_retry_base_ms
                    .unwrap_or(base.engine.producer_retry_base_ms),
                producer_retry_max_ms: engine
                    .producer_retry_max_ms
                    .unwrap_or(base.engine.producer_retry_max_ms),
                outbox_capacity: engine
                    .outbox_capacity
                    .unwrap_or(base.engine.outbox_capacity),
            },
            connection: ConnectionSettings {
                heartbeat_interval_ms: connection
                    .heartbeat_interval_ms
                    .unwrap_or(base.connection.heartbeat_interval_ms),
                max_connection_lifetime_ms: connection
                    .max_connection_lifetime_ms
                    .unwrap_or(base.connection.max_connection_lifetime_ms),
            },
            client: ClientSettings {
                url: client.url.unwrap_or(base.client.url),
                max_retries: client.max_retries.or(base.client.max_retries),
                base_delay_ms: client.base_delay_ms.unwrap_or(base.client.base_delay_ms),
                max_delay_ms: client.max_delay_ms.unwrap_or(base.client.max_delay_ms),
                heartbeat_interval_ms: client
                    .heartbeat_interval_ms
                    .unwrap_or(base.client.heartbeat_interval_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(base.logging.level),
            },
        }
    }
}
