//! Process configuration.
//!
//! Values only; callers decide where they come from. [`Config::from_env`]
//! covers the common case of a JSON blob in the environment.

use crate::codec::WireFormat;
use crate::error::{DispatchError, Result};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the JSON settings.
pub const SETTINGS_ENV: &str = "CHANGEFEED_SETTINGS";

/// Environment variable overriding `connection.url`.
pub const URL_ENV: &str = "CHANGEFEED_URL";

/// Callback for a connection lifecycle event.
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Callback for a connection error.
pub type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log every received event at debug level.
    pub debug: bool,

    /// Whether the calling layer replaces the default mutation publish path.
    /// Not read by the dispatcher; carried for the embedding layer.
    pub override_publish_function: bool,

    /// Behaviour of mutations that don't say otherwise.
    pub mutation_defaults: MutationDefaults,

    /// Whether the embedding layer hands these settings on to the stores it
    /// wraps. Not read by the dispatcher.
    pub pass_config_down: bool,

    pub connection: ConnectionConfig,

    /// Prepended to every channel name handed to the transport.
    pub global_prefix: String,

    /// Another process pushes our changes to the transport; never publish.
    pub external_publisher: bool,

    pub wire_format: WireFormat,

    #[serde(skip)]
    pub hooks: LifecycleHooks,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            override_publish_function: true,
            mutation_defaults: MutationDefaults::default(),
            pass_config_down: false,
            connection: ConnectionConfig::default(),
            global_prefix: String::new(),
            external_publisher: false,
            wire_format: WireFormat::Json,
            hooks: LifecycleHooks::default(),
        }
    }
}

impl Config {
    /// Parse settings from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from [`SETTINGS_ENV`] and [`URL_ENV`].
    ///
    /// Returns `Ok(None)` when neither variable is set.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_sources(
            std::env::var(SETTINGS_ENV).ok(),
            std::env::var(URL_ENV).ok(),
        )
    }

    fn from_sources(settings: Option<String>, url: Option<String>) -> Result<Option<Self>> {
        let mut config = match settings {
            Some(json) => Some(Self::from_json(&json)?),
            None => None,
        };

        if let Some(url) = url {
            config.get_or_insert_with(Config::default).connection.url = Some(url);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.ping_interval_ms == 0 {
            return Err(DispatchError::Config(
                "connection.ping_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Channel name as seen by the transport.
    pub fn transport_channel(&self, channel: &str) -> String {
        format!("{}{}", self.global_prefix, channel)
    }
}

/// Default flags for mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MutationDefaults {
    /// Publish the change on the transport.
    pub push_to_transport: bool,
    /// Apply the change to local subscribers before the round trip.
    pub optimistic: bool,
}

impl Default for MutationDefaults {
    fn default() -> Self {
        Self {
            push_to_transport: true,
            optimistic: true,
        }
    }
}

/// Settings shared by the publish and subscribe connections.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker address; `None` leaves the choice to the [`Connector`](crate::Connector).
    pub url: Option<String>,
    /// Give up opening a connection after this long.
    pub connect_timeout_ms: u64,
    /// Idle time after which a socket is considered dead.
    pub socket_timeout_ms: u64,
    /// TCP keep-alive interval.
    pub keep_alive_ms: u64,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Delay between the end of one liveness probe and the start of the next.
    pub ping_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_ms: 3_000,
            socket_timeout_ms: 3_000,
            keep_alive_ms: 5_000,
            no_delay: true,
            ping_interval_ms: 2_000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Process-wide connection lifecycle callbacks.
///
/// Unset hooks fall back to a log line.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub connect: Option<LifecycleHook>,
    pub ready: Option<LifecycleHook>,
    pub reconnecting: Option<LifecycleHook>,
    pub end: Option<LifecycleHook>,
    pub error: Option<ErrorHook>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("connect", &self.connect.is_some())
            .field("ready", &self.ready.is_some())
            .field("reconnecting", &self.reconnecting.is_some())
            .field("end", &self.end.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}
