//! Daemon configuration.
//!
//! Loads process-level settings and the bootstrap manager from
//! environment variables. Additional managers are created at runtime
//! through the supervisor's control surface.

use std::env;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::wire::intents;

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Bootstrap manager started when the daemon boots.
    pub manager: ManagerConfig,

    /// NATS server URL(s) - comma-separated for multiple servers.
    /// When unset, events drain into a local channel (local mode).
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port.
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Upper bound on concurrent dispatches across all managers.
    pub dispatch_pool_size: usize,
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let identifier = env::var("MANAGER_IDENTIFIER").unwrap_or_else(|_| "courier".to_string());
        let display_name =
            env::var("MANAGER_DISPLAY_NAME").unwrap_or_else(|_| identifier.clone());

        let shard_count = env::var("SHARD_COUNT")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("SHARD_COUNT must be a valid number: {e}")))?;

        let auto_sharded = env::var("AUTO_SHARDED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let intents = env::var("GATEWAY_INTENTS")
            .ok()
            .map(|v| {
                v.parse().map_err(|e| {
                    GatewayError::Config(format!("GATEWAY_INTENTS must be a valid bitfield: {e}"))
                })
            })
            .transpose()?
            .unwrap_or(intents::GUILDS | intents::GUILD_MEMBERS);

        let gateway_url =
            env::var("GATEWAY_URL").unwrap_or_else(|_| "wss://gateway.discord.gg".to_string());

        let nats_url = env::var("NATS_URL").ok();

        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| {
                GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}"))
            })?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dispatch_pool_size = env::var("DISPATCH_POOL_SIZE")
            .unwrap_or_else(|_| "512".to_string())
            .parse()
            .map_err(|e| {
                GatewayError::Config(format!("DISPATCH_POOL_SIZE must be a valid number: {e}"))
            })?;

        let manager = ManagerConfig {
            identifier,
            display_name,
            token,
            bot: BotConfig {
                intents,
                ..BotConfig::default()
            },
            sharding: ShardingConfig {
                auto_sharded,
                shard_count,
            },
            messaging: MessagingConfig {
                client_name: env::var("CLIENT_NAME").unwrap_or_else(|_| "courier".to_string()),
                channel_name: env::var("CHANNEL_NAME").unwrap_or_else(|_| "courier".to_string()),
                use_random_suffix: true,
            },
            events: EventConfig::default(),
            gateway: GatewayDescriptor {
                url: gateway_url,
                ..GatewayDescriptor::default()
            },
        };

        Ok(Self {
            manager,
            nats_url,
            http_port,
            log_level,
            dispatch_pool_size,
        })
    }
}

/// Configuration for one bot identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub identifier: String,
    pub display_name: String,
    pub token: String,

    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub gateway: GatewayDescriptor,
}

impl ManagerConfig {
    /// Fill in defaults and reject configurations the daemon cannot run
    /// with. Mirrors what the control surface applies on every mutation.
    pub fn normalize(&mut self) -> Result<(), GatewayError> {
        self.token = self.token.trim().to_string();
        if self.token.is_empty() {
            return Err(GatewayError::Config(
                "manager configuration missing token".to_string(),
            ));
        }

        if self.identifier.trim().is_empty() {
            return Err(GatewayError::Config(
                "manager configuration missing identifier".to_string(),
            ));
        }

        if self.messaging.client_name.trim().is_empty() {
            return Err(GatewayError::Config(
                "manager missing messaging client name".to_string(),
            ));
        }

        if self.bot.max_heartbeat_failures < 1 {
            self.bot.max_heartbeat_failures = 1;
        }

        if self.bot.retries < 1 {
            self.bot.retries = 1;
        }

        Ok(())
    }
}

/// Bot behavior on the gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub compression: bool,
    pub guild_subscriptions: bool,
    /// Reconnect attempts before a shard gives up and stops its group.
    pub retries: i32,
    pub intents: u64,
    pub large_threshold: u32,
    pub max_heartbeat_failures: u32,
    #[serde(default)]
    pub default_presence: Option<Value>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            compression: false,
            guild_subscriptions: true,
            retries: 5,
            intents: intents::GUILDS | intents::GUILD_MEMBERS,
            large_threshold: 250,
            max_heartbeat_failures: 5,
            default_presence: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub auto_sharded: bool,
    pub shard_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub client_name: String,
    pub channel_name: String,
    /// Append a random number to the client name to reduce the
    /// likelihood of clashing cluster ids.
    pub use_random_suffix: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            client_name: "courier".to_string(),
            channel_name: "courier".to_string(),
            use_random_suffix: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    /// Events completely ignored.
    #[serde(default)]
    pub event_blacklist: Vec<String>,
    /// Events not sent to consumers (state update still runs).
    #[serde(default)]
    pub produce_blacklist: Vec<String>,
}

/// What the gateway told us about itself: where to connect and how many
/// fresh sessions we may start. Normally fetched from the REST API by a
/// collaborator; refreshed through the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayDescriptor {
    pub url: String,
    /// Recommended shard count.
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

impl Default for GatewayDescriptor {
    fn default() -> Self {
        Self {
            url: "wss://gateway.discord.gg".to_string(),
            shards: 1,
            session_start_limit: SessionStartLimit::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: i64,
    pub remaining: i64,
    /// Milliseconds until the budget resets.
    pub reset_after: i64,
    pub max_concurrency: u32,
}

impl Default for SessionStartLimit {
    fn default() -> Self {
        Self {
            total: 1000,
            remaining: 1000,
            reset_after: 0,
            max_concurrency: 1,
        }
    }
}
