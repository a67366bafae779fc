//! Event bus configuration.
//!
//! Configuration is loaded from environment variables with defaults suited to
//! the docker-compose development stack.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default timeout for a broker to acknowledge a publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single consumer poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on joining a consumer task during shutdown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on establishing a broker connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport backing the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// In-process bus, no network dependency.
    Memory,
    /// Kafka topics with one consumer per subscribed topic.
    Kafka,
    /// Redis pub/sub channels.
    Redis,
}

impl BusKind {
    /// Configuration name of the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::Memory => "memory",
            BusKind::Kafka => "kafka",
            BusKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BusKind::Memory),
            "kafka" => Ok(BusKind::Kafka),
            "redis" => Ok(BusKind::Redis),
            other => Err(ConfigError::InvalidValue {
                key: "EVENT_BUS_IMPLEMENTATION".to_string(),
                message: format!("unknown implementation '{other}', expected kafka, redis or memory"),
            }),
        }
    }
}

/// Kafka connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap server list (e.g., "kafka:29092").
    pub bootstrap_servers: String,

    /// Producer client id; the admin client uses `{client_id}-admin`.
    pub client_id: String,

    /// Consumer group shared by every per-topic consumer.
    pub group_id: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "kafka:29092".to_string(),
            client_id: "verseforge-client".to_string(),
            group_id: "verseforge-consumer-group".to_string(),
        }
    }
}

/// Redis connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host.
    pub host: String,

    /// Redis port.
    pub port: u16,

    /// Database index.
    pub db: i64,

    /// Optional password.
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "redis".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Timeouts bounding every blocking step of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Broker acknowledgement bound for `publish`.
    pub publish: Duration,

    /// Bound on a single consumer poll; `stop` is observed within one interval.
    pub poll_interval: Duration,

    /// Bound on joining each consumer task during shutdown.
    pub join: Duration,

    /// Bound on reaching the broker during `start`.
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            publish: DEFAULT_PUBLISH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join: DEFAULT_JOIN_TIMEOUT,
            connect: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Complete event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Which backend to build.
    pub implementation: BusKind,

    /// Kafka settings, used when `implementation` is `Kafka`.
    pub kafka: KafkaConfig,

    /// Redis settings, used when `implementation` is `Redis`.
    pub redis: RedisConfig,

    /// Operation timeouts.
    pub timeouts: Timeouts,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            implementation: BusKind::Memory,
            kafka: KafkaConfig::default(),
            redis: RedisConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl BusConfig {
    /// Configuration for the given backend with default settings.
    pub fn new(implementation: BusKind) -> Self {
        Self {
            implementation,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EVENT_BUS_IMPLEMENTATION`: `kafka`, `redis` or `memory` (default: memory)
    /// - `KAFKA_BOOTSTRAP_SERVERS`: Kafka bootstrap servers (default: kafka:29092)
    /// - `KAFKA_CLIENT_ID`: Kafka client id (default: verseforge-client)
    /// - `KAFKA_GROUP_ID`: Kafka consumer group (default: verseforge-consumer-group)
    /// - `REDIS_HOST`: Redis host (default: redis)
    /// - `REDIS_PORT`: Redis port (default: 6379)
    /// - `REDIS_DB`: Redis database index (default: 0)
    /// - `REDIS_PASSWORD`: Redis password
    /// - `EVENT_BUS_PUBLISH_TIMEOUT_MS`: publish acknowledgement bound (default: 10000)
    /// - `EVENT_BUS_POLL_INTERVAL_MS`: consumer poll bound (default: 1000)
    /// - `EVENT_BUS_JOIN_TIMEOUT_MS`: consumer join bound (default: 5000)
    /// - `EVENT_BUS_CONNECT_TIMEOUT_MS`: connection bound (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let implementation = match lookup("EVENT_BUS_IMPLEMENTATION") {
            Some(name) => name.parse()?,
            None => default.implementation,
        };

        Ok(Self {
            implementation,
            kafka: KafkaConfig {
                bootstrap_servers: lookup("KAFKA_BOOTSTRAP_SERVERS")
                    .unwrap_or(default.kafka.bootstrap_servers),
                client_id: lookup("KAFKA_CLIENT_ID").unwrap_or(default.kafka.client_id),
                group_id: lookup("KAFKA_GROUP_ID").unwrap_or(default.kafka.group_id),
            },
            redis: RedisConfig {
                host: lookup("REDIS_HOST").unwrap_or(default.redis.host),
                port: parse_var(&lookup, "REDIS_PORT")?.unwrap_or(default.redis.port),
                db: parse_var(&lookup, "REDIS_DB")?.unwrap_or(default.redis.db),
                password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
            },
            timeouts: Timeouts {
                publish: millis_var(&lookup, "EVENT_BUS_PUBLISH_TIMEOUT_MS")?
                    .unwrap_or(default.timeouts.publish),
                poll_interval: millis_var(&lookup, "EVENT_BUS_POLL_INTERVAL_MS")?
                    .unwrap_or(default.timeouts.poll_interval),
                join: millis_var(&lookup, "EVENT_BUS_JOIN_TIMEOUT_MS")?
                    .unwrap_or(default.timeouts.join),
                connect: millis_var(&lookup, "EVENT_BUS_CONNECT_TIMEOUT_MS")?
                    .unwrap_or(default.timeouts.connect),
            },
        })
    }

    /// Override the Kafka client identity.
    ///
    /// The standalone server and application clients join different groups.
    pub fn with_kafka_identity(mut self, client_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        self.kafka.client_id = client_id.into();
        self.kafka.group_id = group_id.into();
        self
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn millis_var<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<F, u64>(lookup, key)?.map(Duration::from_millis))
}
