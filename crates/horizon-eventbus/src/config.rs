//! Kafka connection configuration and bus tuning options.

use crate::error::BusError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Security protocol for Kafka connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// Plaintext connection (no encryption or auth).
    Plaintext,
    /// SSL encryption without SASL auth.
    Ssl,
    /// SASL authentication without encryption.
    SaslPlaintext,
    /// SASL authentication with SSL encryption.
    SaslSsl,
}

impl FromStr for SecurityProtocol {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(BusError::ConfigInvalid {
                var: "KAFKA_SECURITY_PROTOCOL".to_string(),
                reason: format!("Unknown protocol: {s}"),
            }),
        }
    }
}

impl SecurityProtocol {
    /// Convert to rdkafka string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    fn requires_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// SASL mechanism for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl FromStr for SaslMechanism {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM_SHA_256" => Ok(Self::ScramSha256),
            "SCRAM_SHA_512" => Ok(Self::ScramSha512),
            _ => Err(BusError::ConfigInvalid {
                var: "KAFKA_SASL_MECHANISM".to_string(),
                reason: format!("Unknown mechanism: {s}"),
            }),
        }
    }
}

impl SaslMechanism {
    /// Convert to rdkafka string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL credentials for authentication.
#[derive(Clone)]
pub struct SaslCredentials {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Kafka connection configuration.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses.
    pub bootstrap_servers: String,
    /// Security protocol.
    pub security_protocol: SecurityProtocol,
    /// SASL credentials (required if using SASL).
    pub sasl: Option<SaslCredentials>,
    /// Client identifier.
    pub client_id: String,
}

impl KafkaConfig {
    /// Plaintext configuration for a single broker address (`host:port`).
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            security_protocol: SecurityProtocol::Plaintext,
            sasl: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `KAFKA_BOOTSTRAP_SERVERS`: Comma-separated broker list
    ///
    /// Optional:
    /// - `KAFKA_SECURITY_PROTOCOL`: PLAINTEXT (default), SSL, `SASL_PLAINTEXT`, `SASL_SSL`
    /// - `KAFKA_CLIENT_ID`: Client identifier (default: "horizon-eventbus")
    /// - `KAFKA_SASL_MECHANISM`: PLAIN, SCRAM-SHA-256, SCRAM-SHA-512 (required if SASL)
    /// - `KAFKA_SASL_USERNAME`: SASL username (required if SASL)
    /// - `KAFKA_SASL_PASSWORD`: SASL password (required if SASL)
    pub fn from_env() -> Result<Self, BusError> {
        let bootstrap_servers = required_var("KAFKA_BOOTSTRAP_SERVERS")?;

        let security_protocol = match env::var("KAFKA_SECURITY_PROTOCOL") {
            Ok(v) => SecurityProtocol::from_str(&v)?,
            Err(_) => SecurityProtocol::Plaintext,
        };

        let client_id =
            env::var("KAFKA_CLIENT_ID").unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string());

        let sasl = if security_protocol.requires_sasl() {
            Some(SaslCredentials {
                mechanism: SaslMechanism::from_str(&required_var("KAFKA_SASL_MECHANISM")?)?,
                username: required_var("KAFKA_SASL_USERNAME")?,
                password: required_var("KAFKA_SASL_PASSWORD")?,
            })
        } else {
            None
        };

        Ok(Self {
            bootstrap_servers,
            security_protocol,
            sasl,
            client_id,
        })
    }

    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> KafkaConfigBuilder {
        KafkaConfigBuilder::new()
    }
}

const DEFAULT_CLIENT_ID: &str = "horizon-eventbus";

fn required_var(var: &str) -> Result<String, BusError> {
    env::var(var).map_err(|_| BusError::ConfigMissing {
        var: var.to_string(),
    })
}

/// Builder for `KafkaConfig`.
#[derive(Debug, Default)]
pub struct KafkaConfigBuilder {
    bootstrap_servers: Option<String>,
    security_protocol: Option<SecurityProtocol>,
    sasl: Option<SaslCredentials>,
    client_id: Option<String>,
}

impl KafkaConfigBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bootstrap servers.
    pub fn bootstrap_servers(mut self, servers: impl Into<String>) -> Self {
        self.bootstrap_servers = Some(servers.into());
        self
    }

    /// Set security protocol.
    #[must_use]
    pub fn security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.security_protocol = Some(protocol);
        self
    }

    /// Set SASL credentials.
    #[must_use]
    pub fn sasl(mut self, mechanism: SaslMechanism, username: String, password: String) -> Self {
        self.sasl = Some(SaslCredentials {
            mechanism,
            username,
            password,
        });
        self
    }

    /// Set client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<KafkaConfig, BusError> {
        let bootstrap_servers = self.bootstrap_servers.ok_or(BusError::ConfigMissing {
            var: "bootstrap_servers".to_string(),
        })?;

        let security_protocol = self
            .security_protocol
            .unwrap_or(SecurityProtocol::Plaintext);

        if security_protocol.requires_sasl() && self.sasl.is_none() {
            return Err(BusError::ConfigMissing {
                var: "sasl_credentials".to_string(),
            });
        }

        Ok(KafkaConfig {
            bootstrap_servers,
            security_protocol,
            sasl: self.sasl,
            client_id: self
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
        })
    }
}

/// Where a consumer group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Oldest retained message.
    Earliest,
    /// Only messages produced after the group is created.
    Latest,
}

impl StartOffset {
    /// Convert to rdkafka `auto.offset.reset` value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for StartOffset {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            _ => Err(BusError::ConfigInvalid {
                var: "HORIZON_BUS_START_OFFSET".to_string(),
                reason: format!("Unknown start offset: {s}"),
            }),
        }
    }
}

/// Tuning for one `EventBus`.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Partition count used when the bus creates its topic.
    pub partitions: i32,
    /// Replication factor used when the bus creates its topic.
    pub replication_factor: i32,
    /// Group used by `add_handler` when no group is given.
    pub default_group: String,
    /// Where new consumer groups start reading.
    pub start_offset: StartOffset,
    /// Upper bound on one broker poll; also the cancellation check interval.
    pub poll_timeout: Duration,
    /// Upper bound on waiting for a publish acknowledgement.
    pub publish_timeout: Duration,
    /// Consumer group session timeout.
    pub session_timeout: Duration,
    /// How long `close` waits for consume loops before aborting them.
    pub shutdown_grace: Duration,
    /// Buffer size of the error channel.
    pub error_capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            partitions: 5,
            replication_factor: 1,
            default_group: "default".to_string(),
            start_offset: StartOffset::Earliest,
            poll_timeout: Duration::from_millis(100),
            publish_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            error_capacity: 100,
        }
    }
}

impl BusOptions {
    /// Defaults overridden by optional environment variables.
    ///
    /// - `HORIZON_BUS_PARTITIONS`
    /// - `HORIZON_BUS_DEFAULT_GROUP`
    /// - `HORIZON_BUS_START_OFFSET`: earliest (default) or latest
    /// - `HORIZON_BUS_POLL_TIMEOUT_MS`
    /// - `HORIZON_BUS_PUBLISH_TIMEOUT_MS`
    /// - `HORIZON_BUS_SHUTDOWN_GRACE_MS`
    pub fn from_env() -> Result<Self, BusError> {
        let mut options = Self::default();

        if let Some(partitions) = parsed_var::<i32>("HORIZON_BUS_PARTITIONS")? {
            options.partitions = partitions;
        }
        if let Ok(group) = env::var("HORIZON_BUS_DEFAULT_GROUP") {
            options.default_group = group;
        }
        if let Ok(offset) = env::var("HORIZON_BUS_START_OFFSET") {
            options.start_offset = offset.parse()?;
        }
        if let Some(ms) = parsed_var::<u64>("HORIZON_BUS_POLL_TIMEOUT_MS")? {
            options.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var::<u64>("HORIZON_BUS_PUBLISH_TIMEOUT_MS")? {
            options.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var::<u64>("HORIZON_BUS_SHUTDOWN_GRACE_MS")? {
            options.shutdown_grace = Duration::from_millis(ms);
        }

        options.validate()?;
        Ok(options)
    }

    /// Check option values that would break the bus at runtime.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.partitions < 1 {
            return Err(BusError::ConfigInvalid {
                var: "partitions".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.replication_factor < 1 {
            return Err(BusError::ConfigInvalid {
                var: "replication_factor".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_timeout.is_zero() {
            return Err(BusError::ConfigInvalid {
                var: "poll_timeout".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.error_capacity == 0 {
            return Err(BusError::ConfigInvalid {
                var: "error_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parsed_var<T: FromStr>(var: &str) -> Result<Option<T>, BusError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| BusError::ConfigInvalid {
                var: var.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
