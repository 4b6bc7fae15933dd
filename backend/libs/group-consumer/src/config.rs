//! Consumer configuration
//!
//! Defaults follow the group protocol settings most services run with:
//! newest initial offset, range assignment, 3s heartbeats, 30s session and
//! rebalance timeouts and a 1s auto-commit of marked offsets.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use validator::Validate;

use crate::error::{ConsumerError, ConsumerResult};

/// Consumer group configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ConsumerConfig {
    /// Bootstrap brokers
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,

    /// Consumer group ID
    #[validate(length(min = 1, max = 255))]
    pub group_id: String,

    /// Topics to subscribe to
    #[validate(length(min = 1))]
    pub topics: Vec<String>,

    /// Client ID
    #[validate(length(min = 1, max = 255))]
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Broker protocol version, dotted numeric (e.g. `2.8.0`)
    #[serde(default = "default_version")]
    pub version: String,

    /// Where to start when the group has no committed offset
    #[serde(default)]
    pub initial_offset: InitialOffset,

    /// Partition assignment strategy
    #[serde(default)]
    pub rebalance_strategy: RebalanceStrategy,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_rebalance_timeout_ms")]
    pub rebalance_timeout_ms: u64,

    /// How often marked offsets are committed
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u64,

    #[serde(default)]
    pub net: NetTimeouts,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// SASL PLAIN credentials (never serialized)
    #[serde(default, skip_serializing)]
    pub sasl: Option<SaslPlain>,

    /// Buffered records per partition claim
    #[validate(range(min = 1))]
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

fn default_client_id() -> String {
    "group-consumer".to_string()
}

fn default_version() -> String {
    "2.8.0".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_rebalance_timeout_ms() -> u64 {
    30000
}

fn default_auto_commit_interval_ms() -> u64 {
    1000
}

fn default_channel_buffer_size() -> usize {
    256
}

impl ConsumerConfig {
    /// Configuration with defaults for everything but the group coordinates.
    pub fn new(brokers: Vec<String>, group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            brokers,
            group_id: group_id.into(),
            topics,
            client_id: default_client_id(),
            version: default_version(),
            initial_offset: InitialOffset::default(),
            rebalance_strategy: RebalanceStrategy::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            rebalance_timeout_ms: default_rebalance_timeout_ms(),
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
            net: NetTimeouts::default(),
            tls: None,
            sasl: None,
            channel_buffer_size: default_channel_buffer_size(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_initial_offset(mut self, initial_offset: InitialOffset) -> Self {
        self.initial_offset = initial_offset;
        self
    }

    pub fn with_rebalance_strategy(mut self, strategy: RebalanceStrategy) -> Self {
        self.rebalance_strategy = strategy;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_net_timeouts(mut self, dial: Duration, read: Duration, write: Duration) -> Self {
        self.net = NetTimeouts {
            dial_timeout_ms: dial.as_millis() as u64,
            read_timeout_ms: read.as_millis() as u64,
            write_timeout_ms: write.as_millis() as u64,
        };
        self
    }

    /// Enable TLS; `insecure_skip_verify` disables certificate verification.
    pub fn with_tls(mut self, insecure_skip_verify: bool) -> Self {
        self.tls = Some(TlsConfig {
            insecure_skip_verify,
        });
        self
    }

    pub fn with_sasl_plain(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.sasl = Some(SaslPlain {
            username: username.into(),
            password,
        });
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn rebalance_timeout(&self) -> Duration {
        Duration::from_millis(self.rebalance_timeout_ms)
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    /// Bootstrap servers as a comma-separated string
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Field validation plus the protocol version format.
    pub fn ensure_valid(&self) -> ConsumerResult<()> {
        Validate::validate(self)?;
        if !is_valid_version(&self.version) {
            return Err(ConsumerError::Config(format!(
                "invalid protocol version: {}",
                self.version
            )));
        }
        Ok(())
    }

    /// Build a configuration from `{prefix}*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `{P}BROKERS` | required, `host1:9092,host2:9092` |
    /// | `{P}CLIENT_ID` | client id |
    /// | `{P}VERSION` | protocol version, ignored when malformed |
    /// | `{P}OFFSET_INITIAL` | `newest` \| `oldest` |
    /// | `{P}REBALANCE_STRATEGY` | `range` \| `round_robin` \| `sticky` |
    /// | `{P}TLS_ENABLE`, `{P}TLS_INSECURE_SKIP_VERIFY` | booleans |
    /// | `{P}SASL_ENABLE`, `{P}SASL_MECHANISM` | boolean, `PLAIN` only |
    /// | `{P}SASL_USERNAME`, `{P}SASL_PASSWORD` | credentials |
    pub fn from_env(
        prefix: &str,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> ConsumerResult<Self> {
        Self::from_lookup(prefix, group_id, topics, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(
        prefix: &str,
        group_id: impl Into<String>,
        topics: Vec<String>,
        lookup: F,
    ) -> ConsumerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{prefix}{name}"))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        let brokers = split_and_trim(&var("BROKERS"));
        if brokers.is_empty() {
            return Err(ConsumerError::Config(format!("missing {prefix}BROKERS")));
        }

        let mut config = Self::new(brokers, group_id, topics);

        let client_id = var("CLIENT_ID");
        if !client_id.is_empty() {
            config.client_id = client_id;
        }

        let version = var("VERSION");
        if !version.is_empty() {
            if is_valid_version(&version) {
                config.version = version;
            } else {
                warn!(version = %version, "Ignoring malformed {}VERSION", prefix);
            }
        }

        let initial_offset = var("OFFSET_INITIAL");
        if !initial_offset.is_empty() {
            config.initial_offset = InitialOffset::parse(&initial_offset);
        }

        let strategy = var("REBALANCE_STRATEGY");
        if !strategy.is_empty() {
            config.rebalance_strategy = RebalanceStrategy::parse(&strategy);
        }

        if parse_bool(&var("TLS_ENABLE")) {
            config = config.with_tls(parse_bool(&var("TLS_INSECURE_SKIP_VERIFY")));
        }

        if parse_bool(&var("SASL_ENABLE")) {
            let mechanism = var("SASL_MECHANISM").to_uppercase();
            if !mechanism.is_empty() && mechanism != "PLAIN" {
                return Err(ConsumerError::UnsupportedSaslMechanism(mechanism));
            }
            // credentials are taken verbatim, without trimming
            let username = lookup(&format!("{prefix}SASL_USERNAME")).unwrap_or_default();
            let password = lookup(&format!("{prefix}SASL_PASSWORD")).unwrap_or_default();
            config = config.with_sasl_plain(username, SecretString::from(password));
        }

        Ok(config)
    }
}

/// Where a group without committed offsets starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    /// Earliest retained record
    Oldest,
    /// Only records produced after joining
    #[default]
    Newest,
}

impl InitialOffset {
    /// `oldest` (any case) selects [`Oldest`](Self::Oldest); anything else is newest.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("oldest") {
            InitialOffset::Oldest
        } else {
            InitialOffset::Newest
        }
    }

    /// librdkafka `auto.offset.reset` value
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        }
    }
}

/// Partition assignment strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStrategy {
    #[default]
    Range,
    RoundRobin,
    Sticky,
}

impl RebalanceStrategy {
    /// `round_robin` and `sticky` (any case) are recognised; anything else is range.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "round_robin" => RebalanceStrategy::RoundRobin,
            "sticky" => RebalanceStrategy::Sticky,
            _ => RebalanceStrategy::Range,
        }
    }

    /// librdkafka `partition.assignment.strategy` value.
    ///
    /// librdkafka only ships the cooperative flavour of sticky assignment.
    pub fn assignment_strategy(&self) -> &'static str {
        match self {
            RebalanceStrategy::Range => "range",
            RebalanceStrategy::RoundRobin => "roundrobin",
            RebalanceStrategy::Sticky => "cooperative-sticky",
        }
    }
}

/// Socket timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetTimeouts {
    #[serde(default = "default_net_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_net_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_net_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_net_timeout_ms() -> u64 {
    30000
}

impl Default for NetTimeouts {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_net_timeout_ms(),
            read_timeout_ms: default_net_timeout_ms(),
            write_timeout_ms: default_net_timeout_ms(),
        }
    }
}

/// Transport security
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Skip broker certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// SASL PLAIN credentials
#[derive(Debug, Clone, Deserialize)]
pub struct SaslPlain {
    pub username: String,
    pub password: SecretString,
}

fn split_and_trim(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Boolean parsing compatible with the usual env conventions; anything
/// unrecognised is false.
fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "TRUE" | "true" | "True")
}

fn is_valid_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    (2..=4).contains(&parts.len())
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}
