//! Immutable, fluent configuration for consumers and producers.
//!
//! A [`Config`] is a value: every `with_*` call consumes the receiver and
//! returns a new snapshot. To branch from an existing snapshot, clone it
//! first. Clones are cheap (the settings and handler maps are shared), and the
//! first write to a shared map copies it, so a retained snapshot never
//! changes underneath its owner.
//!
//! # Example
//!
//! ```
//! use relaykit_core::Config;
//!
//! let base = Config::new()
//!     .with_bootstrap_servers(["broker-1:9092", "broker-2:9092"])
//!     .with_group_id("billing");
//!
//! let manual = base.clone().with_auto_commit(false);
//!
//! assert!(base.auto_commit_enabled());
//! assert!(!manual.auto_commit_enabled());
//! assert_eq!(
//!     manual.get("bootstrap.servers").map(ToString::to_string).as_deref(),
//!     Some("broker-1:9092,broker-2:9092"),
//! );
//! ```

use crate::client::{ClientRole, ConsumerApi, ProducerApi};
use crate::context::Context;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for [`Config::with_max_producer_retries`].
pub const MAX_PRODUCER_RETRIES: u8 = 5;

/// Default initial delay between producer retries.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Settings under this prefix are read by relaykit and never handed to the
/// broker client.
pub const LOCAL_SETTING_PREFIX: &str = "relaykit.";

/// Capacity of a producer's shared delivery event stream.
pub const EVENTS_CHANNEL_SIZE: &str = "relaykit.events.channel.size";

/// Event stream capacity used when [`EVENTS_CHANNEL_SIZE`] is unset or invalid.
pub const DEFAULT_EVENTS_CHANNEL_SIZE: usize = 100_000;

/// Configuration errors. These are always fatal to the constructing call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `bootstrap.servers` was given something other than text or a list of text
    #[error("bootstrap servers must be a string or a list of strings, got {found}")]
    InvalidBootstrapServers {
        /// The kind of value that was supplied
        found: &'static str,
    },

    /// A capability set for the wrong role was supplied
    #[error("invalid client capabilities: a {found} client cannot back a {expected}")]
    WrongClientRole {
        /// The role of the object being constructed
        expected: ClientRole,
        /// The role of the supplied capability set
        found: ClientRole,
    },
}

/// Canonical broker-client property names with named setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// `acks` (producer)
    Acks,
    /// `batch.size` (producer)
    BatchSize,
    /// `bootstrap.servers` (both)
    BootstrapServers,
    /// `client.id` (producer)
    ClientId,
    /// `enable.auto.commit` (consumer)
    EnableAutoCommit,
    /// `enable.idempotence` (producer)
    EnableIdempotence,
    /// `group.id` (consumer)
    GroupId,
    /// `linger.ms` (producer)
    LingerMs,
    /// `max.in.flight.requests.per.connection` (producer)
    MaxInFlightRequestsPerConnection,
    /// `retries` (producer)
    Retries,
}

impl ConfigKey {
    /// The property name understood by the broker client.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acks => "acks",
            Self::BatchSize => "batch.size",
            Self::BootstrapServers => "bootstrap.servers",
            Self::ClientId => "client.id",
            Self::EnableAutoCommit => "enable.auto.commit",
            Self::EnableIdempotence => "enable.idempotence",
            Self::GroupId => "group.id",
            Self::LingerMs => "linger.ms",
            Self::MaxInFlightRequestsPerConnection => "max.in.flight.requests.per.connection",
            Self::Retries => "retries",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A setting value. Rendered to text when handed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    /// Free text
    Text(String),
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Ordered list of text values
    List(Vec<String>),
}

impl SettingValue {
    /// Short name of the value's shape, for error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::List(_) => "list",
        }
    }

    /// The boolean reading of the value, if it has one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(s) => s.parse().ok(),
            Self::Int(_) | Self::List(_) => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for SettingValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for SettingValue {
    fn from(value: &[&str]) -> Self {
        Self::List(value.iter().map(|s| (*s).to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for SettingValue {
    fn from(value: [&str; N]) -> Self {
        Self::List(value.iter().map(|s| (*s).to_string()).collect())
    }
}

/// Broker-client settings keyed by canonical dotted property name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, SettingValue>,
}

impl Settings {
    /// Look up a setting.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Whether a setting is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no settings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate the settings meant for the broker client, skipping those
    /// under [`LOCAL_SETTING_PREFIX`].
    pub fn client_properties(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.iter().filter(|(key, _)| !key.starts_with(LOCAL_SETTING_PREFIX))
    }

    /// Capacity of the shared delivery event stream, always at least 1.
    #[must_use]
    pub fn events_channel_size(&self) -> usize {
        let size = match self.get(EVENTS_CHANNEL_SIZE) {
            Some(SettingValue::Int(n)) => usize::try_from(*n).ok(),
            Some(SettingValue::Text(s)) => s.trim().parse().ok(),
            _ => None,
        };
        size.filter(|n| *n > 0).unwrap_or(DEFAULT_EVENTS_CHANNEL_SIZE)
    }

    fn insert(&mut self, key: String, value: SettingValue) {
        self.values.insert(key, value);
    }
}

/// Future returned by a [`MessageHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A topic handler: receives the execution context and the (transformed)
/// message payload.
pub type MessageHandler = Arc<dyn Fn(Context, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Payload transform applied before handler dispatch (consumer) or before
/// send (producer).
pub type Middleware = Arc<dyn Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Capability set supplied in place of the default broker client.
#[derive(Clone, Default)]
pub enum ClientOverride {
    /// Use the default client
    #[default]
    None,
    /// Consumer capability set
    Consumer(Arc<dyn ConsumerApi>),
    /// Producer capability set
    Producer(Arc<dyn ProducerApi>),
}

impl ClientOverride {
    /// The role of the override, if any.
    #[must_use]
    pub const fn role(&self) -> Option<ClientRole> {
        match self {
            Self::None => None,
            Self::Consumer(_) => Some(ClientRole::Consumer),
            Self::Producer(_) => Some(ClientRole::Producer),
        }
    }
}

impl fmt::Debug for ClientOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role() {
            None => f.write_str("ClientOverride::None"),
            Some(role) => write!(f, "ClientOverride({role})"),
        }
    }
}

/// What the consumer does when middleware or a topic handler fails.
///
/// The failing message is never retried or requeued by relaykit and is never
/// committed explicitly. With auto-commit enabled the client's periodic
/// commit may still move past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure, drop the message and keep consuming (at-most-once)
    #[default]
    SkipMessage,
    /// Log the failure and stop the consumer loop with the error
    StopConsuming,
}

/// Immutable consumer/producer configuration snapshot.
#[derive(Clone)]
pub struct Config {
    settings: Arc<Settings>,
    context: Option<Context>,
    middleware: Option<Middleware>,
    handlers: Arc<HashMap<String, MessageHandler>>,
    max_producer_retries: u8,
    synchronous_delivery: bool,
    failure_policy: FailurePolicy,
    retry_backoff: Duration,
    client: ClientOverride,
    errors: Vec<ConfigError>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("settings", &self.settings)
            .field("topics", &self.topic_ids())
            .field("has_context", &self.context.is_some())
            .field("has_middleware", &self.middleware.is_some())
            .field("max_producer_retries", &self.max_producer_retries)
            .field("synchronous_delivery", &self.synchronous_delivery)
            .field("failure_policy", &self.failure_policy)
            .field("retry_backoff", &self.retry_backoff)
            .field("client", &self.client)
            .field("errors", &self.errors)
            .finish()
    }
}

impl Config {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: Arc::new(Settings::default()),
            context: None,
            middleware: None,
            handlers: Arc::new(HashMap::new()),
            max_producer_retries: 0,
            synchronous_delivery: false,
            failure_policy: FailurePolicy::default(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            client: ClientOverride::None,
            errors: Vec::new(),
        }
    }

    fn set(mut self, key: impl Into<String>, value: SettingValue) -> Self {
        Arc::make_mut(&mut self.settings).insert(key.into(), value);
        self
    }

    /// Set an arbitrary client property.
    ///
    /// `bootstrap.servers` is normalized the same way as
    /// [`with_bootstrap_servers`](Self::with_bootstrap_servers).
    #[must_use]
    pub fn with(self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        let key = key.into();
        if key == ConfigKey::BootstrapServers.as_str() {
            return self.with_bootstrap_servers(value);
        }
        self.set(key, value.into())
    }

    /// Set the broker addresses.
    ///
    /// Accepts a single address string (kept verbatim, so it may already be
    /// comma-separated) or an ordered list of addresses, which is joined with
    /// commas. Any other value is recorded as
    /// [`ConfigError::InvalidBootstrapServers`] and reported by
    /// [`validate`](Self::validate) and by consumer/producer construction.
    #[must_use]
    pub fn with_bootstrap_servers(mut self, servers: impl Into<SettingValue>) -> Self {
        let key = ConfigKey::BootstrapServers.as_str();
        match servers.into() {
            SettingValue::Text(s) => self.set(key, SettingValue::Text(s)),
            SettingValue::List(list) => self.set(key, SettingValue::Text(list.join(","))),
            other => {
                let err = ConfigError::InvalidBootstrapServers { found: other.kind() };
                tracing::error!(error = %err, "Rejected bootstrap servers setting");
                self.errors.push(err);
                self
            }
        }
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn with_group_id(self, group_id: impl Into<String>) -> Self {
        self.set(ConfigKey::GroupId.as_str(), SettingValue::Text(group_id.into()))
    }

    /// Enable or disable the client's periodic offset auto-commit.
    ///
    /// When disabled, the consumer commits each successfully handled message
    /// explicitly.
    #[must_use]
    pub fn with_auto_commit(self, enabled: bool) -> Self {
        self.set(ConfigKey::EnableAutoCommit.as_str(), SettingValue::Bool(enabled))
    }

    /// Enable or disable idempotent production.
    #[must_use]
    pub fn with_idempotence(self, enabled: bool) -> Self {
        self.set(ConfigKey::EnableIdempotence.as_str(), SettingValue::Bool(enabled))
    }

    /// Set the producer batch size in bytes.
    #[must_use]
    pub fn with_batch_size(self, size: u32) -> Self {
        self.set(ConfigKey::BatchSize.as_str(), SettingValue::Int(i64::from(size)))
    }

    /// Set the client id.
    #[must_use]
    pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
        self.set(ConfigKey::ClientId.as_str(), SettingValue::Text(client_id.into()))
    }

    /// Set the producer acknowledgment mode (`"0"`, `"1"` or `"all"`).
    #[must_use]
    pub fn with_acks(self, acks: impl Into<String>) -> Self {
        self.set(ConfigKey::Acks.as_str(), SettingValue::Text(acks.into()))
    }

    /// Set how long the producer waits to fill a batch.
    #[must_use]
    pub fn with_linger_ms(self, linger_ms: u32) -> Self {
        self.set(ConfigKey::LingerMs.as_str(), SettingValue::Int(i64::from(linger_ms)))
    }

    /// Set the payload transform.
    #[must_use]
    pub fn with_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.middleware = Some(Arc::new(middleware));
        self
    }

    /// Register the handler for a topic. The consumer subscribes to every
    /// topic with a handler.
    ///
    /// # Example
    ///
    /// ```
    /// use relaykit_core::Config;
    ///
    /// let cfg = Config::new().with_topic_handler("orders", |_ctx, payload| async move {
    ///     println!("{} bytes", payload.len());
    ///     Ok(())
    /// });
    /// assert_eq!(cfg.topic_ids(), vec!["orders".to_string()]);
    /// ```
    #[must_use]
    pub fn with_topic_handler<F, Fut>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: MessageHandler =
            Arc::new(move |ctx: Context, payload: Vec<u8>| -> HandlerFuture {
                Box::pin(handler(ctx, payload))
            });
        Arc::make_mut(&mut self.handlers).insert(topic.into(), wrapped);
        self
    }

    /// Set the producer retry budget, clamped into `[0, 5]`.
    ///
    /// Out-of-range values are not an error; a warning is logged and the
    /// nearest bound is used.
    #[must_use]
    pub fn with_max_producer_retries(mut self, retries: i64) -> Self {
        let clamped = retries.clamp(0, i64::from(MAX_PRODUCER_RETRIES));
        if clamped != retries {
            tracing::warn!(
                requested = retries,
                applied = clamped,
                "max producer retries out of range, clamped"
            );
        }
        self.max_producer_retries = u8::try_from(clamped).unwrap_or(MAX_PRODUCER_RETRIES);
        self
    }

    /// Set the initial delay between producer retries (doubles per retry).
    #[must_use]
    pub const fn with_retry_backoff(mut self, delay: Duration) -> Self {
        self.retry_backoff = delay;
        self
    }

    /// Bound the producer's shared delivery event stream to `size` events.
    ///
    /// Events arriving while the stream is full are dropped and counted. A
    /// size of zero falls back to [`DEFAULT_EVENTS_CHANNEL_SIZE`].
    #[must_use]
    pub fn with_events_channel_size(self, size: usize) -> Self {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.set(EVENTS_CHANNEL_SIZE, SettingValue::Int(size))
    }

    /// Make `Producer::send` wait for each delivery report.
    #[must_use]
    pub const fn with_synchronous_delivery(mut self, enabled: bool) -> Self {
        self.synchronous_delivery = enabled;
        self
    }

    /// Choose what the consumer does on middleware/handler failure.
    #[must_use]
    pub const fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the execution context passed to topic handlers.
    #[must_use]
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Back consumers built from this config with `api` instead of the
    /// default client.
    #[must_use]
    pub fn with_consumer_client(mut self, api: Arc<dyn ConsumerApi>) -> Self {
        self.client = ClientOverride::Consumer(api);
        self
    }

    /// Back producers built from this config with `api` instead of the
    /// default client.
    #[must_use]
    pub fn with_producer_client(mut self, api: Arc<dyn ProducerApi>) -> Self {
        self.client = ClientOverride::Producer(api);
        self
    }

    /// Report the first configuration error recorded by the builder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBootstrapServers`] if an invalid
    /// bootstrap servers value was supplied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.errors.first().map_or(Ok(()), |err| Err(err.clone()))
    }

    /// Resolve the consumer capability override.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WrongClientRole`] if a producer capability set
    /// was configured.
    pub fn consumer_override(&self) -> Result<Option<Arc<dyn ConsumerApi>>, ConfigError> {
        match &self.client {
            ClientOverride::None => Ok(None),
            ClientOverride::Consumer(api) => Ok(Some(Arc::clone(api))),
            ClientOverride::Producer(_) => Err(ConfigError::WrongClientRole {
                expected: ClientRole::Consumer,
                found: ClientRole::Producer,
            }),
        }
    }

    /// Resolve the producer capability override.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WrongClientRole`] if a consumer capability set
    /// was configured.
    pub fn producer_override(&self) -> Result<Option<Arc<dyn ProducerApi>>, ConfigError> {
        match &self.client {
            ClientOverride::None => Ok(None),
            ClientOverride::Producer(api) => Ok(Some(Arc::clone(api))),
            ClientOverride::Consumer(_) => Err(ConfigError::WrongClientRole {
                expected: ClientRole::Producer,
                found: ClientRole::Consumer,
            }),
        }
    }

    /// True unless `enable.auto.commit` was explicitly set to false.
    #[must_use]
    pub fn auto_commit_enabled(&self) -> bool {
        self.settings
            .get(ConfigKey::EnableAutoCommit.as_str())
            .and_then(SettingValue::as_bool)
            .unwrap_or(true)
    }

    /// Look up a client property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.settings.get(key)
    }

    /// The client properties.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The configured execution context, if any.
    #[must_use]
    pub const fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// The configured payload transform, if any.
    #[must_use]
    pub const fn middleware(&self) -> Option<&Middleware> {
        self.middleware.as_ref()
    }

    /// The handler registered for `topic`.
    #[must_use]
    pub fn handler(&self, topic: &str) -> Option<&MessageHandler> {
        self.handlers.get(topic)
    }

    /// The topic handler mapping.
    #[must_use]
    pub fn handlers(&self) -> &HashMap<String, MessageHandler> {
        &self.handlers
    }

    /// Topics with a registered handler, sorted.
    #[must_use]
    pub fn topic_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The producer retry budget, always in `[0, 5]`.
    #[must_use]
    pub const fn max_producer_retries(&self) -> u8 {
        self.max_producer_retries
    }

    /// Initial delay between producer retries.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Whether `Producer::send` waits for delivery reports.
    #[must_use]
    pub const fn synchronous_delivery(&self) -> bool {
        self.synchronous_delivery
    }

    /// Consumer failure policy.
    #[must_use]
    pub const fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// The capability override.
    #[must_use]
    pub const fn client_override(&self) -> &ClientOverride {
        &self.client
    }
}
