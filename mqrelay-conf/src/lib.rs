#![deny(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use mqrelay_net::Result;

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

/// publisher names
pub const PUBLISHER_NOOP: &str = "noop";
pub const PUBLISHER_KAFKA: &str = "kafka";
pub const PUBLISHER_RABBITMQ: &str = "rabbitmq";
pub const PUBLISHER_SQS: &str = "sqs";
pub const PUBLISHER_SNS: &str = "sns";

/// authenticator names
pub const AUTH_NOOP: &str = "noop";
pub const AUTH_PLAIN: &str = "plain";

/// server certificate sources
pub const CERT_SOURCE_FILE: &str = "file";

/// message formats
pub const MESSAGE_FORMAT_PLAIN: &str = "plain";
pub const MESSAGE_FORMAT_BASE64: &str = "base64";
pub const MESSAGE_FORMAT_JSON: &str = "json";

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqrelay/mqrelay").required(false))
            .add_source(File::with_name("mqrelay").required(false))
            .add_source(config::Environment::with_prefix("mqrelay").separator("__").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        // Command line configuration overriding file configuration
        if let Some(addr) = opts.mqtt_listen_address.as_ref() {
            inner.mqtt.listen_address.clone_from(addr);
        }
        if let Some(addr) = opts.http_listen_address.as_ref() {
            inner.http.listen_address.clone_from(addr);
        }
        if let Some(name) = opts.publisher_name.as_ref() {
            inner.mqtt.publisher.name.clone_from(name);
        }
        if let Some(name) = opts.authenticator_name.as_ref() {
            inner.mqtt.handler.authenticator.name.clone_from(name);
        }

        inner.opts = opts;
        inner.validate()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    /// Build directly, without installing the global instance. Used by tests.
    pub fn build(opts: Options) -> Result<Self> {
        Settings::new(opts)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings {:?}", self.0)
    }
}

impl Inner {
    fn validate(&self) -> Result<()> {
        if self.http.listen_address.is_empty() {
            return Err(anyhow!("http listen address must not be empty"));
        }
        if self.mqtt.listen_address.is_empty() {
            return Err(anyhow!("mqtt listen address must not be empty"));
        }

        if self.mqtt.tls.enable && self.mqtt.tls.cert_source != CERT_SOURCE_FILE {
            return Err(anyhow!(
                "unsupported mqtt server certificate source '{}'",
                self.mqtt.tls.cert_source
            ));
        }
        if self.mqtt.tls.enable && self.mqtt.tls.cert_source == CERT_SOURCE_FILE {
            if self.mqtt.tls.file.cert.is_empty() {
                return Err(anyhow!("mqtt server TLS cert file must not be empty"));
            }
            if self.mqtt.tls.file.key.is_empty() {
                return Err(anyhow!("mqtt server TLS key file must not be empty"));
            }
        }

        match self.mqtt.handler.authenticator.name.as_str() {
            AUTH_NOOP | AUTH_PLAIN => {}
            other => return Err(anyhow!("unsupported authenticator '{}'", other)),
        }

        let publisher = &self.mqtt.publisher;
        match publisher.message_format.as_str() {
            MESSAGE_FORMAT_PLAIN | MESSAGE_FORMAT_BASE64 | MESSAGE_FORMAT_JSON => {}
            other => return Err(anyhow!("unsupported message format '{}'", other)),
        }
        match publisher.name.as_str() {
            PUBLISHER_NOOP => {}
            PUBLISHER_KAFKA => {
                if publisher.kafka.bootstrap_servers.is_empty() {
                    return Err(anyhow!("kafka bootstrap servers must not be empty"));
                }
                validate_mappings(&publisher.kafka.topic_mappings)?;
            }
            PUBLISHER_RABBITMQ => {
                if publisher.rabbitmq.host.is_empty() {
                    return Err(anyhow!("rabbitmq host must not be empty"));
                }
                validate_mappings(&publisher.rabbitmq.queue_mappings)?;
            }
            PUBLISHER_SQS => validate_mappings(&publisher.sqs.queue_mappings)?,
            PUBLISHER_SNS => validate_mappings(&publisher.sns.topic_mappings)?,
            other => return Err(anyhow!("unsupported publisher '{}'", other)),
        }
        Ok(())
    }
}

fn validate_mappings(mappings: &[TopicMapping]) -> Result<()> {
    for m in mappings {
        regex::Regex::new(&m.pattern)
            .map_err(|e| anyhow!("invalid topic mapping regexp '{}', {}", m.pattern, e))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http {
    #[serde(default = "Http::listen_address_default")]
    pub listen_address: String,
    #[serde(default = "Http::grace_period_default", deserialize_with = "deserialize_duration")]
    pub grace_period: Duration,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen_address: Self::listen_address_default(),
            grace_period: Self::grace_period_default(),
        }
    }
}

impl Http {
    fn listen_address_default() -> String {
        "0.0.0.0:9090".into()
    }
    fn grace_period_default() -> Duration {
        Duration::from_secs(10)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Mqtt::listen_address_default")]
    pub listen_address: String,
    #[serde(default = "Mqtt::grace_period_default", deserialize_with = "deserialize_duration")]
    pub grace_period: Duration,
    #[serde(default = "Mqtt::read_timeout_default", deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,
    #[serde(default = "Mqtt::write_timeout_default", deserialize_with = "deserialize_duration")]
    pub write_timeout: Duration,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
    #[serde(default = "Mqtt::buffer_size_default")]
    pub reader_buffer_size: usize,
    #[serde(default = "Mqtt::buffer_size_default")]
    pub writer_buffer_size: usize,
    #[serde(default = "Mqtt::max_packet_size_default")]
    pub max_packet_size: u32,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub handler: Handler,
    #[serde(default)]
    pub publisher: Publisher,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            listen_address: Self::listen_address_default(),
            grace_period: Self::grace_period_default(),
            read_timeout: Self::read_timeout_default(),
            write_timeout: Self::write_timeout_default(),
            idle_timeout: Duration::ZERO,
            reader_buffer_size: Self::buffer_size_default(),
            writer_buffer_size: Self::buffer_size_default(),
            max_packet_size: Self::max_packet_size_default(),
            tls: Tls::default(),
            handler: Handler::default(),
            publisher: Publisher::default(),
        }
    }
}

impl Mqtt {
    fn listen_address_default() -> String {
        "0.0.0.0:1883".into()
    }
    fn grace_period_default() -> Duration {
        Duration::from_secs(10)
    }
    fn read_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn write_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn buffer_size_default() -> usize {
        1024
    }
    fn max_packet_size_default() -> u32 {
        1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tls {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "Tls::cert_source_default")]
    pub cert_source: String,
    #[serde(default = "Tls::refresh_default", deserialize_with = "deserialize_duration")]
    pub refresh: Duration,
    #[serde(default)]
    pub file: TlsFile,
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            enable: false,
            cert_source: Self::cert_source_default(),
            refresh: Self::refresh_default(),
            file: TlsFile::default(),
        }
    }
}

impl Tls {
    fn cert_source_default() -> String {
        CERT_SOURCE_FILE.into()
    }
    fn refresh_default() -> Duration {
        Duration::from_secs(300)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsFile {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub client_ca: String,
    #[serde(default)]
    pub client_crl: String,
}

impl TlsFile {
    pub fn client_ca(&self) -> Option<String> {
        if self.client_ca.is_empty() {
            None
        } else {
            Some(self.client_ca.clone())
        }
    }
    pub fn client_crl(&self) -> Option<String> {
        if self.client_crl.is_empty() {
            None
        } else {
            Some(self.client_crl.clone())
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Handler {
    /// Packet names bound to a no-op handler instead of closing the
    /// connection, e.g. ["SUBSCRIBE", "UNSUBSCRIBE"].
    #[serde(default)]
    pub ignore_unsupported: Vec<String>,
    /// Packet names exempt from the authentication gate.
    #[serde(default)]
    pub allow_unauthenticated: Vec<String>,
    #[serde(default)]
    pub publish: Publish,
    #[serde(default)]
    pub authenticator: Authenticator,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Publish {
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub r#async: PublishAsync,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishAsync {
    #[serde(default)]
    pub at_most_once: bool,
    #[serde(default)]
    pub at_least_once: bool,
    #[serde(default)]
    pub exactly_once: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authenticator {
    #[serde(default = "Authenticator::name_default")]
    pub name: String,
    #[serde(default)]
    pub plain: PlainAuth,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self { name: Self::name_default(), plain: PlainAuth::default() }
    }
}

impl Authenticator {
    fn name_default() -> String {
        AUTH_NOOP.into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlainAuth {
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub credentials_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Publisher {
    #[serde(default = "Publisher::name_default")]
    pub name: String,
    #[serde(default = "Publisher::message_format_default")]
    pub message_format: String,
    #[serde(default)]
    pub noop: Noop,
    #[serde(default)]
    pub kafka: Kafka,
    #[serde(default)]
    pub rabbitmq: Rabbitmq,
    #[serde(default)]
    pub sqs: Sqs,
    #[serde(default)]
    pub sns: Sns,
}

impl Default for Publisher {
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            message_format: Self::message_format_default(),
            noop: Noop::default(),
            kafka: Kafka::default(),
            rabbitmq: Rabbitmq::default(),
            sqs: Sqs::default(),
            sns: Sns::default(),
        }
    }
}

impl Publisher {
    fn name_default() -> String {
        PUBLISHER_NOOP.into()
    }
    fn message_format_default() -> String {
        MESSAGE_FORMAT_PLAIN.into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Noop {
    #[serde(default)]
    pub default_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kafka {
    #[serde(default)]
    pub bootstrap_servers: String,
    #[serde(default = "Kafka::grace_period_default", deserialize_with = "deserialize_duration")]
    pub grace_period: Duration,
    /// librdkafka properties; `producer.*` keys apply to every producer,
    /// `{qos-N}.producer.*` keys override for the QoS-N producer.
    #[serde(default)]
    pub conf: HashMap<String, String>,
    #[serde(default)]
    pub default_topic: String,
    #[serde(default, deserialize_with = "deserialize_mappings")]
    pub topic_mappings: Vec<TopicMapping>,
    #[serde(default = "Kafka::workers_default")]
    pub workers: usize,
}

impl Default for Kafka {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            grace_period: Self::grace_period_default(),
            conf: HashMap::new(),
            default_topic: String::new(),
            topic_mappings: Vec::new(),
            workers: Self::workers_default(),
        }
    }
}

impl Kafka {
    fn grace_period_default() -> Duration {
        Duration::from_secs(10)
    }
    fn workers_default() -> usize {
        1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rabbitmq {
    #[serde(default)]
    pub host: String,
    #[serde(default = "Rabbitmq::port_default")]
    pub port: u16,
    #[serde(default = "Rabbitmq::scheme_default")]
    pub scheme: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub default_queue: String,
    #[serde(default, deserialize_with = "deserialize_mappings")]
    pub queue_mappings: Vec<TopicMapping>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub publisher_confirms: PublisherConfirms,
}

impl Default for Rabbitmq {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: Self::port_default(),
            scheme: Self::scheme_default(),
            username: String::new(),
            password: String::new(),
            vhost: String::new(),
            exchange: String::new(),
            default_queue: String::new(),
            queue_mappings: Vec::new(),
            request_timeout: Duration::ZERO,
            publisher_confirms: PublisherConfirms::default(),
        }
    }
}

impl Rabbitmq {
    fn port_default() -> u16 {
        5672
    }
    fn scheme_default() -> String {
        "amqp".into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublisherConfirms {
    #[serde(default)]
    pub at_most_once: bool,
    #[serde(default)]
    pub at_least_once: bool,
    #[serde(default)]
    pub exactly_once: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sqs {
    #[serde(default)]
    pub default_queue: String,
    #[serde(default, deserialize_with = "deserialize_mappings")]
    pub queue_mappings: Vec<TopicMapping>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sns {
    #[serde(default)]
    pub default_topic: String,
    #[serde(default, deserialize_with = "deserialize_mappings")]
    pub topic_mappings: Vec<TopicMapping>,
}

/// One `destination=regexp` rule. Order is load bearing: lookups take the
/// first rule whose regexp matches the MQTT topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMapping {
    pub topic: String,
    pub pattern: String,
}

impl TopicMapping {
    fn parse(value: &str) -> std::result::Result<Self, String> {
        match value.split_once('=') {
            Some((topic, pattern)) if !topic.is_empty() && !pattern.is_empty() => {
                Ok(TopicMapping { topic: topic.to_string(), pattern: pattern.to_string() })
            }
            _ => Err(format!("topic mapping 'destination=regexp' expected but got '{}'", value)),
        }
    }
}

fn deserialize_mappings<'de, D>(deserializer: D) -> std::result::Result<Vec<TopicMapping>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<String>::deserialize(deserializer)?;
    values.iter().map(|v| TopicMapping::parse(v).map_err(de::Error::custom)).collect()
}

/// Parses "30s", "500ms", "1h2m" or a bare number of seconds.
pub fn to_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() || text == "0" {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut unit = String::new();
    let mut flush = |number: &mut String, unit: &mut String| -> std::result::Result<(), String> {
        if number.is_empty() {
            return Err(format!("invalid duration '{}'", text));
        }
        let value: u64 = number.parse().map_err(|_| format!("invalid duration '{}'", text))?;
        total += match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            _ => return Err(format!("invalid duration unit in '{}'", text)),
        };
        number.clear();
        unit.clear();
        Ok(())
    };

    for c in text.chars() {
        if c.is_ascii_digit() {
            if !unit.is_empty() {
                flush(&mut number, &mut unit)?;
            }
            number.push(c);
        } else {
            unit.push(c);
        }
    }
    flush(&mut number, &mut unit)?;
    Ok(total)
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    to_duration(&v).map_err(de::Error::custom)
}
