use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use bytestring::ByteString;
use regex::Regex;
use serde::{Serialize, Serializer};

use mqrelay_conf as conf;

use crate::Result;

mod instrument;
mod kafka;
mod noop;
mod rabbitmq;
mod sns;
mod sqs;

pub use instrument::InstrumentedPublisher;
pub use kafka::KafkaPublisher;
pub use noop::NoopPublisher;
pub use rabbitmq::RabbitmqPublisher;
pub use sns::SnsPublisher;
pub use sqs::SqsPublisher;

/// message attribute / header names carried to the backend broker
pub(crate) const MQTT_QOS_HEADER: &str = "mqtt.qos";
pub(crate) const MQTT_DUP_HEADER: &str = "mqtt.dup";
pub(crate) const MQTT_RETAIN_HEADER: &str = "mqtt.retain";
pub(crate) const MQTT_MSG_ID_HEADER: &str = "mqtt.packet.id";
pub(crate) const MQTT_MSG_FMT_HEADER: &str = "mqtt.fmt";

/// One MQTT PUBLISH, normalized for the backend. The JSON message format
/// serializes exactly these wire fields, with the payload base64-encoded.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic_name: ByteString,
    /// 0 when QoS is 0
    pub packet_id: u16,
    #[serde(rename = "payload", serialize_with = "serialize_base64")]
    pub payload: Bytes,
    #[serde(skip)]
    pub client_id: ByteString,
}

fn serialize_base64<S: Serializer>(payload: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(payload))
}

/// Broker-side result of one publish. `id` is an opaque broker identifier
/// (partition/offset, delivery tag, message id). A present `error` is the
/// broker's per-message failure, distinct from a submission failure.
#[derive(Debug, Default)]
pub struct PublishResponse {
    pub id: Option<String>,
    pub error: Option<crate::Error>,
}

impl PublishResponse {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), error: None }
    }
}

/// Fires exactly once per successfully submitted async publish.
pub type PublishCallback = Box<dyn FnOnce(&PublishRequest, PublishResponse) + Send + 'static>;

/// Backend-facing publish abstraction.
///
/// `publish_async` guarantees: when it returns `Ok`, the callback fires
/// exactly once (with success or the broker's error); when it returns
/// `Err`, the callback never fires.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, request: &PublishRequest) -> Result<PublishResponse>;

    async fn publish_async(&self, request: PublishRequest, callback: PublishCallback) -> Result<()>;

    /// Blocks until shutdown; backends run their delivery-report workers
    /// here.
    async fn serve(&self) -> Result<()>;

    /// Graceful shutdown, bounded by the backend's grace period.
    async fn shutdown(&self);

    /// Hard close.
    async fn close(&self) -> Result<()>;
}

#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("destination not found for MQTT topic {0}")]
    NoDestination(String),
}

/// Ordered list of `destination=regexp` rules plus an optional default.
/// First match in insertion order wins; repeated `set` calls append, and
/// that order is load bearing.
#[derive(Default)]
pub struct TopicMappings {
    mappings: Vec<(String, Regex)>,
    default_destination: Option<String>,
}

impl TopicMappings {
    pub fn new(mappings: &[conf::TopicMapping], default_destination: &str) -> Result<Self> {
        let mut this = TopicMappings {
            mappings: Vec::with_capacity(mappings.len()),
            default_destination: if default_destination.is_empty() {
                None
            } else {
                Some(default_destination.to_string())
            },
        };
        for m in mappings {
            this.set(&m.topic, &m.pattern)?;
        }
        Ok(this)
    }

    pub fn set(&mut self, destination: &str, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern)?;
        self.mappings.push((destination.to_string(), regex));
        Ok(())
    }

    /// First regexp matching the MQTT topic selects the destination, the
    /// default applies otherwise, else the lookup is a hard error.
    pub fn resolve(&self, mqtt_topic: &str) -> Result<&str> {
        for (destination, regex) in &self.mappings {
            if regex.is_match(mqtt_topic) {
                return Ok(destination);
            }
        }
        if let Some(default_destination) = self.default_destination.as_deref() {
            return Ok(default_destination);
        }
        Err(PublisherError::NoDestination(mqtt_topic.to_string()).into())
    }
}

/// Payload serialization applied by the non-Kafka backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Plain,
    Base64,
    Json,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Plain => conf::MESSAGE_FORMAT_PLAIN,
            MessageFormat::Base64 => conf::MESSAGE_FORMAT_BASE64,
            MessageFormat::Json => conf::MESSAGE_FORMAT_JSON,
        }
    }

    pub fn message_body(&self, request: &PublishRequest) -> Result<Bytes> {
        match self {
            MessageFormat::Plain => Ok(request.payload.clone()),
            MessageFormat::Base64 => Ok(Bytes::from(
                base64::engine::general_purpose::STANDARD.encode(&request.payload),
            )),
            MessageFormat::Json => Ok(Bytes::from(serde_json::to_vec(request)?)),
        }
    }
}

impl FromStr for MessageFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            conf::MESSAGE_FORMAT_PLAIN => Ok(MessageFormat::Plain),
            conf::MESSAGE_FORMAT_BASE64 => Ok(MessageFormat::Base64),
            conf::MESSAGE_FORMAT_JSON => Ok(MessageFormat::Json),
            other => Err(anyhow::anyhow!("unsupported message format '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PublishRequest {
        PublishRequest {
            dup: false,
            qos: 1,
            retain: false,
            topic_name: ByteString::from_static("dummy"),
            packet_id: 1,
            payload: Bytes::from_static(b"Hello world"),
            client_id: ByteString::from_static("client-1"),
        }
    }

    #[test]
    fn test_topic_mappings_first_match_wins() {
        let mut mappings = TopicMappings::default();
        mappings.set("temperature", "^temp.*").unwrap();
        mappings.set("other", ".*").unwrap();

        assert_eq!(mappings.resolve("temperature").unwrap(), "temperature");
        assert_eq!(mappings.resolve("brightness").unwrap(), "other");
    }

    #[test]
    fn test_topic_mappings_default_and_error() {
        let mut mappings = TopicMappings::default();
        mappings.set("temperature", "^temp.*").unwrap();

        assert!(matches!(
            mappings.resolve("brightness").unwrap_err().downcast_ref::<PublisherError>(),
            Some(PublisherError::NoDestination(_))
        ));

        mappings.default_destination = Some("fallback".into());
        assert_eq!(mappings.resolve("brightness").unwrap(), "fallback");
    }

    #[test]
    fn test_message_format_plain() {
        let body = MessageFormat::Plain.message_body(&request()).unwrap();
        assert_eq!(body, Bytes::from_static(b"Hello world"));
    }

    #[test]
    fn test_message_format_base64() {
        let body = MessageFormat::Base64.message_body(&request()).unwrap();
        assert_eq!(body, Bytes::from_static(b"SGVsbG8gd29ybGQ="));
    }

    #[test]
    fn test_message_format_json() {
        let body = MessageFormat::Json.message_body(&request()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["dup"], false);
        assert_eq!(value["qos"], 1);
        assert_eq!(value["retain"], false);
        assert_eq!(value["topic_name"], "dummy");
        assert_eq!(value["packet_id"], 1);
        assert_eq!(value["payload"], "SGVsbG8gd29ybGQ=");
        // the client id is not part of the wire shape
        assert!(value.get("client_id").is_none());
    }
}
