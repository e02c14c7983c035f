use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_sqs::types::MessageAttributeValue;
use dashmap::DashMap;
use tokio::sync::Notify;

use mqrelay_conf as conf;

use super::{
    MessageFormat, PublishCallback, PublishRequest, PublishResponse, Publisher, TopicMappings,
    MQTT_DUP_HEADER, MQTT_MSG_FMT_HEADER, MQTT_MSG_ID_HEADER, MQTT_QOS_HEADER, MQTT_RETAIN_HEADER,
};
use crate::Result;

/// Message group used for `.fifo` queues when the client did not present an
/// identifier.
pub(crate) const DEFAULT_MESSAGE_GROUP: &str = "mqtt-proxy";

/// Publishes MQTT messages to AWS SQS. QoS-agnostic: a single client serves
/// every level. Queue URLs are resolved once per queue name and cached.
pub struct SqsPublisher {
    client: aws_sdk_sqs::Client,
    queue_mappings: TopicMappings,
    message_format: MessageFormat,
    queue_urls: DashMap<String, String>,
    done: Notify,
}

impl SqsPublisher {
    pub async fn new(cfg: &conf::Sqs, message_format: MessageFormat) -> Result<SqsPublisher> {
        let queue_mappings = TopicMappings::new(&cfg.queue_mappings, &cfg.default_queue)?;
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(SqsPublisher {
            client: aws_sdk_sqs::Client::new(&sdk_config),
            queue_mappings,
            message_format,
            queue_urls: DashMap::new(),
            done: Notify::new(),
        })
    }

    async fn queue_url(&self, mqtt_topic: &str) -> Result<String> {
        let queue_name = self.queue_mappings.resolve(mqtt_topic)?;
        if let Some(url) = self.queue_urls.get(queue_name) {
            return Ok(url.clone());
        }
        let output = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| anyhow!("GetQueueUrl '{}' failed: {}", queue_name, e))?;
        let url = output.queue_url().ok_or_else(|| anyhow!("no url for queue '{}'", queue_name))?;
        self.queue_urls.insert(queue_name.to_string(), url.to_string());
        Ok(url.to_string())
    }

    async fn send_message(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let queue_url = self.queue_url(&request.topic_name).await?;
        let body = self.message_format.message_body(request)?;
        let message_id = request.packet_id.to_string();

        let mut input = self
            .client
            .send_message()
            .queue_url(&queue_url)
            .message_body(String::from_utf8_lossy(&body).into_owned())
            .message_attributes(MQTT_DUP_HEADER, string_attribute("String.bool", request.dup.to_string())?)
            .message_attributes(MQTT_QOS_HEADER, string_attribute("Number", request.qos.to_string())?)
            .message_attributes(
                MQTT_RETAIN_HEADER,
                string_attribute("String.bool", request.retain.to_string())?,
            )
            .message_attributes(MQTT_MSG_ID_HEADER, string_attribute("Number", message_id.clone())?)
            .message_attributes(
                MQTT_MSG_FMT_HEADER,
                string_attribute("String", self.message_format.as_str().to_string())?,
            );

        if queue_url.ends_with(".fifo") {
            input = input
                .message_group_id(message_group_id(request))
                .message_deduplication_id(message_id);
        }

        let output = input.send().await.map_err(|e| anyhow!("SendMessage failed: {}", e))?;
        Ok(PublishResponse { id: output.message_id().map(str::to_string), error: None })
    }
}

pub(crate) fn message_group_id(request: &PublishRequest) -> String {
    if request.client_id.is_empty() {
        DEFAULT_MESSAGE_GROUP.to_string()
    } else {
        request.client_id.to_string()
    }
}

fn string_attribute(data_type: &str, value: String) -> Result<MessageAttributeValue> {
    MessageAttributeValue::builder()
        .data_type(data_type)
        .string_value(value)
        .build()
        .map_err(|e| anyhow!(e))
}

#[async_trait]
impl Publisher for SqsPublisher {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishResponse> {
        self.send_message(request).await
    }

    async fn publish_async(&self, request: PublishRequest, callback: PublishCallback) -> Result<()> {
        let response = self.send_message(&request).await?;
        callback(&request, response);
        Ok(())
    }

    async fn serve(&self) -> Result<()> {
        self.done.notified().await;
        log::info!("Serve stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.close().await;
    }

    async fn close(&self) -> Result<()> {
        self.done.notify_waiters();
        log::info!("sqs publisher closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use bytestring::ByteString;

    #[test]
    fn test_message_group_id() {
        let mut request = PublishRequest {
            dup: false,
            qos: 1,
            retain: false,
            topic_name: ByteString::from_static("t"),
            packet_id: 7,
            payload: Bytes::new(),
            client_id: ByteString::from_static("client-42"),
        };
        assert_eq!(message_group_id(&request), "client-42");

        request.client_id = ByteString::new();
        assert_eq!(message_group_id(&request), DEFAULT_MESSAGE_GROUP);
    }
}
