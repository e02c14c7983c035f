use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_sns::types::MessageAttributeValue;
use tokio::sync::Notify;

use mqrelay_conf as conf;

use super::sqs::message_group_id;
use super::{
    MessageFormat, PublishCallback, PublishRequest, PublishResponse, Publisher, TopicMappings,
    MQTT_DUP_HEADER, MQTT_MSG_FMT_HEADER, MQTT_MSG_ID_HEADER, MQTT_QOS_HEADER, MQTT_RETAIN_HEADER,
};
use crate::Result;

/// Publishes MQTT messages to AWS SNS topics. Topic mappings resolve to
/// topic ARNs; QoS-agnostic like SQS.
pub struct SnsPublisher {
    client: aws_sdk_sns::Client,
    topic_mappings: TopicMappings,
    message_format: MessageFormat,
    done: Notify,
}

impl SnsPublisher {
    pub async fn new(cfg: &conf::Sns, message_format: MessageFormat) -> Result<SnsPublisher> {
        let topic_mappings = TopicMappings::new(&cfg.topic_mappings, &cfg.default_topic)?;
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(SnsPublisher {
            client: aws_sdk_sns::Client::new(&sdk_config),
            topic_mappings,
            message_format,
            done: Notify::new(),
        })
    }

    async fn send_message(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let topic_arn = self.topic_mappings.resolve(&request.topic_name)?.to_string();
        let body = self.message_format.message_body(request)?;
        let message_id = request.packet_id.to_string();

        let mut input = self
            .client
            .publish()
            .topic_arn(&topic_arn)
            .message(String::from_utf8_lossy(&body).into_owned())
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

        if topic_arn.ends_with(".fifo") {
            input = input
                .message_group_id(message_group_id(request))
                .message_deduplication_id(message_id);
        }

        let output = input.send().await.map_err(|e| anyhow!("Publish failed: {}", e))?;
        Ok(PublishResponse { id: output.message_id().map(str::to_string), error: None })
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
impl Publisher for SnsPublisher {
    fn name(&self) -> &'static str {
        "sns"
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
        log::info!("sns publisher closed");
        Ok(())
    }
}
