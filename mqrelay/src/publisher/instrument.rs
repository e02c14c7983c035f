use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use prometheus::HistogramVec;

use super::{PublishCallback, PublishRequest, PublishResponse, Publisher};
use crate::metrics::Metrics;
use crate::Result;

/// Wraps a publisher and records publish latency labelled by sync/async and
/// QoS level. The async observation covers submission through delivery
/// report, measured when the callback fires.
pub struct InstrumentedPublisher {
    delegate: Arc<dyn Publisher>,
    publish_duration: HistogramVec,
}

impl InstrumentedPublisher {
    pub fn new(delegate: Arc<dyn Publisher>, metrics: &Metrics) -> Result<Self> {
        let publish_duration = metrics.publish_duration(delegate.name())?;
        Ok(Self { delegate, publish_duration })
    }
}

#[async_trait]
impl Publisher for InstrumentedPublisher {
    fn name(&self) -> &'static str {
        self.delegate.name()
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let start = Instant::now();
        let result = self.delegate.publish(request).await;
        self.publish_duration
            .with_label_values(&["sync", &request.qos.to_string()])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn publish_async(&self, request: PublishRequest, callback: PublishCallback) -> Result<()> {
        let start = Instant::now();
        let qos = request.qos.to_string();
        let publish_duration = self.publish_duration.clone();
        self.delegate
            .publish_async(
                request,
                Box::new(move |request, response| {
                    publish_duration
                        .with_label_values(&["async", &qos])
                        .observe(start.elapsed().as_secs_f64());
                    callback(request, response);
                }),
            )
            .await
    }

    async fn serve(&self) -> Result<()> {
        self.delegate.serve().await
    }

    async fn shutdown(&self) {
        self.delegate.shutdown().await
    }

    async fn close(&self) -> Result<()> {
        self.delegate.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::NoopPublisher;
    use bytes::Bytes;
    use bytestring::ByteString;

    #[tokio::test]
    async fn test_observes_sync_and_async() {
        let metrics = Metrics::new().unwrap();
        let publisher = InstrumentedPublisher::new(Arc::new(NoopPublisher::new()), &metrics).unwrap();

        let request = PublishRequest {
            dup: false,
            qos: 1,
            retain: false,
            topic_name: ByteString::from_static("t"),
            packet_id: 1,
            payload: Bytes::new(),
            client_id: ByteString::new(),
        };

        publisher.publish(&request).await.unwrap();
        publisher.publish_async(request, Box::new(|_, _| {})).await.unwrap();

        assert_eq!(
            publisher.publish_duration.with_label_values(&["sync", "1"]).get_sample_count(),
            1
        );
        assert_eq!(
            publisher.publish_duration.with_label_values(&["async", "1"]).get_sample_count(),
            1
        );
    }
}
