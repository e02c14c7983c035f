use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{PublishCallback, PublishRequest, PublishResponse, Publisher};
use crate::Result;

/// Discards every message; counts sends so tests and dry runs can observe
/// traffic.
pub struct NoopPublisher {
    sends: AtomicU64,
    done: Notify,
}

impl NoopPublisher {
    pub fn new() -> Self {
        Self { sends: AtomicU64::new(0), done: Notify::new() }
    }

    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }
}

impl Default for NoopPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for NoopPublisher {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, _request: &PublishRequest) -> Result<PublishResponse> {
        let n = self.sends.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(PublishResponse::with_id(n.to_string()))
    }

    async fn publish_async(&self, request: PublishRequest, callback: PublishCallback) -> Result<()> {
        let response = self.publish(&request).await?;
        callback(&request, response);
        Ok(())
    }

    async fn serve(&self) -> Result<()> {
        self.done.notified().await;
        Ok(())
    }

    async fn shutdown(&self) {
        self.done.notify_waiters();
    }

    async fn close(&self) -> Result<()> {
        self.done.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use bytestring::ByteString;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn request() -> PublishRequest {
        PublishRequest {
            dup: false,
            qos: 0,
            retain: false,
            topic_name: ByteString::from_static("dummy"),
            packet_id: 0,
            payload: Bytes::from_static(b"Hello world"),
            client_id: ByteString::new(),
        }
    }

    #[tokio::test]
    async fn test_counts_sends() {
        let publisher = NoopPublisher::new();
        publisher.publish(&request()).await.unwrap();
        publisher.publish(&request()).await.unwrap();
        assert_eq!(publisher.sends(), 2);
    }

    #[tokio::test]
    async fn test_async_callback_fires_once() {
        let publisher = NoopPublisher::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        publisher
            .publish_async(
                request(),
                Box::new(move |_req, resp| {
                    assert!(resp.error.is_none());
                    assert!(!fired2.swap(true, Ordering::SeqCst));
                }),
            )
            .await
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
