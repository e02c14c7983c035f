use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use rdkafka::config::{ClientConfig as KafkaClientConfig, RDKafkaLogLevel};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tokio::sync::{mpsc, Mutex, Notify};

use mqrelay_conf as conf;

use super::{
    PublishCallback, PublishRequest, PublishResponse, Publisher, TopicMappings, MQTT_DUP_HEADER,
    MQTT_MSG_ID_HEADER, MQTT_QOS_HEADER, MQTT_RETAIN_HEADER,
};
use crate::Result;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DELIVERY_QUEUE_CAPACITY: usize = 1024;

/// One submitted message awaiting its delivery report.
struct Delivery {
    future: DeliveryFuture,
    request: PublishRequest,
    callback: PublishCallback,
}

/// One producer with its delivery queue. Three instances exist, one per QoS
/// level, each with its own durability settings.
struct QosProducer {
    producer: FutureProducer,
    deliveries_tx: mpsc::Sender<Delivery>,
    deliveries_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
}

/// Publishes MQTT messages to Kafka. Key is the MQTT topic name, value the
/// payload bytes; QoS/dup/retain/packet-id travel as headers. Partition
/// selection is left to the broker.
pub struct KafkaPublisher {
    producers: [QosProducer; 3],
    topic_mappings: TopicMappings,
    workers: usize,
    grace_period: Duration,
    done: Notify,
    stopped: AtomicBool,
    in_shutdown: AtomicBool,
}

impl KafkaPublisher {
    pub fn new(cfg: &conf::Kafka) -> Result<KafkaPublisher> {
        let topic_mappings = TopicMappings::new(&cfg.topic_mappings, &cfg.default_topic)?;

        let queue_capacity = cfg.workers.max(1) * DELIVERY_QUEUE_CAPACITY;
        let new_producer = |qos: u8, durability: &[(&str, &str)]| -> Result<QosProducer> {
            let mut client_cfg = producer_properties(qos, cfg);
            for (key, value) in durability {
                client_cfg.set(*key, *value);
            }
            let producer: FutureProducer = client_cfg.create().map_err(|e| anyhow!(e))?;
            let (deliveries_tx, deliveries_rx) = mpsc::channel(queue_capacity);
            Ok(QosProducer { producer, deliveries_tx, deliveries_rx: Mutex::new(Some(deliveries_rx)) })
        };

        let producers = [
            new_producer(0, &[("acks", "0")])?,
            new_producer(1, &[("acks", "all")])?,
            new_producer(2, &[("acks", "all"), ("enable.idempotence", "true")])?,
        ];

        Ok(KafkaPublisher {
            producers,
            topic_mappings,
            workers: cfg.workers.max(1),
            grace_period: cfg.grace_period,
            done: Notify::new(),
            stopped: AtomicBool::new(false),
            in_shutdown: AtomicBool::new(false),
        })
    }

    #[inline]
    fn producer(&self, qos: u8) -> Result<&QosProducer> {
        self.producers.get(qos as usize).ok_or_else(|| anyhow!("kafka producer for qos {} not found", qos))
    }

    fn headers(request: &PublishRequest) -> OwnedHeaders {
        let qos = request.qos.to_string();
        let packet_id = request.packet_id.to_string();
        OwnedHeaders::new()
            .insert(Header { key: MQTT_QOS_HEADER, value: Some(qos.as_str()) })
            .insert(Header { key: MQTT_DUP_HEADER, value: Some(bool_str(request.dup)) })
            .insert(Header { key: MQTT_RETAIN_HEADER, value: Some(bool_str(request.retain)) })
            .insert(Header { key: MQTT_MSG_ID_HEADER, value: Some(packet_id.as_str()) })
    }

    /// Remaining queued messages after flushing every producer in parallel
    /// for at most `timeout`.
    async fn flush(&self, timeout: Duration) -> i32 {
        let handles: Vec<_> = self
            .producers
            .iter()
            .map(|p| {
                let producer = p.producer.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = producer.flush(Timeout::After(timeout)) {
                        log::debug!("kafka flush: {:?}", e);
                    }
                    producer.in_flight_count()
                })
            })
            .collect();

        let mut remaining = 0;
        for handle in handles {
            remaining += handle.await.unwrap_or(0);
        }
        remaining
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let producer = self.producer(request.qos)?;
        let topic = self.topic_mappings.resolve(&request.topic_name)?;

        let record = FutureRecord::to(topic)
            .key(request.topic_name.as_bytes().as_ref())
            .payload(request.payload.as_ref())
            .headers(Self::headers(request));

        match producer.producer.send(record, Timeout::Never).await {
            Ok((partition, offset)) => {
                Ok(PublishResponse::with_id(format!("{}/{}@{}", topic, partition, offset)))
            }
            // per-partition delivery error; submission itself succeeded
            Err((e, _msg)) => Ok(PublishResponse { id: None, error: Some(anyhow!(e)) }),
        }
    }

    async fn publish_async(&self, request: PublishRequest, callback: PublishCallback) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("kafka publisher is stopped"));
        }
        let producer = self.producer(request.qos)?;
        let topic = self.topic_mappings.resolve(&request.topic_name)?.to_string();

        let record = FutureRecord::to(&topic)
            .key(request.topic_name.as_bytes().as_ref())
            .payload(request.payload.as_ref())
            .headers(Self::headers(&request));

        let future = match producer.producer.send_result(record) {
            Ok(future) => future,
            Err((e, _record)) => return Err(anyhow!(e)),
        };

        producer
            .deliveries_tx
            .send(Delivery { future, request, callback })
            .await
            .map_err(|_| anyhow!("kafka delivery workers stopped"))?;
        Ok(())
    }

    /// Runs `workers` delivery-report workers per producer and blocks until
    /// shutdown or a fatal broker error terminates a worker loop.
    async fn serve(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut handles = Vec::new();
        for (qos, producer) in self.producers.iter().enumerate() {
            let rx = producer
                .deliveries_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| anyhow!("kafka publisher already served"))?;
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..self.workers {
                handles.push(tokio::spawn(delivery_report_loop(rx.clone(), qos as u8, worker)));
            }
        }
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let done = self.done.notified();
        tokio::pin!(done);

        tokio::select! {
            _ = &mut done => {
                for handle in &abort_handles {
                    handle.abort();
                }
            }
            _ = futures::future::select_all(handles) => {
                // a worker exited on its own, broker error was fatal
                self.stop();
            }
        }
        log::info!("received workers done signal");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.grace_period.is_zero() {
            let _ = self.close().await;
            return;
        }
        if self.in_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + self.grace_period;
        loop {
            let remaining = self.flush(SHUTDOWN_POLL_INTERVAL).await;
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("kafka shutdown grace period elapsed, {} messages still queued", remaining);
                break;
            }
        }
        let _ = self.close().await;
    }

    async fn close(&self) -> Result<()> {
        self.stop();
        log::info!("kafka publisher closed");
        Ok(())
    }
}

/// Consumes delivery reports and fires the stored callbacks. Exits when the
/// queue closes or the broker reports a fatal error.
async fn delivery_report_loop(rx: Arc<Mutex<mpsc::Receiver<Delivery>>>, qos: u8, worker: usize) {
    loop {
        let delivery = { rx.lock().await.recv().await };
        let Some(delivery) = delivery else {
            log::info!("qos: {}, worker: {}, delivery queue closed, exiting delivery loop", qos, worker);
            return;
        };
        match delivery.future.await {
            Ok(Ok((partition, offset))) => {
                log::debug!("delivery ok, partition: {}, offset: {}", partition, offset);
                (delivery.callback)(
                    &delivery.request,
                    PublishResponse::with_id(format!("{}@{}", partition, offset)),
                );
            }
            Ok(Err((e, _msg))) => {
                let fatal = is_fatal(&e);
                log::error!("qos: {}, worker: {}, delivery error: {:?}", qos, worker, e);
                (delivery.callback)(
                    &delivery.request,
                    PublishResponse { id: None, error: Some(anyhow!(e)) },
                );
                if fatal {
                    log::error!("qos: {}, worker: {}, fatal kafka error, exiting delivery loop", qos, worker);
                    return;
                }
            }
            Err(_) => {
                (delivery.callback)(
                    &delivery.request,
                    PublishResponse { id: None, error: Some(anyhow!("delivery report canceled")) },
                );
            }
        }
    }
}

#[inline]
fn is_fatal(e: &KafkaError) -> bool {
    matches!(e.rdkafka_error_code(), Some(RDKafkaErrorCode::Fatal))
}

#[inline]
fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

/// librdkafka properties for the QoS-N producer: common bootstrap servers,
/// then global `producer.*` keys, then `{qos-N}.producer.*` overrides.
/// Durability keys are applied by the caller afterwards and win.
fn producer_properties(qos: u8, cfg: &conf::Kafka) -> KafkaClientConfig {
    let mut client_cfg = KafkaClientConfig::new();
    client_cfg.set("bootstrap.servers", cfg.bootstrap_servers.as_str());
    for (key, value) in properties_with_prefix(&cfg.conf, "producer.") {
        client_cfg.set(key, value);
    }
    for (key, value) in properties_with_prefix(&cfg.conf, &format!("{{qos-{}}}.producer.", qos)) {
        client_cfg.set(key, value);
    }
    client_cfg.set_log_level(RDKafkaLogLevel::Info);
    client_cfg
}

fn properties_with_prefix<'a>(
    conf: &'a HashMap<String, String>,
    prefix: &str,
) -> Vec<(&'a str, &'a str)> {
    let mut properties: Vec<(&str, &str)> = conf
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|stripped| (stripped, v.as_str())))
        .collect();
    properties.sort_unstable();
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka_conf(pairs: &[(&str, &str)]) -> conf::Kafka {
        let mut cfg = conf::Kafka::default();
        cfg.bootstrap_servers = "localhost:9092".into();
        cfg.conf = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        cfg
    }

    #[test]
    fn test_properties_with_prefix() {
        let cfg = kafka_conf(&[
            ("producer.linger.ms", "5"),
            ("producer.batch.size", "1000"),
            ("{qos-1}.producer.linger.ms", "0"),
            ("unrelated.key", "x"),
        ]);

        let common = properties_with_prefix(&cfg.conf, "producer.");
        assert_eq!(common, vec![("batch.size", "1000"), ("linger.ms", "5")]);

        let qos1 = properties_with_prefix(&cfg.conf, "{qos-1}.producer.");
        assert_eq!(qos1, vec![("linger.ms", "0")]);

        assert!(properties_with_prefix(&cfg.conf, "{qos-2}.producer.").is_empty());
    }

    #[test]
    fn test_per_qos_overrides_apply() {
        let cfg = kafka_conf(&[
            ("producer.linger.ms", "5"),
            ("{qos-2}.producer.linger.ms", "20"),
        ]);

        let common = producer_properties(0, &cfg);
        assert_eq!(common.get("linger.ms"), Some("5"));
        assert_eq!(common.get("bootstrap.servers"), Some("localhost:9092"));

        let qos2 = producer_properties(2, &cfg);
        assert_eq!(qos2.get("linger.ms"), Some("20"));
    }
}
