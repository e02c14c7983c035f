use anyhow::anyhow;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::Result;

const PACKET_TYPES: &[&str] =
    &["CONNECT", "CONNACK", "PUBLISH", "PUBACK", "PUBREC", "PUBREL", "PUBCOMP", "SUBSCRIBE", "UNSUBSCRIBE", "PINGREQ", "PINGRESP", "DISCONNECT"];

/// Proxy-wide metric families. One instance per process, registered on a
/// single registry which the HTTP server exposes.
pub struct Metrics {
    pub registry: Registry,
    /// MQTT requests by packet type and protocol version
    pub requests_total: IntCounterVec,
    /// MQTT responses by packet type and protocol version
    pub responses_total: IntCounterVec,
    pub active_connections: IntGauge,
    pub connections_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Metrics> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("mqtt_proxy_handler_requests_total", "Total number of MQTT requests."),
            &["type", "version"],
        )
        .map_err(|e| anyhow!(e))?;
        registry.register(Box::new(requests_total.clone())).map_err(|e| anyhow!(e))?;

        let responses_total = IntCounterVec::new(
            Opts::new("mqtt_proxy_handler_responses_total", "Total number of MQTT responses."),
            &["type", "version"],
        )
        .map_err(|e| anyhow!(e))?;
        registry.register(Box::new(responses_total.clone())).map_err(|e| anyhow!(e))?;

        // pre-seed the label combinations of the handled packet types so the
        // series exist before the first request
        for version in ["MQTTv3.1.1", "MQTTv5"] {
            for typ in PACKET_TYPES {
                requests_total.with_label_values(&[typ, version]);
                responses_total.with_label_values(&[typ, version]);
            }
        }

        let active_connections = IntGauge::new(
            "mqtt_proxy_server_active_connections",
            "Number of currently active MQTT connections.",
        )
        .map_err(|e| anyhow!(e))?;
        registry.register(Box::new(active_connections.clone())).map_err(|e| anyhow!(e))?;

        let connections_total = IntCounter::new(
            "mqtt_proxy_server_connections_total",
            "Total number of accepted MQTT connections.",
        )
        .map_err(|e| anyhow!(e))?;
        registry.register(Box::new(connections_total.clone())).map_err(|e| anyhow!(e))?;

        Ok(Metrics { registry, requests_total, responses_total, active_connections, connections_total })
    }

    /// Login latency histogram for an authenticator, labelled by return code
    /// and transport-error flag.
    pub fn login_duration(&self, name: &str) -> Result<HistogramVec> {
        let histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "mqtt_proxy_authenticator_login_duration_seconds",
                "Tracks the latencies for auth requests.",
            )
            .const_label("name", name),
            &["code", "error"],
        )
        .map_err(|e| anyhow!(e))?;
        self.registry.register(Box::new(histogram.clone())).map_err(|e| anyhow!(e))?;
        Ok(histogram)
    }

    /// Publish latency histogram for a publisher, labelled by sync/async and
    /// QoS level.
    pub fn publish_duration(&self, name: &str) -> Result<HistogramVec> {
        let histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "mqtt_proxy_publisher_publish_duration_seconds",
                "Tracks the latencies for publish requests.",
            )
            .const_label("name", name),
            &["type", "qos"],
        )
        .map_err(|e| anyhow!(e))?;
        self.registry.register(Box::new(histogram.clone())).map_err(|e| anyhow!(e))?;
        Ok(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let metrics = Metrics::new().unwrap();
        metrics.requests_total.with_label_values(&["PUBLISH", "MQTTv3.1.1"]).inc();
        assert!(metrics.login_duration("plain").is_ok());
        // registering the same family twice is a programming error
        assert!(metrics.login_duration("plain").is_err());
    }

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.connections_total.inc();
        metrics.active_connections.inc();
        metrics.active_connections.dec();
        assert_eq!(metrics.connections_total.get(), 1);
        assert_eq!(metrics.active_connections.get(), 0);
    }
}
