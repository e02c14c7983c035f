use std::collections::HashSet;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use bytestring::ByteString;

use mqrelay_codec::types::QoS;
use mqrelay_codec::version::ProtocolVersion;
use mqrelay_codec::{v3, v5, MqttPacket};

use crate::auth::{Authenticator, LoginRequest, ReturnCode};
use crate::conn::{Connection, PacketWriter};
use crate::metrics::Metrics;
use crate::publisher::{PublishCallback, PublishRequest, Publisher};
use crate::Result;

/// What the serving loop should do after a packet was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Packet names handled by a no-op instead of closing the connection.
    pub ignore_unsupported: HashSet<String>,
    /// Packet names exempt from the authentication gate.
    pub allow_unauthenticated: HashSet<String>,
    pub publish_timeout: Duration,
    pub publish_async_at_most_once: bool,
    pub publish_async_at_least_once: bool,
    pub publish_async_exactly_once: bool,
}

/// MQTT-server semantics over decoded packets: CONNECT authentication,
/// QoS-driven publish acknowledgements, PUBREL/PINGREQ/DISCONNECT. Every
/// other packet type either hits the ignore table or closes the connection.
pub struct MqttHandler {
    authenticator: Arc<dyn Authenticator>,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<Metrics>,
    opts: HandlerOptions,
}

/// CONNECT fields the proxy cares about, identical across dialects.
struct ConnectData {
    username: Option<ByteString>,
    password: Option<Bytes>,
    client_id: ByteString,
    keep_alive: u16,
}

impl MqttHandler {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<Metrics>,
        opts: HandlerOptions,
    ) -> MqttHandler {
        for name in &opts.ignore_unsupported {
            log::info!("{} requests will be ignored", name);
        }
        for name in &opts.allow_unauthenticated {
            log::info!("{} requests will be allowed unauthenticated", name);
        }
        MqttHandler { authenticator, publisher, metrics, opts }
    }

    pub async fn handle(
        &self,
        conn: &Arc<Connection>,
        writer: &Arc<PacketWriter>,
        packet: MqttPacket,
    ) -> Control {
        let name = packet_name(&packet);
        let version = conn.version().as_str();
        self.metrics.requests_total.with_label_values(&[name, version]).inc();

        match packet {
            MqttPacket::V3(packet) => match packet {
                v3::Packet::Connect(connect) => {
                    let data = ConnectData {
                        username: connect.username,
                        password: connect.password,
                        client_id: connect.client_id,
                        keep_alive: connect.keep_alive,
                    };
                    self.handle_connect(conn, writer, data).await
                }
                v3::Packet::Publish(publish) => self.handle_publish(conn, writer, publish).await,
                v3::Packet::PublishRelease { packet_id } => {
                    self.handle_publish_release(conn, writer, packet_id).await
                }
                v3::Packet::PingRequest => self.handle_ping(conn, writer).await,
                v3::Packet::Disconnect => self.handle_disconnect(conn),
                _ => self.handle_unmapped(conn, name),
            },
            MqttPacket::V5(packet) => match packet {
                v5::Packet::Connect(connect) => {
                    let data = ConnectData {
                        username: connect.username,
                        password: connect.password,
                        client_id: connect.client_id,
                        keep_alive: connect.keep_alive,
                    };
                    self.handle_connect(conn, writer, data).await
                }
                v5::Packet::Publish(publish) => self.handle_publish(conn, writer, publish).await,
                v5::Packet::PublishRelease(ack) => {
                    self.handle_publish_release(conn, writer, ack.packet_id).await
                }
                v5::Packet::PingRequest => self.handle_ping(conn, writer).await,
                v5::Packet::Disconnect(_) => self.handle_disconnect(conn),
                _ => self.handle_unmapped(conn, name),
            },
            MqttPacket::Version(_) => {
                log::warn!("Unexpected version packet from /{}. Disconnecting", conn.remote_addr);
                Control::Disconnect
            }
        }
    }

    /// True when the connection must be dropped: unauthenticated and the
    /// packet is not on the allow list. CONNECT never passes through here.
    fn disconnect_unauthenticated(&self, conn: &Connection, name: &str) -> bool {
        if conn.authenticated() || self.opts.allow_unauthenticated.contains(name) {
            return false;
        }
        log::warn!("Unauthenticated '{}' from /{}", name, conn.remote_addr);
        true
    }

    async fn handle_connect(
        &self,
        conn: &Arc<Connection>,
        writer: &Arc<PacketWriter>,
        data: ConnectData,
    ) -> Control {
        log::info!("Handling MQTT message 'CONNECT' from /{}", conn.remote_addr);

        let login = LoginRequest {
            username: data.username.map(|u| u.to_string()).unwrap_or_default(),
            password: data
                .password
                .map(|p| String::from_utf8_lossy(&p).into_owned())
                .unwrap_or_default(),
        };
        let code = match self.authenticator.login(&login).await {
            Ok(code) => code,
            Err(e) => {
                log::warn!("Login failed from /{}, {:?}", conn.remote_addr, e);
                return Control::Disconnect;
            }
        };

        if data.keep_alive > 0 {
            conn.set_idle_timeout(Duration::from_secs_f64(f64::from(data.keep_alive) * 1.5));
        }
        let authenticated = code.success();
        conn.set_authenticated(authenticated);
        conn.set_client_id(data.client_id);

        match writer.send(connack(conn.version(), code)).await {
            Ok(()) => {
                self.metrics
                    .responses_total
                    .with_label_values(&["CONNACK", conn.version().as_str()])
                    .inc();
            }
            Err(e) => {
                log::error!("Write 'CONNACK' failed, {:?}", e);
            }
        }

        if !authenticated {
            log::info!("Disconnect unauthenticated user '{}' from /{}", login.username, conn.remote_addr);
            return Control::Disconnect;
        }
        Control::Continue
    }

    async fn handle_publish(
        &self,
        conn: &Arc<Connection>,
        writer: &Arc<PacketWriter>,
        publish: mqrelay_codec::types::Publish,
    ) -> Control {
        let request = PublishRequest {
            dup: publish.dup,
            qos: publish.qos.value(),
            retain: publish.retain,
            topic_name: publish.topic.clone(),
            packet_id: publish.packet_id.map(NonZeroU16::get).unwrap_or(0),
            payload: publish.payload.clone(),
            client_id: conn.client_id(),
        };
        if self.disconnect_unauthenticated(conn, "PUBLISH") {
            return Control::Disconnect;
        }
        log::debug!("Handling MQTT message 'PUBLISH' from /{}", conn.remote_addr);

        let callback: PublishCallback = match publish.qos {
            QoS::AtMostOnce => {
                // nothing to send back; the callback slot is kept for metrics
                Box::new(|_request, _response| {})
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    log::error!("'PUBLISH' with QoS {} without packet id", publish.qos.value());
                    return Control::Disconnect;
                };
                let packet = match publish.qos {
                    QoS::AtLeastOnce => puback(conn.version(), packet_id),
                    _ => pubrec(conn.version(), packet_id),
                };
                let ack_name = if publish.qos == QoS::AtLeastOnce { "PUBACK" } else { "PUBREC" };
                let responses = self
                    .metrics
                    .responses_total
                    .with_label_values(&[ack_name, conn.version().as_str()]);
                let writer = writer.clone();
                Box::new(move |_request, response| {
                    if response.error.is_some() {
                        // TODO: decide whether an undeliverable message at
                        // QoS > 0 should also close the connection
                        return;
                    }
                    tokio::spawn(async move {
                        if let Err(e) = writer.send(packet).await {
                            log::error!("Write '{}' failed, {:?}", ack_name, e);
                        } else {
                            responses.inc();
                        }
                    });
                })
            }
        };

        if let Err(e) = self.do_publish(publish.qos, request, callback).await {
            if publish.qos == QoS::AtMostOnce {
                log::warn!("Write 'PUBLISH' failed, ignoring, {:?}", e);
            } else {
                log::error!("Write 'PUBLISH' failed, closing the connection, {:?}", e);
                return Control::Disconnect;
            }
        }
        Control::Continue
    }

    async fn do_publish(
        &self,
        qos: QoS,
        request: PublishRequest,
        callback: PublishCallback,
    ) -> Result<()> {
        let publish_timeout = self.opts.publish_timeout;
        if self.is_publish_async(qos) {
            let submit = self.publisher.publish_async(request, callback);
            if publish_timeout.is_zero() {
                submit.await.map_err(|e| anyhow!("async publish failed: {}", e))
            } else {
                match tokio::time::timeout(publish_timeout, submit).await {
                    Ok(result) => result.map_err(|e| anyhow!("async publish failed: {}", e)),
                    Err(_) => Err(anyhow!("async publish deadline exceeded")),
                }
            }
        } else {
            let publish = self.publisher.publish(&request);
            let response = if publish_timeout.is_zero() {
                publish.await
            } else {
                match tokio::time::timeout(publish_timeout, publish).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("sync publish deadline exceeded")),
                }
            }
            .map_err(|e| anyhow!("sync publish failed: {}", e))?;
            callback(&request, response);
            Ok(())
        }
    }

    #[inline]
    fn is_publish_async(&self, qos: QoS) -> bool {
        match qos {
            QoS::AtMostOnce => self.opts.publish_async_at_most_once,
            QoS::AtLeastOnce => self.opts.publish_async_at_least_once,
            QoS::ExactlyOnce => self.opts.publish_async_exactly_once,
        }
    }

    /// The proxy keeps no QoS-2 transaction state: every PUBREL is answered
    /// with a PUBCOMP for the same id, trusting the broker's durability.
    async fn handle_publish_release(
        &self,
        conn: &Arc<Connection>,
        writer: &Arc<PacketWriter>,
        packet_id: NonZeroU16,
    ) -> Control {
        if self.disconnect_unauthenticated(conn, "PUBREL") {
            return Control::Disconnect;
        }
        log::debug!("Handling MQTT message 'PUBREL' from /{}", conn.remote_addr);
        match writer.send(pubcomp(conn.version(), packet_id)).await {
            Ok(()) => {
                self.metrics
                    .responses_total
                    .with_label_values(&["PUBCOMP", conn.version().as_str()])
                    .inc();
            }
            Err(e) => {
                log::error!("Write 'PUBCOMP' failed, {:?}", e);
            }
        }
        Control::Continue
    }

    async fn handle_ping(&self, conn: &Arc<Connection>, writer: &Arc<PacketWriter>) -> Control {
        if self.disconnect_unauthenticated(conn, "PINGREQ") {
            return Control::Disconnect;
        }
        log::debug!("Handling MQTT message 'PINGREQ' from /{}", conn.remote_addr);
        match writer.send(pingresp(conn.version())).await {
            Ok(()) => {
                self.metrics
                    .responses_total
                    .with_label_values(&["PINGRESP", conn.version().as_str()])
                    .inc();
            }
            Err(e) => {
                log::error!("Write 'PINGRESP' failed, {:?}", e);
            }
        }
        Control::Continue
    }

    fn handle_disconnect(&self, conn: &Arc<Connection>) -> Control {
        log::info!("Handling MQTT message 'DISCONNECT' from /{}", conn.remote_addr);
        Control::Disconnect
    }

    fn handle_unmapped(&self, conn: &Arc<Connection>, name: &str) -> Control {
        if self.opts.ignore_unsupported.contains(name) {
            log::debug!("No handler available for MQTT message '{}' from /{}. Ignoring", name, conn.remote_addr);
            Control::Continue
        } else {
            log::warn!(
                "No handler available for MQTT message '{}' from /{}. Disconnecting",
                name,
                conn.remote_addr
            );
            Control::Disconnect
        }
    }
}

pub fn packet_name(packet: &MqttPacket) -> &'static str {
    match packet {
        MqttPacket::V3(p) => match p {
            v3::Packet::Connect(_) => "CONNECT",
            v3::Packet::ConnectAck(_) => "CONNACK",
            v3::Packet::Publish(_) => "PUBLISH",
            v3::Packet::PublishAck { .. } => "PUBACK",
            v3::Packet::PublishReceived { .. } => "PUBREC",
            v3::Packet::PublishRelease { .. } => "PUBREL",
            v3::Packet::PublishComplete { .. } => "PUBCOMP",
            v3::Packet::Subscribe { .. } => "SUBSCRIBE",
            v3::Packet::SubscribeAck { .. } => "SUBACK",
            v3::Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            v3::Packet::UnsubscribeAck { .. } => "UNSUBACK",
            v3::Packet::PingRequest => "PINGREQ",
            v3::Packet::PingResponse => "PINGRESP",
            v3::Packet::Disconnect => "DISCONNECT",
        },
        MqttPacket::V5(p) => match p {
            v5::Packet::Connect(_) => "CONNECT",
            v5::Packet::ConnectAck(_) => "CONNACK",
            v5::Packet::Publish(_) => "PUBLISH",
            v5::Packet::PublishAck(_) => "PUBACK",
            v5::Packet::PublishReceived(_) => "PUBREC",
            v5::Packet::PublishRelease(_) => "PUBREL",
            v5::Packet::PublishComplete(_) => "PUBCOMP",
            v5::Packet::Subscribe(_) => "SUBSCRIBE",
            v5::Packet::SubscribeAck(_) => "SUBACK",
            v5::Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            v5::Packet::UnsubscribeAck(_) => "UNSUBACK",
            v5::Packet::PingRequest => "PINGREQ",
            v5::Packet::PingResponse => "PINGRESP",
            v5::Packet::Disconnect(_) => "DISCONNECT",
            v5::Packet::Auth(_) => "AUTH",
        },
        MqttPacket::Version(_) => "VERSION",
    }
}

/// Version-correct CONNACK; the 3.1.1 refusal codes are remapped to their
/// MQTT 5 equivalents (4 -> 0x86, 5 -> 0x87).
fn connack(version: ProtocolVersion, code: ReturnCode) -> MqttPacket {
    match version {
        ProtocolVersion::MQTT3 => {
            let return_code = match code {
                ReturnCode::Accepted => v3::ConnectAckReason::ConnectionAccepted,
                ReturnCode::RefusedBadUserNameOrPassword => v3::ConnectAckReason::BadUserNameOrPassword,
                ReturnCode::RefusedNotAuthorized => v3::ConnectAckReason::NotAuthorized,
            };
            MqttPacket::V3(v3::Packet::ConnectAck(v3::ConnectAck { session_present: false, return_code }))
        }
        ProtocolVersion::MQTT5 => {
            let reason_code = match code {
                ReturnCode::Accepted => v5::ConnectAckReason::Success,
                ReturnCode::RefusedBadUserNameOrPassword => v5::ConnectAckReason::BadUserNameOrPassword,
                ReturnCode::RefusedNotAuthorized => v5::ConnectAckReason::NotAuthorized,
            };
            MqttPacket::V5(v5::Packet::ConnectAck(v5::ConnectAck {
                session_present: false,
                reason_code,
                properties: Bytes::new(),
            }))
        }
    }
}

fn puback(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    match version {
        ProtocolVersion::MQTT3 => MqttPacket::V3(v3::Packet::PublishAck { packet_id }),
        ProtocolVersion::MQTT5 => MqttPacket::V5(v5::Packet::PublishAck(v5::PublishAck::new(packet_id))),
    }
}

fn pubrec(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    match version {
        ProtocolVersion::MQTT3 => MqttPacket::V3(v3::Packet::PublishReceived { packet_id }),
        ProtocolVersion::MQTT5 => {
            MqttPacket::V5(v5::Packet::PublishReceived(v5::PublishAck::new(packet_id)))
        }
    }
}

fn pubcomp(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    match version {
        ProtocolVersion::MQTT3 => MqttPacket::V3(v3::Packet::PublishComplete { packet_id }),
        ProtocolVersion::MQTT5 => {
            MqttPacket::V5(v5::Packet::PublishComplete(v5::PublishAck2::new(packet_id)))
        }
    }
}

fn pingresp(version: ProtocolVersion) -> MqttPacket {
    match version {
        ProtocolVersion::MQTT3 => MqttPacket::V3(v3::Packet::PingResponse),
        ProtocolVersion::MQTT5 => MqttPacket::V5(v5::Packet::PingResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{NoopAuthenticator, PlainAuthenticator};
    use crate::conn::ConnState;
    use crate::publisher::{NoopPublisher, PublishResponse};
    use async_trait::async_trait;
    use futures::StreamExt;
    use mqrelay_codec::MqttCodec;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Framed;

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn publish(&self, _request: &PublishRequest) -> Result<PublishResponse> {
            Err(anyhow!("destination not found for MQTT topic"))
        }
        async fn publish_async(
            &self,
            _request: PublishRequest,
            _callback: PublishCallback,
        ) -> Result<()> {
            Err(anyhow!("destination not found for MQTT topic"))
        }
        async fn serve(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        handler: MqttHandler,
        conn: Arc<Connection>,
        writer: Arc<PacketWriter>,
        client: tokio::io::DuplexStream,
        publisher: Arc<NoopPublisher>,
    }

    fn fixture_with(
        authenticator: Arc<dyn Authenticator>,
        publisher: Arc<dyn Publisher>,
        noop: Arc<NoopPublisher>,
        opts: HandlerOptions,
    ) -> Fixture {
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = MqttHandler::new(authenticator, publisher, metrics, opts);

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let framed = Framed::new(
            Box::new(server_io) as mqrelay_net::BoxedIo,
            MqttCodec::V3(v3::Codec::default()),
        );
        let (sink, _stream) = framed.split();
        let writer = Arc::new(PacketWriter::new(sink, Duration::from_secs(1)));

        let conn = Arc::new(Connection::new(
            1,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234),
            false,
            Duration::ZERO,
        ));
        conn.set_version(ProtocolVersion::MQTT3);
        conn.set_state(ConnState::Active);

        Fixture { handler, conn, writer, client: client_io, publisher: noop }
    }

    fn fixture(opts: HandlerOptions) -> Fixture {
        let noop = Arc::new(NoopPublisher::new());
        fixture_with(Arc::new(NoopAuthenticator), noop.clone(), noop.clone(), opts)
    }

    async fn read_bytes(client: &mut tokio::io::DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for response bytes")
            .unwrap();
        buf
    }

    fn connect_packet(username: Option<&str>, password: Option<&str>, keep_alive: u16) -> MqttPacket {
        MqttPacket::V3(v3::Packet::Connect(Box::new(v3::Connect {
            protocol: Default::default(),
            clean_session: true,
            keep_alive,
            client_id: ByteString::from_static("mosq-PsQ5sqd12quwl50sY2"),
            last_will: None,
            username: username.map(ByteString::from),
            password: password.map(|p| Bytes::copy_from_slice(p.as_bytes())),
        })))
    }

    fn publish_packet(qos: QoS, packet_id: Option<u16>) -> MqttPacket {
        MqttPacket::V3(v3::Packet::Publish(mqrelay_codec::types::Publish {
            dup: false,
            retain: false,
            qos,
            topic: ByteString::from_static("dummy"),
            packet_id: packet_id.map(|id| NonZeroU16::new(id).unwrap()),
            payload: Bytes::from_static(b"on"),
            properties: None,
        }))
    }

    #[tokio::test]
    async fn test_connect_accepted() {
        let mut f = fixture(HandlerOptions::default());
        let control =
            f.handler.handle(&f.conn, &f.writer, connect_packet(None, None, 60)).await;
        assert_eq!(control, Control::Continue);
        assert!(f.conn.authenticated());
        assert_eq!(f.conn.client_id(), "mosq-PsQ5sqd12quwl50sY2");
        assert_eq!(f.conn.idle_timeout(), Duration::from_secs(90));
        assert_eq!(read_bytes(&mut f.client, 4).await, b"\x20\x02\x00\x00");
    }

    #[tokio::test]
    async fn test_connect_bad_password() {
        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "secret".to_string());
        let auth = Arc::new(PlainAuthenticator::new(credentials, None).unwrap());
        let noop = Arc::new(NoopPublisher::new());
        let mut f =
            fixture_with(auth, noop.clone(), noop.clone(), HandlerOptions::default());

        let control = f
            .handler
            .handle(&f.conn, &f.writer, connect_packet(Some("alice"), Some("wrong"), 0))
            .await;
        assert_eq!(control, Control::Disconnect);
        assert!(!f.conn.authenticated());
        assert_eq!(read_bytes(&mut f.client, 4).await, b"\x20\x02\x00\x05");
    }

    #[tokio::test]
    async fn test_publish_qos0_no_response() {
        let f = fixture(HandlerOptions::default());
        f.conn.set_authenticated(true);
        let control = f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::AtMostOnce, None)).await;
        assert_eq!(control, Control::Continue);
        assert_eq!(f.publisher.sends(), 1);
    }

    #[tokio::test]
    async fn test_publish_qos1_writes_puback() {
        let mut f = fixture(HandlerOptions::default());
        f.conn.set_authenticated(true);
        let control =
            f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::AtLeastOnce, Some(1))).await;
        assert_eq!(control, Control::Continue);
        assert_eq!(f.publisher.sends(), 1);
        assert_eq!(read_bytes(&mut f.client, 4).await, b"\x40\x02\x00\x01");
    }

    #[tokio::test]
    async fn test_publish_qos2_pubrec_then_pubcomp() {
        let mut f = fixture(HandlerOptions::default());
        f.conn.set_authenticated(true);
        let control =
            f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::ExactlyOnce, Some(1))).await;
        assert_eq!(control, Control::Continue);
        assert_eq!(read_bytes(&mut f.client, 4).await, b"\x50\x02\x00\x01");

        let pubrel = MqttPacket::V3(v3::Packet::PublishRelease {
            packet_id: NonZeroU16::new(1).unwrap(),
        });
        let control = f.handler.handle(&f.conn, &f.writer, pubrel).await;
        assert_eq!(control, Control::Continue);
        assert_eq!(read_bytes(&mut f.client, 4).await, b"\x70\x02\x00\x01");
    }

    #[tokio::test]
    async fn test_unauthenticated_publish_closes() {
        let f = fixture(HandlerOptions::default());
        let control = f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::AtMostOnce, None)).await;
        assert_eq!(control, Control::Disconnect);
        assert_eq!(f.publisher.sends(), 0);
    }

    #[tokio::test]
    async fn test_allow_unauthenticated_publish() {
        let mut opts = HandlerOptions::default();
        opts.allow_unauthenticated.insert("PUBLISH".to_string());
        let f = fixture(opts);
        let control = f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::AtMostOnce, None)).await;
        assert_eq!(control, Control::Continue);
        assert_eq!(f.publisher.sends(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_policy_by_qos() {
        let noop = Arc::new(NoopPublisher::new());
        let f = fixture_with(
            Arc::new(NoopAuthenticator),
            Arc::new(FailingPublisher),
            noop,
            HandlerOptions::default(),
        );
        f.conn.set_authenticated(true);

        // QoS 0: warn and continue
        let control = f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::AtMostOnce, None)).await;
        assert_eq!(control, Control::Continue);

        // QoS 1: close so the client retries after reconnect
        let control =
            f.handler.handle(&f.conn, &f.writer, publish_packet(QoS::AtLeastOnce, Some(1))).await;
        assert_eq!(control, Control::Disconnect);
    }

    #[tokio::test]
    async fn test_ping_and_disconnect() {
        let mut f = fixture(HandlerOptions::default());
        f.conn.set_authenticated(true);

        let control =
            f.handler.handle(&f.conn, &f.writer, MqttPacket::V3(v3::Packet::PingRequest)).await;
        assert_eq!(control, Control::Continue);
        assert_eq!(read_bytes(&mut f.client, 2).await, b"\xd0\x00");

        let control =
            f.handler.handle(&f.conn, &f.writer, MqttPacket::V3(v3::Packet::Disconnect)).await;
        assert_eq!(control, Control::Disconnect);
    }

    #[tokio::test]
    async fn test_subscribe_closes_unless_ignored() {
        let subscribe = || {
            MqttPacket::V3(v3::Packet::Subscribe {
                packet_id: NonZeroU16::new(1).unwrap(),
                topic_filters: vec![(ByteString::from_static("t"), QoS::AtMostOnce)],
            })
        };

        let f = fixture(HandlerOptions::default());
        f.conn.set_authenticated(true);
        assert_eq!(f.handler.handle(&f.conn, &f.writer, subscribe()).await, Control::Disconnect);

        let mut opts = HandlerOptions::default();
        opts.ignore_unsupported.insert("SUBSCRIBE".to_string());
        let f = fixture(opts);
        f.conn.set_authenticated(true);
        assert_eq!(f.handler.handle(&f.conn, &f.writer, subscribe()).await, Control::Continue);
    }
}
