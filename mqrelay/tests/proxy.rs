use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use mqrelay::auth::{Authenticator, NoopAuthenticator, PlainAuthenticator};
use mqrelay::handler::{HandlerOptions, MqttHandler};
use mqrelay::metrics::Metrics;
use mqrelay::net::Builder;
use mqrelay::publisher::{
    NoopPublisher, PublishCallback, PublishRequest, PublishResponse, Publisher,
};
use mqrelay::server::{MqttListener, MqttServer};
use mqrelay::Result;

struct Proxy {
    addr: std::net::SocketAddr,
    publisher: Arc<NoopPublisher>,
    server: MqttServer,
}

fn start_proxy_with(
    authenticator: Arc<dyn Authenticator>,
    publisher: Arc<dyn Publisher>,
    noop: Arc<NoopPublisher>,
    opts: HandlerOptions,
) -> Proxy {
    let metrics = Arc::new(Metrics::new().unwrap());
    let handler = Arc::new(MqttHandler::new(authenticator, publisher, metrics.clone(), opts));
    let server = MqttServer::new(handler, metrics);

    let listener = Builder::new()
        .name("test/mqtt")
        .laddr(([127, 0, 0, 1], 0).into())
        .read_timeout(Duration::from_secs(5))
        .send_timeout(Duration::from_secs(5))
        .bind()
        .unwrap();
    let addr = listener.local_addr().unwrap();

    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve(MqttListener::Tcp(listener)).await;
        });
    }
    Proxy { addr, publisher: noop, server }
}

fn start_proxy(opts: HandlerOptions) -> Proxy {
    let noop = Arc::new(NoopPublisher::new());
    start_proxy_with(Arc::new(NoopAuthenticator), noop.clone(), noop.clone(), opts)
}

async fn connect(proxy: &Proxy) -> TcpStream {
    TcpStream::connect(proxy.addr).await.unwrap()
}

async fn read_exact(client: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("timed out waiting for response")
        .unwrap();
    buf
}

async fn expect_closed(client: &mut TcpStream) {
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert_eq!(n, 0, "unexpected bytes before close: {:02x?}", rest);
}

// CONNECT, clean session, keep-alive 60, client id mosq-PsQ5sqd12quwl50sY2
const CONNECT_V3: &[u8] =
    b"\x10\x23\x00\x04\x4d\x51\x54\x54\x04\x02\x00\x3c\x00\x17mosq-PsQ5sqd12quwl50sY2";

async fn handshake(proxy: &Proxy) -> TcpStream {
    let mut client = connect(proxy).await;
    client.write_all(CONNECT_V3).await.unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x20\x02\x00\x00");
    client
}

#[tokio::test]
async fn scenario_connect_noop_auth() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = handshake(&proxy).await;

    // the connection stays open, a ping still round-trips
    client.write_all(b"\xc0\x00").await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, b"\xd0\x00");
}

#[tokio::test]
async fn scenario_publish_qos0_fire_and_forget() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = handshake(&proxy).await;

    // topic "dummy", payload "Hello world"
    client
        .write_all(b"\x30\x12\x00\x05\x64\x75\x6d\x6d\x79Hello world")
        .await
        .unwrap();
    // no wire response; the publisher recorded one send
    client.write_all(b"\xc0\x00").await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, b"\xd0\x00");
    assert_eq!(proxy.publisher.sends(), 1);
}

#[tokio::test]
async fn scenario_publish_qos1_puback() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = handshake(&proxy).await;

    // topic "dummy", packet id 1, payload "on"
    client.write_all(b"\x32\x0b\x00\x05\x64\x75\x6d\x6d\x79\x00\x01on").await.unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x40\x02\x00\x01");
    assert_eq!(proxy.publisher.sends(), 1);
}

#[tokio::test]
async fn scenario_publish_qos2_exchange() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = handshake(&proxy).await;

    client.write_all(b"\x34\x0b\x00\x05\x64\x75\x6d\x6d\x79\x00\x01on").await.unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x50\x02\x00\x01");

    client.write_all(b"\x62\x02\x00\x01").await.unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x70\x02\x00\x01");
}

#[tokio::test]
async fn scenario_pingreq_pingresp() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = handshake(&proxy).await;

    client.write_all(b"\xc0\x00").await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, b"\xd0\x00");
}

#[tokio::test]
async fn scenario_unsupported_protocol_level() {
    let proxy = start_proxy(HandlerOptions::default());

    for level in [3u8, 6u8] {
        let mut client = connect(&proxy).await;
        let mut connect_packet = Vec::from(&b"\x10\x10\x00\x04MQTT"[..]);
        connect_packet.push(level);
        connect_packet.extend_from_slice(b"\x02\x00\x3c\x00\x04test");
        client.write_all(&connect_packet).await.unwrap();

        assert_eq!(read_exact(&mut client, 4).await, b"\x20\x02\x00\x01", "level {}", level);
        expect_closed(&mut client).await;
    }
}

#[tokio::test]
async fn scenario_v5_session_short_form_acks() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = connect(&proxy).await;

    // v5 CONNECT: clean start, keep-alive 60, empty properties, client "cli-1"
    client
        .write_all(b"\x10\x12\x00\x04MQTT\x05\x02\x00\x3c\x00\x00\x05cli-1")
        .await
        .unwrap();
    assert_eq!(read_exact(&mut client, 5).await, b"\x20\x03\x00\x00\x00");

    // v5 PUBLISH qos 1: topic "dummy", packet id 1, empty properties, "on"
    client
        .write_all(b"\x32\x0c\x00\x05dummy\x00\x01\x00on")
        .await
        .unwrap();
    // short-form PUBACK: just the packet id
    assert_eq!(read_exact(&mut client, 4).await, b"\x40\x02\x00\x01");

    // v5 QoS 2 exchange also uses the short forms
    client
        .write_all(b"\x34\x0c\x00\x05dummy\x00\x02\x00on")
        .await
        .unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x50\x02\x00\x02");
    client.write_all(b"\x62\x02\x00\x02").await.unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x70\x02\x00\x02");
}

#[tokio::test]
async fn test_wrong_password_gets_connack_then_close() {
    let mut credentials = std::collections::HashMap::new();
    credentials.insert("alice".to_string(), "secret".to_string());
    let auth = Arc::new(PlainAuthenticator::new(credentials, None).unwrap());
    let noop = Arc::new(NoopPublisher::new());
    let proxy = start_proxy_with(auth, noop.clone(), noop, HandlerOptions::default());

    // CONNECT with username "alice" password "wrong"
    let mut client = connect(&proxy).await;
    client
        .write_all(b"\x10\x1e\x00\x04MQTT\x04\xc2\x00\x3c\x00\x04test\x00\x05alice\x00\x05wrong")
        .await
        .unwrap();
    assert_eq!(read_exact(&mut client, 4).await, b"\x20\x02\x00\x05");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_publish_before_connect_is_rejected() {
    let proxy = start_proxy(HandlerOptions::default());

    // the first packet must be a CONNECT; anything else fails version
    // negotiation and the socket closes without a response
    let mut client = connect(&proxy).await;
    client.write_all(b"\x30\x12\x00\x05\x64\x75\x6d\x6d\x79Hello world").await.unwrap();
    expect_closed(&mut client).await;
    assert_eq!(proxy.publisher.sends(), 0);
}

#[tokio::test]
async fn test_subscribe_closes_connection() {
    let proxy = start_proxy(HandlerOptions::default());
    let mut client = handshake(&proxy).await;

    // SUBSCRIBE packet id 1, filter "test" qos 1
    client.write_all(b"\x82\x09\x00\x01\x00\x04test\x01").await.unwrap();
    expect_closed(&mut client).await;
}

struct SlowPublisher {
    delay: Duration,
}

#[async_trait]
impl Publisher for SlowPublisher {
    fn name(&self) -> &'static str {
        "slow"
    }
    async fn publish(&self, _request: &PublishRequest) -> Result<PublishResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(PublishResponse::with_id("late"))
    }
    async fn publish_async(&self, request: PublishRequest, callback: PublishCallback) -> Result<()> {
        let response = self.publish(&request).await?;
        callback(&request, response);
        Ok(())
    }
    async fn serve(&self) -> Result<()> {
        Ok(())
    }
    async fn shutdown(&self) {}
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_publish_deadline_closes_connection_for_qos1() {
    let noop = Arc::new(NoopPublisher::new());
    let mut opts = HandlerOptions::default();
    opts.publish_timeout = Duration::from_millis(10);
    let proxy = start_proxy_with(
        Arc::new(NoopAuthenticator),
        Arc::new(SlowPublisher { delay: Duration::from_millis(100) }),
        noop,
        opts,
    );

    // QoS 0: deadline error is only a warning, the connection stays open
    let mut client = handshake(&proxy).await;
    client.write_all(b"\x30\x12\x00\x05\x64\x75\x6d\x6d\x79Hello world").await.unwrap();
    client.write_all(b"\xc0\x00").await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, b"\xd0\x00");

    // QoS 1: deadline error closes the connection, no PUBACK
    let mut client = handshake(&proxy).await;
    client.write_all(b"\x32\x0b\x00\x05\x64\x75\x6d\x6d\x79\x00\x01on").await.unwrap();
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_graceful_shutdown_returns_server_closed() {
    let proxy = start_proxy(HandlerOptions::default());
    let _client = handshake(&proxy).await;

    proxy.server.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(proxy.server.num_active_conns(), 0);
}
