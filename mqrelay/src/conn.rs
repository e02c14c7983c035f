use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytestring::ByteString;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::Framed;

use mqrelay_codec::version::ProtocolVersion;
use mqrelay_codec::{MqttCodec, MqttPacket};
use mqrelay_net::{BoxedIo, MqttError};

use crate::Result;

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New = 0,
    Active = 1,
    Idle = 2,
    Closed = 3,
}

impl ConnState {
    fn from_bits(bits: u64) -> ConnState {
        match bits {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            _ => ConnState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Closed => "closed",
        }
    }
}

/// Server side of one accepted MQTT connection. Lives from accept to close;
/// every field the handler and the delivery callbacks touch is atomic so
/// the read and write paths never block each other.
pub struct Connection {
    pub id: ConnId,
    pub remote_addr: SocketAddr,
    pub tls: bool,

    /// packed (unix seconds << 8 | state)
    state: AtomicU64,
    authenticated: AtomicBool,
    client_id: RwLock<ByteString>,
    idle_timeout_ms: AtomicU64,
    /// negotiated protocol level; 0 until the version probe ran
    protocol_level: AtomicU8,

    closed: AtomicBool,
    close_notify: Notify,
}

impl Connection {
    pub fn new(id: ConnId, remote_addr: SocketAddr, tls: bool, idle_timeout: Duration) -> Connection {
        let conn = Connection {
            id,
            remote_addr,
            tls,
            state: AtomicU64::new(0),
            authenticated: AtomicBool::new(false),
            client_id: RwLock::new(ByteString::new()),
            idle_timeout_ms: AtomicU64::new(idle_timeout.as_millis() as u64),
            protocol_level: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        };
        conn.set_state(ConnState::New);
        conn
    }

    /// Negotiated dialect; 3.1.1 until the probe stored something else.
    pub fn version(&self) -> ProtocolVersion {
        match self.protocol_level.load(Ordering::SeqCst) {
            5 => ProtocolVersion::MQTT5,
            _ => ProtocolVersion::MQTT3,
        }
    }

    pub fn set_version(&self, version: ProtocolVersion) {
        let level = match version {
            ProtocolVersion::MQTT3 => 4,
            ProtocolVersion::MQTT5 => 5,
        };
        self.protocol_level.store(level, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: ConnState) {
        let unix = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        self.state.store((unix << 8) | state as u64, Ordering::SeqCst);
    }

    /// Returns the state and the unix second it was entered.
    pub fn state(&self) -> (ConnState, i64) {
        let packed = self.state.load(Ordering::SeqCst);
        (ConnState::from_bits(packed & 0xff), (packed >> 8) as i64)
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn client_id(&self) -> ByteString {
        self.client_id.read().map(|id| id.clone()).unwrap_or_default()
    }

    pub fn set_client_id(&self, client_id: ByteString) {
        if let Ok(mut id) = self.client_id.write() {
            *id = client_id;
        }
    }

    /// Inter-packet deadline; zero disables it.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.idle_timeout_ms.store(idle_timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Asks the serving loop to stop. Idempotent; the socket is closed when
    /// the loop unwinds.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_closed(&self) {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Write half of a connection, shared between the serving loop and async
/// delivery callbacks. Writes are serialized by the lock and each packet is
/// flushed so acks are not delayed.
pub struct PacketWriter {
    sink: Mutex<SplitSink<Framed<BoxedIo, MqttCodec>, MqttPacket>>,
    send_timeout: Duration,
}

impl PacketWriter {
    pub fn new(
        sink: SplitSink<Framed<BoxedIo, MqttCodec>, MqttPacket>,
        send_timeout: Duration,
    ) -> PacketWriter {
        PacketWriter { sink: Mutex::new(sink), send_timeout }
    }

    pub async fn send(&self, packet: MqttPacket) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if self.send_timeout.is_zero() {
            sink.send(packet).await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.send_timeout, sink.send(packet)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e).into()),
                Err(_) => Err(MqttError::WriteTimeout.into()),
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await.map_err(|e| MqttError::Encode(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn connection() -> Connection {
        Connection::new(
            1,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345),
            false,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_version_defaults_to_v3() {
        let conn = connection();
        assert_eq!(conn.version(), ProtocolVersion::MQTT3);
        conn.set_version(ProtocolVersion::MQTT5);
        assert_eq!(conn.version(), ProtocolVersion::MQTT5);
    }

    #[test]
    fn test_state_transitions() {
        let conn = connection();
        assert_eq!(conn.state().0, ConnState::New);

        conn.set_state(ConnState::Active);
        assert_eq!(conn.state().0, ConnState::Active);

        conn.set_state(ConnState::Idle);
        let (state, unix) = conn.state();
        assert_eq!(state, ConnState::Idle);
        assert!(unix > 0);

        conn.set_state(ConnState::Closed);
        assert_eq!(conn.state().0, ConnState::Closed);
    }

    #[test]
    fn test_idle_timeout_from_keep_alive() {
        let conn = connection();
        // CONNECT keep-alive 60s yields a 90s idle deadline
        conn.set_idle_timeout(Duration::from_secs_f64(60.0 * 1.5));
        assert_eq!(conn.idle_timeout(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let conn = std::sync::Arc::new(connection());
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_closed().await })
        };
        conn.close();
        conn.close();
        waiter.await.unwrap();
        assert!(conn.is_closed());
        // waiting after close returns immediately
        conn.wait_closed().await;
    }
}
