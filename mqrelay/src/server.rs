use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{FutureExt, StreamExt};
use scopeguard::defer;
use tokio::sync::Notify;
use tokio_util::codec::Framed;

use mqrelay_codec::{MqttCodec, MqttPacket};
use mqrelay_net::{Acceptor, BoxedIo, Listener, MqttError, TlsListener};

use crate::conn::{ConnId, ConnState, Connection, PacketWriter};
use crate::handler::{Control, MqttHandler};
use crate::metrics::Metrics;
use crate::Result;

/// Returned by the accept loop once `shutdown`/`close` ran.
#[derive(Debug, thiserror::Error)]
#[error("mqtt: Server closed")]
pub struct ServerClosed;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A listener the server accepts from; TLS handshakes run inside the
/// per-connection task.
pub enum MqttListener {
    Tcp(Listener),
    Tls(TlsListener),
}

#[derive(Clone)]
pub struct MqttServer {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Arc<MqttHandler>,
    metrics: Arc<Metrics>,
    conns: DashMap<ConnId, Arc<Connection>>,
    next_id: AtomicU64,
    total_conns: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

impl MqttServer {
    pub fn new(handler: Arc<MqttHandler>, metrics: Arc<Metrics>) -> MqttServer {
        MqttServer {
            inner: Arc::new(Inner {
                handler,
                metrics,
                conns: DashMap::new(),
                next_id: AtomicU64::new(0),
                total_conns: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
            }),
        }
    }

    #[inline]
    fn shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// `doKeepAlives` of the serving loops: false once shutdown began, so
    /// each loop exits after its current request.
    #[inline]
    pub(crate) fn do_keep_alives(&self) -> bool {
        !self.shutting_down()
    }

    pub fn num_active_conns(&self) -> usize {
        self.inner.conns.len()
    }

    pub fn num_total_conns(&self) -> u64 {
        self.inner.total_conns.load(Ordering::SeqCst)
    }

    /// Accept loop. Transient accept errors back off exponentially from
    /// 5 ms, doubling up to 1 s, reset on the next success; permanent errors
    /// propagate. Returns [`ServerClosed`] once shutdown began.
    pub async fn serve(&self, listener: MqttListener) -> Result<()> {
        let mut backoff: Option<Duration> = None;
        loop {
            if self.shutting_down() {
                return Err(ServerClosed.into());
            }
            let accepted = {
                let accept = async {
                    match &listener {
                        MqttListener::Tcp(l) => l.accept().await,
                        MqttListener::Tls(l) => l.accept().await,
                    }
                };
                tokio::select! {
                    _ = self.inner.shutdown_notify.notified() => return Err(ServerClosed.into()),
                    res = accept => res,
                }
            };
            match accepted {
                Ok(acceptor) => {
                    backoff = None;
                    self.spawn_conn(acceptor, matches!(listener, MqttListener::Tls(_)));
                }
                Err(e) => {
                    if self.shutting_down() {
                        return Err(ServerClosed.into());
                    }
                    if !is_temporary(&e) {
                        return Err(e);
                    }
                    let delay = match backoff {
                        None => ACCEPT_BACKOFF_MIN,
                        Some(d) => (d * 2).min(ACCEPT_BACKOFF_MAX),
                    };
                    backoff = Some(delay);
                    log::warn!("mqtt: accept error: {:?}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn spawn_conn(&self, acceptor: Acceptor, tls: bool) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conn =
            Arc::new(Connection::new(id, acceptor.remote_addr, tls, acceptor.cfg.idle_timeout));
        self.track_conn(&conn, true);

        let server = self.clone();
        tokio::spawn(async move {
            defer! {
                conn.set_state(ConnState::Closed);
                server.track_conn(&conn, false);
            }

            let run = server.run_conn(&conn, acceptor, tls);
            tokio::select! {
                _ = conn.wait_closed() => {
                    log::debug!("connection /{} force closed", conn.remote_addr);
                }
                res = std::panic::AssertUnwindSafe(run).catch_unwind() => {
                    if let Err(panic) = res {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".into());
                        log::error!("mqtt: panic serving /{}: {}", conn.remote_addr, msg);
                    }
                }
            }
        });
    }

    async fn run_conn(&self, conn: &Arc<Connection>, acceptor: Acceptor, tls: bool) {
        let dispatcher = if tls {
            match acceptor.tls().await {
                Ok(d) => d,
                Err(e) => {
                    // failed TLS handshakes close silently
                    log::debug!("TLS handshake failed from /{}, {:?}", conn.remote_addr, e);
                    return;
                }
            }
        } else {
            acceptor.tcp()
        };

        let cfg = dispatcher.cfg.clone();
        let stream = match dispatcher.mqtt().await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Failed to probe MQTT version from /{}, {:?}", conn.remote_addr, e);
                return;
            }
        };
        conn.set_version(stream.version);

        let (sink, mut packets) = stream.io.split();
        let writer = Arc::new(PacketWriter::new(sink, cfg.send_timeout));

        // the read deadline applies to the first packet; afterwards the
        // inter-packet wait runs under the connection idle timeout
        let mut wait = cfg.read_timeout;
        loop {
            let packet = match recv(&mut packets, wait).await {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("recv from /{} failed, {:?}", conn.remote_addr, e);
                    break;
                }
            };
            conn.set_state(ConnState::Active);
            let control = self.inner.handler.handle(conn, &writer, packet).await;
            conn.set_state(ConnState::Idle);

            if control == Control::Disconnect {
                break;
            }
            if !self.do_keep_alives() {
                // we're in shutdown mode
                break;
            }
            wait = conn.idle_timeout();
        }
        let _ = writer.close().await;
    }

    fn track_conn(&self, conn: &Arc<Connection>, add: bool) {
        if add {
            self.inner.total_conns.fetch_add(1, Ordering::SeqCst);
            self.inner.metrics.connections_total.inc();
            self.inner.metrics.active_connections.inc();
            self.inner.conns.insert(conn.id, conn.clone());
        } else if self.inner.conns.remove(&conn.id).is_some() {
            self.inner.metrics.active_connections.dec();
        }
    }

    /// Graceful shutdown: stop accepting, then close idle connections every
    /// 500 ms until the registry drains or `grace` elapses (zero waits
    /// without a deadline).
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();

        let deadline = if grace.is_zero() { None } else { Some(Instant::now() + grace) };
        let mut ticker = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        loop {
            self.close_idle_conns();
            if self.inner.conns.is_empty() {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(anyhow!(
                        "shutdown deadline exceeded, {} connections still active",
                        self.inner.conns.len()
                    ));
                }
            }
            ticker.tick().await;
        }
    }

    /// Hard close: force-close every active connection.
    pub fn close(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
        for entry in self.inner.conns.iter() {
            entry.value().close();
        }
    }

    fn close_idle_conns(&self) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        for entry in self.inner.conns.iter() {
            let conn = entry.value();
            let (mut state, unix) = conn.state();
            // a connection stuck in New for over 5 seconds counts as idle
            // for the purpose of the drain check
            if state == ConnState::New && unix < now - 5 {
                state = ConnState::Idle;
            }
            if state == ConnState::Idle {
                conn.close();
            }
        }
    }
}

async fn recv(
    packets: &mut SplitStream<Framed<BoxedIo, MqttCodec>>,
    tm: Duration,
) -> Result<Option<MqttPacket>> {
    let next = packets.next();
    if tm.is_zero() {
        match next.await {
            Some(Ok((packet, _))) => Ok(Some(packet)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    } else {
        match tokio::time::timeout(tm, next).await {
            Ok(Some(Ok((packet, _)))) => Ok(Some(packet)),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout.into()),
        }
    }
}

/// Accept errors worth retrying: the listener is still usable, the failure
/// concerned one pending connection or a transient resource condition.
fn is_temporary(e: &crate::Error) -> bool {
    match e.downcast_ref::<std::io::Error>() {
        Some(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
        ),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoopAuthenticator;
    use crate::handler::HandlerOptions;
    use crate::publisher::NoopPublisher;
    use mqrelay_net::Builder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn server() -> (MqttServer, Arc<Metrics>, Arc<NoopPublisher>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let publisher = Arc::new(NoopPublisher::new());
        let handler = Arc::new(MqttHandler::new(
            Arc::new(NoopAuthenticator),
            publisher.clone(),
            metrics.clone(),
            HandlerOptions::default(),
        ));
        (MqttServer::new(handler, metrics.clone()), metrics, publisher)
    }

    async fn bind_server(server: &MqttServer) -> std::net::SocketAddr {
        let listener = Builder::new()
            .name("test/tcp")
            .laddr(([127, 0, 0, 1], 0).into())
            .bind()
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve(MqttListener::Tcp(listener)).await;
        });
        addr
    }

    const CONNECT: &[u8] = b"\x10\x23\x00\x04MQTT\x04\x02\x00\x3c\x00\x17mosq-PsQ5sqd12quwl50sY2";

    #[tokio::test]
    async fn test_counts_connections_once() {
        let (server, metrics, _) = server();
        let addr = bind_server(&server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(CONNECT).await.unwrap();
        let mut connack = [0u8; 4];
        client.read_exact(&mut connack).await.unwrap();
        assert_eq!(&connack, b"\x20\x02\x00\x00");

        assert_eq!(server.num_total_conns(), 1);
        assert_eq!(server.num_active_conns(), 1);
        assert_eq!(metrics.active_connections.get(), 1);

        drop(client);
        // the serving task notices EOF and deregisters
        for _ in 0..50 {
            if server.num_active_conns() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.num_active_conns(), 0);
        assert_eq!(server.num_total_conns(), 1);
        assert_eq!(metrics.active_connections.get(), 0);
        assert_eq!(metrics.connections_total.get(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_protocol_level_gets_connack() {
        let (server, _, _) = server();
        let addr = bind_server(&server).await;

        // CONNECT with protocol level 3
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"\x10\x10\x00\x04MQTT\x03\x02\x00\x3c\x00\x04test")
            .await
            .unwrap();
        let mut connack = [0u8; 4];
        client.read_exact(&mut connack).await.unwrap();
        assert_eq!(&connack, b"\x20\x02\x00\x01");
        // then the server closes
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_idle_connections() {
        let (server, _, _) = server();
        let addr = bind_server(&server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(CONNECT).await.unwrap();
        let mut connack = [0u8; 4];
        client.read_exact(&mut connack).await.unwrap();

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(server.num_active_conns(), 0);

        // new connections are refused once the server closed
        let accept_result = server
            .serve(MqttListener::Tcp(
                Builder::new().laddr(([127, 0, 0, 1], 0).into()).bind().unwrap(),
            ))
            .await;
        assert!(accept_result.unwrap_err().downcast_ref::<ServerClosed>().is_some());
    }
}
