use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::stream::{BoxedIo, Dispatcher};
use crate::{Error, MqttError, Result};

#[derive(Clone, Debug)]
pub struct Builder {
    /// The name of the server.
    pub name: String,
    /// The local address the server listens on.
    pub laddr: SocketAddr,
    /// The maximum length of the TCP connection queue.
    pub backlog: i32,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// Whether to enable the SO_REUSEADDR option.
    pub reuseaddr: Option<bool>,
    /// Whether to enable the SO_REUSEPORT option.
    pub reuseport: Option<bool>,

    /// Maximum allowed mqtt message length. 0 means unlimited, default: 1M
    pub max_packet_size: u32,
    /// Initial capacity of the per-connection read buffer.
    pub reader_buffer_size: usize,
    /// Initial capacity of the per-connection write buffer.
    pub writer_buffer_size: usize,

    /// Deadline for the first packet, including the TLS handshake.
    pub read_timeout: Duration,
    /// Per-write deadline.
    pub send_timeout: Duration,
    /// Default inter-packet deadline; overridden per connection by
    /// 1.5 x keep-alive once CONNECT is handled. Zero disables it.
    pub idle_timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 1883)),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_packet_size: 1024 * 1024,
            reader_buffer_size: 1024,
            writer_buffer_size: 1024,
            read_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            idle_timeout: Duration::ZERO,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self) -> Self {
        self.nodelay = true;
        self
    }

    pub fn reuseaddr(mut self) -> Self {
        self.reuseaddr = Some(true);
        self
    }

    pub fn reuseport(mut self) -> Self {
        self.reuseport = Some(true);
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn reader_buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.reader_buffer_size = size;
        }
        self
    }

    pub fn writer_buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.writer_buffer_size = size;
        }
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn bind(self) -> Result<Listener> {
        let builder = match self.laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_nonblocking(true)?;

        #[cfg(not(windows))]
        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        #[cfg(not(windows))]
        if let Some(reuseport) = self.reuseport {
            builder.set_reuse_port(reuseport)?;
        }

        builder.bind(&SockAddr::from(self.laddr))?;
        builder.listen(self.backlog)?;
        let l = TcpListener::from_std(std::net::TcpListener::from(builder))?;
        log::info!("Starting {} Listening on {}", self.name, self.laddr);
        Ok(Listener { cfg: Arc::new(self), l })
    }
}

pub struct Listener {
    pub cfg: Arc<Builder>,
    l: TcpListener,
}

impl Listener {
    /// Upgrades the listener to TLS. The acceptor channel is fed by a
    /// certificate source and may be updated while the listener runs; every
    /// handshake consults the current value.
    pub fn tls(self, acceptor: watch::Receiver<TlsAcceptor>) -> TlsListener {
        TlsListener { inner: self, acceptor }
    }

    pub async fn accept(&self) -> Result<Acceptor> {
        let (socket, remote_addr) = self.l.accept().await?;
        if let Err(e) = socket.set_nodelay(self.cfg.nodelay) {
            return Err(Error::from(e));
        }
        Ok(Acceptor { socket, remote_addr, acceptor: None, cfg: self.cfg.clone() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.l.local_addr()?)
    }
}

pub struct TlsListener {
    inner: Listener,
    acceptor: watch::Receiver<TlsAcceptor>,
}

impl Deref for TlsListener {
    type Target = Listener;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for TlsListener {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl TlsListener {
    pub async fn accept(&self) -> Result<Acceptor> {
        let (socket, remote_addr) = self.inner.l.accept().await?;
        if let Err(e) = socket.set_nodelay(self.cfg.nodelay) {
            return Err(Error::from(e));
        }
        Ok(Acceptor {
            socket,
            remote_addr,
            acceptor: Some(self.acceptor.borrow().clone()),
            cfg: self.cfg.clone(),
        })
    }
}

pub struct Acceptor {
    pub(crate) socket: TcpStream,
    acceptor: Option<TlsAcceptor>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl Acceptor {
    #[inline]
    pub fn tcp(self) -> Dispatcher {
        Dispatcher::new(Box::new(self.socket) as BoxedIo, self.remote_addr, false, self.cfg)
    }

    /// Runs the TLS handshake under the read deadline. Failures are
    /// reported to the caller, which closes silently.
    #[inline]
    pub async fn tls(self) -> Result<Dispatcher> {
        let acceptor = self.acceptor.ok_or(MqttError::ServiceUnavailable)?;
        let tls_s = match tokio::time::timeout(self.cfg.read_timeout, acceptor.accept(self.socket)).await {
            Ok(Ok(tls_s)) => tls_s,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MqttError::ReadTimeout.into()),
        };
        Ok(Dispatcher::new(Box::new(tls_s) as BoxedIo, self.remote_addr, true, self.cfg))
    }
}
