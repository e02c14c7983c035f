use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use prometheus::{Encoder, Registry, TextEncoder};
use salvo::http::header::CONTENT_TYPE;
use salvo::http::HeaderValue;
use salvo::prelude::*;
use salvo::server::ServerHandle;

use crate::Result;

const LANDING_PAGE: &str = r#"<html>
<head><title>mqrelay</title></head>
<body>
<h1>mqrelay</h1>
<p>MQTT ingress proxy</p>
<ul>
<li><a href="/metrics">metrics</a></li>
<li><a href="/healthy">healthy</a></li>
<li><a href="/ready">ready</a></li>
</ul>
</body>
</html>"#;

/// Liveness/readiness flags served by the HTTP prober. `healthy` flips on
/// when the HTTP server starts, `ready` when the MQTT server accepts;
/// shutdown flips both off.
#[derive(Default)]
pub struct Probes {
    healthy: AtomicBool,
    ready: AtomicBool,
}

impl Probes {
    pub fn new() -> Arc<Probes> {
        Arc::new(Probes::default())
    }

    pub fn healthy(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    pub fn not_healthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

struct LandingHandler;

#[async_trait]
impl Handler for LandingHandler {
    async fn handle(&self, _req: &mut Request, _depot: &mut Depot, res: &mut Response, _ctrl: &mut FlowCtrl) {
        res.render(Text::Html(LANDING_PAGE));
    }
}

struct MetricsHandler {
    registry: Registry,
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn handle(&self, _req: &mut Request, _depot: &mut Depot, res: &mut Response, _ctrl: &mut FlowCtrl) {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            log::error!("encoding metrics failed, {:?}", e);
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            return;
        }
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
        res.write_body(buffer).ok();
    }
}

struct ProbeHandler {
    probes: Arc<Probes>,
    check: fn(&Probes) -> bool,
}

#[async_trait]
impl Handler for ProbeHandler {
    async fn handle(&self, _req: &mut Request, _depot: &mut Depot, res: &mut Response, _ctrl: &mut FlowCtrl) {
        if (self.check)(&self.probes) {
            res.render(Text::Plain("OK"));
        } else {
            res.status_code(StatusCode::SERVICE_UNAVAILABLE);
            res.render(Text::Plain("NOT OK"));
        }
    }
}

/// HTTP side server: landing page, prometheus exposition and the two
/// probes.
pub struct HttpServer {
    handle: ServerHandle,
    probes: Arc<Probes>,
    grace_period: Duration,
}

impl HttpServer {
    /// Binds and starts serving in a background task; `healthy` flips OK
    /// once the server runs.
    pub async fn start(
        listen_address: &str,
        registry: Registry,
        probes: Arc<Probes>,
        grace_period: Duration,
    ) -> Result<HttpServer> {
        let addr: SocketAddr =
            listen_address.parse().map_err(|e| anyhow!("http listen address: {}", e))?;

        let router = Router::new()
            .get(LandingHandler)
            .push(Router::with_path("metrics").get(MetricsHandler { registry }))
            .push(Router::with_path("healthy").get(ProbeHandler {
                probes: probes.clone(),
                check: Probes::is_healthy,
            }))
            .push(Router::with_path("ready").get(ProbeHandler {
                probes: probes.clone(),
                check: Probes::is_ready,
            }));

        let acceptor = TcpListener::new(addr).bind().await;
        let server = Server::new(acceptor);
        let handle = server.handle();
        tokio::spawn(async move {
            server.serve(router).await;
        });

        log::info!("Listening for HTTP on {}", addr);
        probes.healthy();
        Ok(HttpServer { handle, probes, grace_period })
    }

    pub async fn shutdown(&self) {
        self.probes.not_healthy();
        self.probes.not_ready();
        self.handle.stop_graceful(self.grace_period);
    }
}
