use std::str::FromStr;
use std::sync::Arc;

use structopt::StructOpt;

use mqrelay::auth::{Authenticator, InstrumentedAuthenticator, NoopAuthenticator, PlainAuthenticator};
use mqrelay::conf::{Options, Settings};
use mqrelay::handler::{HandlerOptions, MqttHandler};
use mqrelay::http::{HttpServer, Probes};
use mqrelay::logger::logger_init;
use mqrelay::metrics::Metrics;
use mqrelay::net::{Builder, FileCertSource};
use mqrelay::publisher::{
    InstrumentedPublisher, KafkaPublisher, MessageFormat, NoopPublisher, Publisher,
    RabbitmqPublisher, SnsPublisher, SqsPublisher,
};
use mqrelay::server::{MqttListener, MqttServer, ServerClosed};
use mqrelay::Result;

fn main() {
    let opts = Options::from_args();
    let settings = match Settings::init(opts) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("config error: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = logger_init(&settings.log) {
        eprintln!("logger error: {e:#}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("runtime setup failed, {:?}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(settings)) {
        log::error!("setup failed, {:?}", e);
        std::process::exit(1);
    }
}

async fn run(settings: &'static Settings) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let probes = Probes::new();

    let authenticator = build_authenticator(settings, &metrics)?;
    let publisher = build_publisher(settings, &metrics).await?;

    let handler = Arc::new(MqttHandler::new(
        authenticator,
        publisher.clone(),
        metrics.clone(),
        handler_options(settings),
    ));
    let server = MqttServer::new(handler, metrics.clone());

    let http_server = HttpServer::start(
        &settings.http.listen_address,
        metrics.registry.clone(),
        probes.clone(),
        settings.http.grace_period,
    )
    .await?;

    // publisher delivery-report workers
    let publisher_serve = {
        let publisher = publisher.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.serve().await {
                log::error!("publisher serve failed, {:?}", e);
            }
        })
    };

    let listener = bind_mqtt_listener(settings)?;
    let accept_loop = {
        let server = server.clone();
        tokio::spawn(async move {
            match server.serve(listener).await {
                Err(e) if e.downcast_ref::<ServerClosed>().is_some() => {}
                Err(e) => log::error!("mqtt serve failed, {:?}", e),
                Ok(()) => {}
            }
        })
    };
    probes.ready();

    wait_for_signal().await?;
    log::info!("shutdown signal received");

    // ordered shutdown: stop advertising, drain MQTT, then the publisher,
    // then the HTTP side
    probes.not_ready();
    if let Err(e) = server.shutdown(settings.mqtt.grace_period).await {
        log::warn!("graceful drain incomplete, {:?}", e);
        server.close();
    }
    accept_loop.abort();
    publisher.shutdown().await;
    publisher_serve.abort();
    http_server.shutdown().await;

    log::info!("mqrelay stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

fn handler_options(settings: &Settings) -> HandlerOptions {
    let handler = &settings.mqtt.handler;
    HandlerOptions {
        ignore_unsupported: handler.ignore_unsupported.iter().cloned().collect(),
        allow_unauthenticated: handler.allow_unauthenticated.iter().cloned().collect(),
        publish_timeout: handler.publish.timeout,
        publish_async_at_most_once: handler.publish.r#async.at_most_once,
        publish_async_at_least_once: handler.publish.r#async.at_least_once,
        publish_async_exactly_once: handler.publish.r#async.exactly_once,
    }
}

fn build_authenticator(settings: &Settings, metrics: &Metrics) -> Result<Arc<dyn Authenticator>> {
    let cfg = &settings.mqtt.handler.authenticator;
    let authenticator: Arc<dyn Authenticator> = match cfg.name.as_str() {
        mqrelay::conf::AUTH_PLAIN => Arc::new(PlainAuthenticator::new(
            cfg.plain.credentials.clone(),
            Some(cfg.plain.credentials_file.as_str()),
        )?),
        _ => Arc::new(NoopAuthenticator),
    };
    log::info!("authenticator: {}", authenticator.name());
    Ok(Arc::new(InstrumentedAuthenticator::new(authenticator, metrics)?))
}

async fn build_publisher(settings: &Settings, metrics: &Metrics) -> Result<Arc<dyn Publisher>> {
    let cfg = &settings.mqtt.publisher;
    let message_format = MessageFormat::from_str(&cfg.message_format)?;
    let publisher: Arc<dyn Publisher> = match cfg.name.as_str() {
        mqrelay::conf::PUBLISHER_KAFKA => Arc::new(KafkaPublisher::new(&cfg.kafka)?),
        mqrelay::conf::PUBLISHER_RABBITMQ => {
            Arc::new(RabbitmqPublisher::new(&cfg.rabbitmq, message_format)?)
        }
        mqrelay::conf::PUBLISHER_SQS => Arc::new(SqsPublisher::new(&cfg.sqs, message_format).await?),
        mqrelay::conf::PUBLISHER_SNS => Arc::new(SnsPublisher::new(&cfg.sns, message_format).await?),
        _ => Arc::new(NoopPublisher::new()),
    };
    log::info!("publisher: {}, message format: {}", publisher.name(), message_format.as_str());
    Ok(Arc::new(InstrumentedPublisher::new(publisher, metrics)?))
}

fn bind_mqtt_listener(settings: &Settings) -> Result<MqttListener> {
    let mqtt = &settings.mqtt;
    let laddr = mqtt
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("mqtt listen address: {}", e))?;

    let listener = Builder::new()
        .name("mqtt")
        .laddr(laddr)
        .nodelay()
        .max_packet_size(mqtt.max_packet_size)
        .reader_buffer_size(mqtt.reader_buffer_size)
        .writer_buffer_size(mqtt.writer_buffer_size)
        .read_timeout(mqtt.read_timeout)
        .send_timeout(mqtt.write_timeout)
        .idle_timeout(mqtt.idle_timeout)
        .bind()?;

    if mqtt.tls.enable {
        let source = FileCertSource {
            cert: mqtt.tls.file.cert.clone(),
            key: mqtt.tls.file.key.clone(),
            client_ca: mqtt.tls.file.client_ca(),
            client_crl: mqtt.tls.file.client_crl(),
            refresh: mqtt.tls.refresh,
        };
        Ok(MqttListener::Tls(listener.tls(source.spawn()?)))
    } else {
        Ok(MqttListener::Tcp(listener))
    }
}
