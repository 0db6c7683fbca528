//! ---
//! aasb_section: "05-tooling"
//! aasb_subsection: "binary"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Operator CLI for the AASB broker."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! `aasbctl serve`: the platform end of one engine link.
//!
//! The engine is a single peer, so one connection is served at a time and
//! extra connections are refused until the active one goes away.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aasb_common::{init_tracing, AppConfig};
use aasb_logging::{log_lifecycle_event, LifecycleOutcome};
use aasb_metrics::{new_registry, spawn_http_server, ServiceMetrics};
use aasb_msg::{
    ConnectionState, IpcListener, IpcTransport, MessageBroker, MessageJournal,
    MessagingMetricsExporter, Transport,
};
use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use crate::ResolvedConfig;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Socket to listen on; defaults to `transport.socket_path`.
    #[arg(long, value_name = "PATH", env = "AASB_SOCKET")]
    socket: Option<PathBuf>,

    /// Record traffic to this journal, overriding `[journal]`.
    #[arg(long, value_name = "FILE")]
    journal: Option<PathBuf>,

    /// Serve metrics on this address even when `[metrics]` is disabled.
    #[arg(long = "metrics-listen", value_name = "ADDR")]
    metrics_listen: Option<SocketAddr>,
}

struct Session {
    broker: Arc<MessageBroker>,
}

impl Session {
    fn start(
        transport: IpcTransport,
        config: &AppConfig,
        exporter: MessagingMetricsExporter,
        journal: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = MessageBroker::builder(Arc::new(transport))
            .config(config.broker.clone())
            .metrics(exporter);
        if let Some(path) = journal {
            let journal = MessageJournal::open(path)
                .with_context(|| format!("failed to open journal {}", path.display()))?;
            builder = builder.journal(journal);
        }
        let broker = Arc::new(builder.build().context("failed to attach broker")?);

        for responder in &config.responders {
            let link = Arc::downgrade(&broker);
            let payload = responder.payload.clone();
            broker.subscribe(
                responder.topic.as_str(),
                responder.action.as_str(),
                move |request| {
                    if request.is_reply() {
                        return Ok(());
                    }
                    if let Some(broker) = link.upgrade() {
                        broker.reply(request, payload.as_str())?;
                    }
                    Ok(())
                },
            );
        }
        info!(responders = config.responders.len(), "engine connected");
        Ok(Self { broker })
    }

    fn is_live(&self) -> bool {
        self.broker.connection_state() == ConnectionState::Connected
    }

    fn close(self) {
        let metrics = self.broker.metrics();
        self.broker.shutdown();
        info!(
            sent = metrics.sent,
            received = metrics.received,
            correlated = metrics.correlated,
            "engine session closed"
        );
    }
}

pub fn run(args: ServeArgs, resolved: ResolvedConfig) -> Result<()> {
    let ResolvedConfig {
        config,
        source,
        load_time,
    } = resolved;
    init_tracing("aasbctl", &config.logging)?;
    if let Some(source) = &source {
        info!(config = %source.display(), "configuration loaded");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("aasbctl-rt")
        .build()
        .context("failed to start async runtime")?;

    let registry = new_registry();
    let service_metrics = ServiceMetrics::new(registry.clone())?;
    service_metrics.observe_config_load(load_time.as_secs_f64());
    service_metrics.inc_start();
    service_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );
    let exporter = MessagingMetricsExporter::register(&registry)
        .context("failed to register messaging metrics")?;

    let metrics_server = match args.metrics_listen {
        Some(addr) => Some(addr),
        None if config.metrics.enabled => Some(config.metrics.listen),
        None => None,
    }
    .map(|addr| {
        let _guard = runtime.enter();
        spawn_http_server(registry.clone(), addr)
    })
    .transpose()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let socket = args
        .socket
        .unwrap_or_else(|| config.transport.socket_path.clone());
    let listener = IpcListener::bind(&socket, config.transport.max_frame_bytes)
        .with_context(|| format!("failed to bind broker socket {}", socket.display()))?;
    let journal = args.journal.or_else(|| {
        if config.journal.enabled {
            config.journal.path.clone()
        } else {
            None
        }
    });
    log_lifecycle_event(
        None,
        "serve.start",
        &format!("listening on {}", listener.path().display()),
        LifecycleOutcome::Success,
    );

    let mut session: Option<Session> = None;
    while !stop.load(Ordering::SeqCst) {
        if session.as_ref().is_some_and(|active| !active.is_live()) {
            if let Some(finished) = session.take() {
                finished.close();
                service_metrics.connection_closed();
            }
        }

        match listener.try_accept().context("failed to accept connection")? {
            Some(transport) if session.is_some() => {
                warn!("engine link already active; refusing connection");
                transport.disconnect();
            }
            Some(transport) => {
                match Session::start(transport, &config, exporter.clone(), journal.as_deref()) {
                    Ok(started) => {
                        service_metrics.connection_opened();
                        session = Some(started);
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "engine session failed to start"),
                }
            }
            None => thread::sleep(ACCEPT_POLL),
        }
    }

    if let Some(active) = session.take() {
        active.close();
        service_metrics.connection_closed();
    }
    drop(listener);
    if let Some(server) = metrics_server {
        runtime.block_on(server.shutdown())?;
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    log_lifecycle_event(
        None,
        "serve.stop",
        &format!("stopped serving {}", socket.display()),
        LifecycleOutcome::Success,
    );
    Ok(())
}
