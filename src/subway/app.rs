use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::subway::{
    admin, config, logging,
    telemetry::{FacadeMetrics, SharedMetrics},
    tunnel::{
        auth::StaticTokens,
        client::{Client, ClientOptions},
        forwarder::ForwarderOptions,
        ingress::{HttpIngress, HttpIngressOptions},
        pump::PumpOptions,
        registry::Registry,
        server::{Server, ServerOptions},
        session::SessionConfig,
        transport::{TlsDialOptions, TlsListenOptions, TransportDialOptions, TransportListenOptions},
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        server_enabled = cfg.server.is_some(),
        client_enabled = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "subway: starting"
    );

    let metrics: SharedMetrics = Arc::new(FacadeMetrics);
    let session_cfg = SessionConfig {
        window: cfg.session.window,
        heartbeat_interval: cfg.session.heartbeat_interval,
        idle_timeout: cfg.session.idle_timeout,
    };
    let stream_idle = (!cfg.stream.idle_timeout.is_zero()).then_some(cfg.stream.idle_timeout);
    let pump_opts = PumpOptions {
        idle_timeout: stream_idle,
        buffer_size: cfg.stream.buffer_size,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut registry: Option<Arc<Registry>> = None;

    // Tunnel server + public HTTP ingress.
    if let Some(sc) = &cfg.server {
        let reg = Arc::new(Registry::new());
        registry = Some(reg.clone());

        let auth = StaticTokens::new(&sc.auth_tokens);
        if auth.is_open() {
            tracing::warn!("tunnel: no auth_tokens configured; any client may register");
        }

        let server = Server::new(ServerOptions {
            listen_addr: sc.listen_addr.clone(),
            transport: sc.transport.clone(),
            listen: TransportListenOptions {
                tls: TlsListenOptions {
                    cert_file: sc.tls.cert_file.clone(),
                    key_file: sc.tls.key_file.clone(),
                },
                ws_path: sc.ws_path.clone(),
            },
            domain: sc.domain.clone(),
            public_scheme: sc.public_scheme.clone(),
            tcp_bind_host: sc.tcp_bind_host.clone(),
            session: session_cfg,
            handshake_timeout: cfg.session.handshake_timeout,
            stream: pump_opts,
            drain_timeout: cfg.session.drain_timeout,
            registry: reg.clone(),
            auth: Arc::new(auth),
            metrics: metrics.clone(),
        });
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });

        if !sc.http_addr.is_empty() {
            let ingress = Arc::new(HttpIngress::new(
                reg,
                HttpIngressOptions {
                    max_header_bytes: sc.max_header_bytes,
                    header_timeout: sc.header_timeout,
                    stream: pump_opts,
                },
            ));
            let addr = sc.http_addr.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { ingress.listen_and_serve(&addr, shutdown).await });
        }
    }

    // Tunnel client.
    if let Some(cc) = &cfg.client {
        let client = Client::new(ClientOptions {
            server_addr: cc.server_addr.clone(),
            transport: cc.transport.clone(),
            dial: TransportDialOptions {
                tls: TlsDialOptions {
                    server_name: cc.tls.server_name.clone(),
                    insecure_skip_verify: cc.tls.insecure_skip_verify,
                    ca_file: cc.tls.ca_file.clone(),
                },
                ws_path: cc.ws_path.clone(),
                subdomain: cc.subdomain.clone(),
            },
            subdomain: cc.subdomain.clone(),
            token: cc.token.clone(),
            proto: cc.proto,
            remote_port: cc.remote_port,
            dial_timeout: cc.dial_timeout,
            handshake_timeout: cfg.session.handshake_timeout,
            session: session_cfg,
            forward: ForwarderOptions {
                local_addr: cc.local_addr.clone(),
                dial_timeout: cfg.stream.dial_timeout,
                idle_timeout: stream_idle,
                buffer_size: cfg.stream.buffer_size,
            },
            drain_timeout: cfg.session.drain_timeout,
            metrics: metrics.clone(),
        });
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = cfg
            .admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState { registry };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or a task ending on its own.
    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => tracing::info!("shutdown: task finished"),
                Some(Ok(Err(err))) => failure = Some(err),
                Some(Err(join_err)) => failure = Some(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    // Sessions get their drain grace; the cap only matters if something hangs.
    let cap = cfg.session.drain_timeout + Duration::from_secs(5);
    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::warn!(err = %err, "shutdown: task failed during teardown");
            }
        }
    };
    if tokio::time::timeout(cap, drain).await.is_err() {
        tracing::warn!(cap = %humantime::format_duration(cap), "shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
