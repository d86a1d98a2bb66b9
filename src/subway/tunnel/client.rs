use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::subway::telemetry::{MetricsSink, NoopMetrics};
use crate::subway::tunnel::{
    error::{CloseReason, TunnelError},
    forwarder::{Forwarder, ForwarderOptions},
    frame::{AuthRequest, Frame, FrameType, PROTOCOL_VERSION, TunnelProto, read_frame, write_frame},
    session::{Role, Session, SessionConfig, SessionParams},
    stream::DEFAULT_WINDOW,
    transport::{TransportDialOptions, transport_by_name},
};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    pub dial: TransportDialOptions,
    pub subdomain: String,
    pub token: String,
    pub proto: TunnelProto,
    /// Public port requested for TCP tunnels; 0 lets the server pick.
    pub remote_port: u16,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
    pub forward: ForwarderOptions,
    pub drain_timeout: Duration,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            transport: "tcp".into(),
            dial: TransportDialOptions::default(),
            subdomain: String::new(),
            token: String::new(),
            proto: TunnelProto::Http,
            remote_port: 0,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
            forward: ForwarderOptions::default(),
            drain_timeout: Duration::from_secs(5),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// How a connected session ended.
enum Ended {
    Shutdown,
    Lost(CloseReason),
}

/// Keeps one tunnel registered with the server, reconnecting with backoff
/// whenever the session drops.
pub struct Client {
    opts: ClientOptions,
    forwarder: Forwarder,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> Self {
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(10);
        }
        if opts.handshake_timeout.is_zero() {
            opts.handshake_timeout = Duration::from_secs(10);
        }
        opts.dial.subdomain = opts.subdomain.clone();
        let forwarder = Forwarder::new(opts.forward.clone());
        Self { opts, forwarder }
    }

    /// Runs until shutdown. Authentication rejections are final; every other
    /// failure is retried.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if self.opts.subdomain.trim().is_empty() {
            anyhow::bail!("tunnel: client subdomain is required");
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(Ended::Shutdown) => return Ok(()),
                Ok(Ended::Lost(reason)) => {
                    // A session that came up resets the backoff.
                    backoff = Duration::from_secs(1);
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        reason = %reason,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
                Err(TunnelError::AuthRejected(reason)) => {
                    tracing::error!(
                        server = %self.opts.server_addr,
                        subdomain = %self.opts.subdomain,
                        reason = %reason,
                        "tunnel: registration rejected"
                    );
                    anyhow::bail!("tunnel: registration rejected: {reason}");
                }
                Err(err) => {
                    tracing::warn!(
                        transport = %self.opts.transport,
                        server = %self.opts.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: connect failed; retrying"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> Result<Ended, TunnelError> {
        let session = self.connect().await?;
        tracing::info!(
            session = %session.id(),
            subdomain = %session.subdomain(),
            public_url = %session.public_url(),
            local = %self.opts.forward.local_addr,
            "tunnel: connected"
        );

        let fwd = self.forwarder.clone();
        let serving = session.clone();
        tokio::spawn(async move { fwd.serve(serving).await });

        let stopped = async {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    return;
                }
            }
        };
        tokio::select! {
            _ = session.closed() => Ok(Ended::Lost(
                session.close_reason().unwrap_or(CloseReason::PeerClosed),
            )),
            _ = stopped => {
                session.drain(self.opts.drain_timeout).await;
                Ok(Ended::Shutdown)
            }
        }
    }

    /// Dials the server and completes the AUTH handshake.
    pub async fn connect(&self) -> Result<Arc<Session>, TunnelError> {
        let tr = transport_by_name(&self.opts.transport)
            .map_err(|e| TunnelError::protocol(e.to_string()))?;

        let conn = tokio::time::timeout(
            self.opts.dial_timeout,
            tr.dial(&self.opts.server_addr, self.opts.dial.clone()),
        )
        .await
        .map_err(|_| TunnelError::Timeout("dial"))?
        .map_err(|e| TunnelError::Dial {
            addr: self.opts.server_addr.clone(),
            source: std::io::Error::other(format!("{e:#}")),
        })?;
        let remote_addr = conn.remote_addr;
        let mut stream = conn.stream;

        let window = if self.opts.session.window == 0 {
            DEFAULT_WINDOW
        } else {
            self.opts.session.window
        };
        let req = AuthRequest {
            version: PROTOCOL_VERSION,
            subdomain: self.opts.subdomain.trim().to_string(),
            token: self.opts.token.clone(),
            proto: self.opts.proto,
            remote_port: self.opts.remote_port,
            window,
        };

        let ack = tokio::time::timeout(self.opts.handshake_timeout, async {
            write_frame(&mut stream, &Frame::auth(&req)?).await?;
            stream.flush().await?;
            let Some(frame) = read_frame(&mut stream).await? else {
                return Err(TunnelError::protocol("server closed during handshake"));
            };
            if frame.ty != FrameType::AuthAck {
                return Err(TunnelError::protocol(format!(
                    "expected AUTH_ACK, got {:?}",
                    frame.ty
                )));
            }
            Ok::<_, TunnelError>(frame.parse_auth_ack()?)
        })
        .await
        .map_err(|_| TunnelError::Timeout("handshake"))??;

        if !ack.ok {
            return Err(TunnelError::AuthRejected(ack.reason));
        }

        let mut params = SessionParams::new(req.subdomain, Role::Client);
        params.id = (!ack.session_id.is_empty()).then_some(ack.session_id);
        params.proto = self.opts.proto;
        params.public_url = ack.public_url;
        params.remote_addr = remote_addr;
        params.config = self.opts.session;
        params.config.window = window;
        params.peer_window = if ack.window == 0 {
            DEFAULT_WINDOW
        } else {
            ack.window
        };
        params.metrics = self.opts.metrics.clone();
        let session = Session::new(params);
        session.run(stream);
        Ok(session)
    }
}
