use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::subway::net::join_host_port;
use crate::subway::telemetry::{MetricsSink, NoopMetrics};
use crate::subway::tunnel::{
    auth::{AuthProvider, StaticTokens},
    error::{CloseReason, TunnelError},
    frame::{AuthAck, AuthRequest, Frame, FrameType, PROTOCOL_VERSION, TunnelProto, read_frame, write_frame},
    ingress::TcpIngress,
    pump::PumpOptions,
    registry::{Registry, normalize_subdomain},
    session::{Role, Session, SessionConfig, SessionParams},
    stream::DEFAULT_WINDOW,
    transport::{
        BoxedStream, PendingConn, TransportConn, TransportListenOptions, TransportListener,
        host_of, transport_by_name,
    },
};

#[derive(Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub listen: TransportListenOptions,
    /// Base domain tunnels are published under, e.g. `tunnel.example.com`.
    pub domain: String,
    /// Scheme used in the public URL handed to HTTP tunnels.
    pub public_scheme: String,
    /// Host TCP tunnel listeners bind on.
    pub tcp_bind_host: String,
    pub session: SessionConfig,
    pub handshake_timeout: Duration,
    pub stream: PumpOptions,
    pub drain_timeout: Duration,
    pub registry: Arc<Registry>,
    pub auth: Arc<dyn AuthProvider>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7000".into(),
            transport: "tcp".into(),
            listen: TransportListenOptions::default(),
            domain: "localhost".into(),
            public_scheme: "http".into(),
            tcp_bind_host: "0.0.0.0".into(),
            session: SessionConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            stream: PumpOptions::default(),
            drain_timeout: Duration::from_secs(5),
            registry: Arc::new(Registry::new()),
            auth: Arc::new(StaticTokens::default()),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// Accepts tunnel clients, authenticates them and keeps their sessions
/// registered for the ingress side.
#[derive(Clone)]
pub struct Server {
    opts: Arc<ServerOptions>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.opts.registry.clone()
    }

    pub async fn bind(&self) -> anyhow::Result<Box<dyn TransportListener>> {
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr
            .listen(&self.opts.listen_addr, self.opts.listen.clone())
            .await?;
        tracing::info!(
            addr = %self.opts.listen_addr,
            transport = %tr.name(),
            domain = %self.opts.domain,
            "tunnel: listening"
        );
        Ok(ln)
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.bind().await?;
        self.serve(ln, shutdown).await;
        Ok(())
    }

    /// Runs the accept loop until shutdown, then drains every live session.
    pub async fn serve(&self, ln: Box<dyn TransportListener>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => match res {
                    Ok(pending) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_pending(pending).await });
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "tunnel: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
        drop(ln);

        let sessions = self.opts.registry.sessions();
        if !sessions.is_empty() {
            tracing::info!(sessions = sessions.len(), "tunnel: draining sessions");
        }
        let grace = self.opts.drain_timeout;
        futures_util::future::join_all(sessions.iter().map(|s| s.drain(grace))).await;
    }

    async fn handle_pending(&self, pending: PendingConn) {
        let conn = match tokio::time::timeout(self.opts.handshake_timeout, pending).await {
            Ok(Ok(c)) => c,
            Ok(Err(err)) => {
                tracing::debug!(err = %err, "tunnel: transport handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!("tunnel: transport handshake timed out");
                return;
            }
        };
        let remote = conn.remote_addr;
        if let Err(err) = self.handle_conn(conn).await {
            tracing::warn!(client = ?remote, err = %err, "tunnel: session ended with error");
        }
    }

    async fn handle_conn(&self, conn: TransportConn) -> Result<(), TunnelError> {
        let TransportConn {
            mut stream,
            remote_addr,
        } = conn;

        let first = tokio::time::timeout(self.opts.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| TunnelError::Timeout("handshake"))??;
        let Some(first) = first else {
            return Err(TunnelError::protocol("connection closed before AUTH"));
        };
        if first.ty != FrameType::Auth {
            reject(&mut stream, "expected AUTH").await;
            return Err(TunnelError::protocol(format!(
                "expected AUTH, got {:?}",
                first.ty
            )));
        }
        let req = match first.parse_auth() {
            Ok(r) => r,
            Err(err) => {
                reject(&mut stream, "malformed AUTH").await;
                return Err(err.into());
            }
        };

        let (session, tcp) = match self.admit(&req, remote_addr).await {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(
                    client = ?remote_addr,
                    subdomain = %req.subdomain,
                    reason = %reason,
                    "tunnel: registration rejected"
                );
                reject(&mut stream, &reason).await;
                return Err(TunnelError::AuthRejected(reason));
            }
        };

        let ack = AuthAck {
            ok: true,
            reason: String::new(),
            session_id: session.id().to_string(),
            public_url: session.public_url().to_string(),
            window: self.opts.session.window,
        };
        let sent = tokio::time::timeout(self.opts.handshake_timeout, async {
            write_frame(&mut stream, &Frame::auth_ack(&ack)?).await?;
            stream.flush().await?;
            Ok::<(), TunnelError>(())
        })
        .await
        .map_err(|_| TunnelError::Timeout("handshake"))
        .and_then(|r| r);
        if let Err(err) = sent {
            session.close(CloseReason::from(&err));
            return Err(err);
        }

        session.run(stream);
        if let Some(tcp) = tcp {
            tcp.spawn(session.clone(), self.opts.stream);
        }
        tracing::info!(
            session = %session.id(),
            subdomain = %session.subdomain(),
            proto = %session.proto(),
            public_url = %session.public_url(),
            client = ?remote_addr,
            "tunnel: client connected"
        );

        session.closed().await;
        tracing::info!(
            session = %session.id(),
            subdomain = %session.subdomain(),
            reason = ?session.close_reason(),
            "tunnel: client disconnected"
        );
        Ok(())
    }

    /// Validates a registration and reserves its subdomain. The error is the
    /// reason sent back to the client.
    async fn admit(
        &self,
        req: &AuthRequest,
        remote_addr: Option<std::net::SocketAddr>,
    ) -> Result<(Arc<Session>, Option<TcpIngress>), String> {
        if req.version != 0 && req.version != PROTOCOL_VERSION {
            return Err(format!("unsupported protocol version {}", req.version));
        }
        let Some(subdomain) = normalize_subdomain(&req.subdomain) else {
            return Err(format!("invalid subdomain {:?}", req.subdomain));
        };
        if !self.opts.auth.authenticate(&req.token) {
            return Err("invalid token".into());
        }

        let (public_url, tcp) = match req.proto {
            TunnelProto::Http => (self.http_url(&subdomain), None),
            TunnelProto::Tcp => {
                let addr = join_host_port(&self.opts.tcp_bind_host, req.remote_port);
                let ln = TcpIngress::bind(&addr)
                    .await
                    .map_err(|e| format!("tcp listener bind {addr}: {e}"))?;
                let port = ln.local_addr().map(|a| a.port()).unwrap_or(req.remote_port);
                (format!("tcp://{}:{port}", host_of(&self.opts.domain)), Some(ln))
            }
        };

        let mut params = SessionParams::new(subdomain.clone(), Role::Server);
        params.proto = req.proto;
        params.public_url = public_url;
        params.remote_addr = remote_addr;
        params.config = self.opts.session;
        params.peer_window = if req.window == 0 {
            DEFAULT_WINDOW
        } else {
            req.window
        };
        params.registry = Some(self.opts.registry.clone());
        params.metrics = self.opts.metrics.clone();
        let session = Session::new(params);

        self.opts
            .registry
            .register(&subdomain, session.clone())
            .map_err(|e| e.to_string())?;
        Ok((session, tcp))
    }

    fn http_url(&self, subdomain: &str) -> String {
        let scheme = match self.opts.public_scheme.trim() {
            "" => "http",
            s => s,
        };
        format!("{scheme}://{subdomain}.{}", self.opts.domain)
    }
}

async fn reject(stream: &mut BoxedStream, reason: &str) {
    let Ok(frame) = Frame::auth_ack(&AuthAck::rejected(reason)) else {
        return;
    };
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        write_frame(stream, &frame).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok::<(), TunnelError>(())
    })
    .await;
}
