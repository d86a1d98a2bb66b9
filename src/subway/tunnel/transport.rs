use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so
/// `AsyncRead + AsyncWrite` is wrapped into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// An established transport connection, ready for the tunnel handshake.
pub struct TransportConn {
    pub stream: BoxedStream,
    pub remote_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for TransportConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConn")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Transport-level handshake (TLS, WebSocket upgrade) still to be driven.
/// Listeners hand these out so a slow peer never stalls the accept loop.
pub type PendingConn = Pin<Box<dyn Future<Output = anyhow::Result<TransportConn>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct TlsListenOptions {
    /// Both empty: a self-signed certificate for `localhost` is generated.
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialOptions {
    /// Defaults to the host part of the dialed address.
    pub server_name: String,
    pub insecure_skip_verify: bool,
    /// Extra PEM roots trusted next to the bundled web PKI roots.
    pub ca_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub tls: TlsListenOptions,
    pub ws_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub tls: TlsDialOptions,
    pub ws_path: String,
    /// Sent as a query parameter on WebSocket upgrades, for proxies that route
    /// on it. The AUTH frame stays authoritative.
    pub subdomain: String,
}

pub const DEFAULT_WS_PATH: &str = "/tunnel";

pub(crate) fn ws_path(p: &str) -> String {
    let p = p.trim();
    if p.is_empty() {
        return DEFAULT_WS_PATH.to_string();
    }
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<TransportConn>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<PendingConn>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "tls" | "ws" | "wss" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|tls|ws|wss)"),
    }
}

pub mod tcp;
pub mod tls;
pub mod ws;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    Ok(match n.as_str() {
        "tls" => Arc::new(tls::TlsTransport),
        "ws" => Arc::new(ws::WsTransport::plain()),
        "wss" => Arc::new(ws::WsTransport::secure()),
        _ => Arc::new(tcp::TcpTransport),
    })
}

/// Host part of `host:port`, without IPv6 brackets.
pub(crate) fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parse_transport_accepts_known_names() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" WSS ").unwrap(), "wss");
        assert!(parse_transport("quic").is_err());
    }

    #[test]
    fn host_of_strips_port_and_brackets() {
        assert_eq!(host_of("tunnel.example.com:443"), "tunnel.example.com");
        assert_eq!(host_of("[::1]:7000"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn ws_path_is_normalized() {
        assert_eq!(ws_path(""), "/tunnel");
        assert_eq!(ws_path("t"), "/t");
        assert_eq!(ws_path("/x/y"), "/x/y");
    }

    async fn echo_roundtrip(name: &str) {
        let tr = transport_by_name(name).unwrap();
        let ln = tr
            .listen("127.0.0.1:0", TransportListenOptions::default())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let pending = ln.accept().await.unwrap();
            let mut conn = pending.await.unwrap();
            assert!(conn.remote_addr.is_some());
            let mut buf = vec![0u8; 11];
            conn.stream.read_exact(&mut buf).await.unwrap();
            conn.stream.write_all(&buf).await.unwrap();
            conn.stream.flush().await.unwrap();
            conn
        });

        let opts = TransportDialOptions {
            tls: TlsDialOptions {
                insecure_skip_verify: true,
                ..TlsDialOptions::default()
            },
            subdomain: "myapp".into(),
            ..TransportDialOptions::default()
        };
        let mut conn = tr.dial(&addr.to_string(), opts).await.unwrap();
        // Two writes arrive as one contiguous byte stream.
        conn.stream.write_all(b"hello ").await.unwrap();
        conn.stream.write_all(b"world").await.unwrap();
        conn.stream.flush().await.unwrap();
        let mut buf = vec![0u8; 11];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        let _keep = server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_transport_roundtrip() {
        echo_roundtrip("tcp").await;
    }

    #[tokio::test]
    async fn tls_transport_roundtrip() {
        echo_roundtrip("tls").await;
    }

    #[tokio::test]
    async fn ws_transport_roundtrip() {
        echo_roundtrip("ws").await;
    }

    #[tokio::test]
    async fn wss_transport_roundtrip() {
        echo_roundtrip("wss").await;
    }
}
