use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::error::StreamError;
use super::frame::{ResetReason, TunnelProto};
use super::pump::{PumpEnd, PumpOptions, pump};
use super::registry::{Registry, normalize_subdomain};
use super::session::Session;

/// How long a raw TCP connection may stay silent before it is classified as
/// plain TCP.
const SNIFF_TIMEOUT: Duration = Duration::from_millis(250);
const SNIFF_BYTES: usize = 8;

const HTTP_METHODS: [&[u8]; 7] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
];

/// Classifies a connection from its first bytes.
pub fn sniff_protocol(prefix: &[u8]) -> TunnelProto {
    let n = prefix.len().min(SNIFF_BYTES);
    let upper = prefix[..n].to_ascii_uppercase();
    if HTTP_METHODS.iter().any(|m| upper.starts_with(m)) {
        TunnelProto::Http
    } else {
        TunnelProto::Tcp
    }
}

/// Tunnel name from a Host header value: the first DNS label, port ignored.
/// Hosts with fewer than two labels carry no subdomain.
pub fn extract_subdomain(host: &str) -> Option<String> {
    let host = host.trim();
    let host = match host.find(':') {
        Some(i) => &host[..i],
        None => host,
    };
    let mut labels = host.split('.');
    let first = labels.next()?;
    labels.next()?;
    normalize_subdomain(first)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

pub fn host_header(head: &[u8]) -> Option<String> {
    let end = find_head_end(head).unwrap_or(head.len());
    let text = String::from_utf8_lossy(&head[..end]);
    text.split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("timed out reading request head")]
    Timeout,
    #[error("connection closed before request head completed")]
    Eof,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads until the end of the request head. The returned buffer holds
/// everything read so far, which may include the start of the body.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    conn: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Vec<u8>, HeadError> {
    let read = async {
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = find_head_end(&buf) {
                if end > max_bytes {
                    return Err(HeadError::TooLarge(max_bytes));
                }
                return Ok(buf);
            }
            if buf.len() >= max_bytes {
                return Err(HeadError::TooLarge(max_bytes));
            }
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return Err(HeadError::Eof);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| HeadError::Timeout)?
}

fn status_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

pub async fn write_error_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: u16,
    body: &str,
) -> std::io::Result<()> {
    let body = format!("{body}\n");
    let resp = format!(
        "HTTP/1.1 {code} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        status_text(code),
        body.len(),
    );
    w.write_all(resp.as_bytes()).await?;
    w.flush().await?;
    w.shutdown().await
}

#[derive(Debug, Clone)]
pub struct HttpIngressOptions {
    pub max_header_bytes: usize,
    pub header_timeout: Duration,
    pub stream: PumpOptions,
}

impl Default for HttpIngressOptions {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            header_timeout: Duration::from_secs(10),
            stream: PumpOptions {
                idle_timeout: Some(Duration::from_secs(30)),
                ..PumpOptions::default()
            },
        }
    }
}

/// Public HTTP entry point. Routes each connection by Host header to the
/// session registered for its subdomain.
#[derive(Debug)]
pub struct HttpIngress {
    registry: Arc<Registry>,
    opts: HttpIngressOptions,
}

impl HttpIngress {
    pub fn new(registry: Arc<Registry>, opts: HttpIngressOptions) -> Self {
        Self { registry, opts }
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("ingress: bind {addr}"))?;
        tracing::info!(addr = %addr, "ingress: http listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = listener.accept() => match res {
                    Ok((conn, peer)) => {
                        let _ = conn.set_nodelay(true);
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_conn(conn, Some(peer)).await });
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "ingress: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    pub async fn handle_conn<C>(&self, mut conn: C, peer: Option<SocketAddr>)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let head = match read_request_head(
            &mut conn,
            self.opts.max_header_bytes,
            self.opts.header_timeout,
        )
        .await
        {
            Ok(h) => h,
            Err(HeadError::TooLarge(_)) => {
                let _ = write_error_response(&mut conn, 431, "Request header too large").await;
                return;
            }
            Err(HeadError::Timeout) => {
                let _ = write_error_response(&mut conn, 408, "Request header timeout").await;
                return;
            }
            Err(err) => {
                tracing::debug!(peer = ?peer, err = %err, "ingress: dropped connection");
                return;
            }
        };

        let Some(host) = host_header(&head) else {
            let _ = write_error_response(&mut conn, 400, "Missing Host header").await;
            return;
        };
        let Some(subdomain) = extract_subdomain(&host) else {
            let _ = write_error_response(&mut conn, 400, "Invalid subdomain").await;
            return;
        };

        let session = match self.registry.lookup(&subdomain) {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(host = %host, err = %err, "ingress: no tunnel");
                let _ = write_error_response(&mut conn, 503, "Tunnel not available").await;
                return;
            }
        };
        let mut stream = match session.open_stream(TunnelProto::Http, peer) {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(subdomain = %subdomain, err = %err, "ingress: open stream failed");
                let _ = write_error_response(&mut conn, 503, "Tunnel not available").await;
                return;
            }
        };
        let stream_id = stream.id();

        // The already-consumed head is replayed ahead of the live connection.
        if let Err(err) = stream.write_all(&head).await {
            let code = match err {
                StreamError::Reset(ResetReason::Timeout) => 504,
                _ => 502,
            };
            let _ = write_error_response(&mut conn, code, status_text(code)).await;
            return;
        }

        let out = pump(stream, &mut conn, self.opts.stream).await;
        tracing::debug!(
            subdomain = %subdomain,
            stream = stream_id,
            end = ?out.end,
            bytes_in = out.bytes_from_local,
            bytes_out = out.bytes_to_local,
            "ingress: request finished"
        );

        if out.bytes_to_local > 0 {
            return;
        }
        let code = match out.end {
            PumpEnd::ResetByPeer(ResetReason::Timeout) | PumpEnd::ResetLocally(ResetReason::Timeout) => 504,
            PumpEnd::ResetByPeer(_) => 502,
            _ => return,
        };
        let _ = write_error_response(&mut conn, code, status_text(code)).await;
    }
}

/// Public TCP listener serving a single tunnel.
#[derive(Debug)]
pub struct TcpIngress {
    listener: TcpListener,
}

impl TcpIngress {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the session closes.
    pub fn spawn(self, session: Arc<Session>, opts: PumpOptions) -> JoinHandle<()> {
        tokio::spawn(async move {
            let addr = self.listener.local_addr().ok();
            loop {
                tokio::select! {
                    _ = session.closed() => break,
                    res = self.listener.accept() => match res {
                        Ok((conn, peer)) => {
                            let _ = conn.set_nodelay(true);
                            tokio::spawn(handle_tcp_conn(session.clone(), conn, peer, opts));
                        }
                        Err(err) => {
                            tracing::warn!(err = %err, "ingress: tcp accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            tracing::info!(addr = ?addr, subdomain = %session.subdomain(), "ingress: tcp listener closed");
        })
    }
}

async fn sniff_tcp(conn: &TcpStream) -> TunnelProto {
    let mut buf = [0u8; SNIFF_BYTES];
    match tokio::time::timeout(SNIFF_TIMEOUT, conn.peek(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => sniff_protocol(&buf[..n]),
        _ => TunnelProto::Tcp,
    }
}

async fn handle_tcp_conn(session: Arc<Session>, mut conn: TcpStream, peer: SocketAddr, opts: PumpOptions) {
    let proto = sniff_tcp(&conn).await;
    let stream = match session.open_stream(proto, Some(peer)) {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(peer = %peer, err = %err, "ingress: open stream failed");
            return;
        }
    };
    let out = pump(stream, &mut conn, opts).await;
    tracing::debug!(peer = %peer, proto = %proto, end = ?out.end, "ingress: tcp connection finished");
}
