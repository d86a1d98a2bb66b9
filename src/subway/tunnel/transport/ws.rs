use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll, ready};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::subway::tunnel::registry::normalize_subdomain;
use crate::subway::tunnel::transport::{
    BoxedStream, PendingConn, Transport, TransportConn, TransportDialOptions,
    TransportListenOptions, TransportListener, tls, ws_path,
};

/// Tunnel carried in binary WebSocket messages, for networks that only let
/// HTTP(S) out.
#[derive(Debug, Clone, Copy)]
pub struct WsTransport {
    secure: bool,
}

impl WsTransport {
    pub fn plain() -> Self {
        Self { secure: false }
    }

    pub fn secure() -> Self {
        Self { secure: true }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let acceptor = if self.secure {
            Some(tls::acceptor(&opts.tls)?)
        } else {
            None
        };
        let ln = TcpListener::bind(addr)
            .await
            .with_context(|| format!("tunnel: bind {addr}"))?;
        Ok(Box::new(WsTransportListener {
            ln,
            acceptor,
            path: ws_path(&opts.ws_path),
        }))
    }

    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<TransportConn> {
        let c = TcpStream::connect(addr)
            .await
            .with_context(|| format!("tunnel: connect {addr}"))?;
        let _ = c.set_nodelay(true);
        let remote_addr = c.peer_addr().ok();

        let inner: BoxedStream = if self.secure {
            Box::new(tls::connect(c, addr, &opts.tls).await?)
        } else {
            Box::new(c)
        };

        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = format!("{scheme}://{addr}{}", ws_path(&opts.ws_path));
        if let Some(sub) = normalize_subdomain(&opts.subdomain) {
            url.push_str("?subdomain=");
            url.push_str(&sub);
        }

        let (ws, _resp) = tokio_tungstenite::client_async(url.as_str(), inner)
            .await
            .with_context(|| format!("tunnel: websocket handshake with {url}"))?;
        Ok(TransportConn {
            stream: Box::new(WsByteStream::new(ws)),
            remote_addr,
        })
    }
}

pub struct WsTransportListener {
    ln: TcpListener,
    acceptor: Option<TlsAcceptor>,
    path: String,
}

#[async_trait]
impl TransportListener for WsTransportListener {
    async fn accept(&self) -> anyhow::Result<PendingConn> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        let acceptor = self.acceptor.clone();
        let path = self.path.clone();
        Ok(Box::pin(async move {
            let inner: BoxedStream = match acceptor {
                Some(a) => Box::new(
                    a.accept(c)
                        .await
                        .with_context(|| format!("tunnel: tls handshake with {peer}"))?,
                ),
                None => Box::new(c),
            };
            let check_path = move |req: &Request, resp: Response| {
                if req.uri().path() == path {
                    return Ok(resp);
                }
                let mut err = ErrorResponse::new(Some("not found".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            };
            let ws = tokio_tungstenite::accept_hdr_async(inner, check_path)
                .await
                .with_context(|| format!("tunnel: websocket upgrade from {peer}"))?;
            Ok(TransportConn {
                stream: Box::new(WsByteStream::new(ws)),
                remote_addr: Some(peer),
            })
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

/// Byte stream view of a WebSocket: each write becomes one binary message,
/// reads concatenate binary payloads. Message boundaries carry no meaning.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

fn ws_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(b))) => self.pending = Bytes::from(b),
                Some(Ok(Message::Close(_))) | None => self.eof = true,
                // Text, ping and pong carry no tunnel bytes.
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => self.eof = true,
                Some(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(ws_io_error)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_io_error(e))),
        }
    }
}
