use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::subway::tunnel::transport::{
    PendingConn, Transport, TransportConn, TransportDialOptions, TransportListenOptions,
    TransportListener,
};

/// Plain TCP. Suitable behind a TLS-terminating load balancer or on a
/// trusted network.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(addr)
            .await
            .with_context(|| format!("tunnel: bind {addr}"))?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str, _opts: TransportDialOptions) -> anyhow::Result<TransportConn> {
        let c = TcpStream::connect(addr)
            .await
            .with_context(|| format!("tunnel: connect {addr}"))?;
        let _ = c.set_nodelay(true);
        let remote_addr = c.peer_addr().ok();
        Ok(TransportConn {
            stream: Box::new(c),
            remote_addr,
        })
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<PendingConn> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        let conn = TransportConn {
            stream: Box::new(c),
            remote_addr: Some(peer),
        };
        Ok(Box::pin(std::future::ready(Ok(conn))))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}
