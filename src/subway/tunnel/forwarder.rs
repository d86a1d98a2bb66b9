use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use super::error::TunnelError;
use super::frame::ResetReason;
use super::pump::{PumpEnd, PumpOptions, pump};
use super::session::Session;
use super::stream::Stream;

#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    /// Local service every stream is forwarded to, e.g. `localhost:8080`.
    pub local_addr: String,
    pub dial_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            local_addr: "localhost:8080".into(),
            dial_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(30)),
            buffer_size: 32 * 1024,
        }
    }
}

/// Client-side bridge from accepted streams to the local service.
#[derive(Debug, Clone)]
pub struct Forwarder {
    opts: Arc<ForwarderOptions>,
}

impl Forwarder {
    pub fn new(opts: ForwarderOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    /// Accepts streams until the session closes, forwarding each on its own
    /// task.
    pub async fn serve(&self, session: Arc<Session>) {
        while let Some(stream) = session.accept_stream().await {
            let this = self.clone();
            tokio::spawn(async move { this.forward(stream).await });
        }
    }

    pub async fn forward(&self, stream: Stream) {
        let id = stream.id();
        let peer = stream.open_request().remote_addr.clone();
        let proto = stream.open_request().proto;

        let mut local = match dial_local(&self.opts.local_addr, self.opts.dial_timeout).await {
            Ok(c) => c,
            Err(err) => {
                let reason = match err {
                    TunnelError::Timeout(_) => ResetReason::Timeout,
                    _ => ResetReason::TargetUnreachable,
                };
                tracing::warn!(
                    stream = id,
                    local = %self.opts.local_addr,
                    err = %err,
                    "tunnel: local service unreachable"
                );
                stream.reset(reason);
                return;
            }
        };

        stream.ack();
        tracing::debug!(stream = id, peer = %peer, proto = %proto, local = %self.opts.local_addr, "tunnel: forwarding stream");

        let out = pump(
            stream,
            &mut local,
            PumpOptions {
                idle_timeout: self.opts.idle_timeout,
                buffer_size: self.opts.buffer_size,
            },
        )
        .await;

        match out.end {
            PumpEnd::Closed => tracing::debug!(
                stream = id,
                bytes_in = out.bytes_from_local,
                bytes_out = out.bytes_to_local,
                "tunnel: stream done"
            ),
            PumpEnd::ResetByPeer(reason) | PumpEnd::ResetLocally(reason) => tracing::debug!(
                stream = id,
                reason = %reason,
                "tunnel: stream reset"
            ),
        }
    }
}

pub async fn dial_local(addr: &str, timeout: Duration) -> Result<TcpStream, TunnelError> {
    let conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Timeout("local dial"))?
        .map_err(|source| TunnelError::Dial {
            addr: addr.to_string(),
            source,
        })?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subway::telemetry::NoopMetrics;
    use crate::subway::tunnel::frame::TunnelProto;
    use crate::subway::tunnel::session::tests::pair_with;
    use crate::subway::tunnel::stream::StreamEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn unreachable_local_service_resets_stream() {
        // Grab a free port and release it so nothing listens there.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (server, client) = pair_with(64 * 1024, Arc::new(NoopMetrics));
        let fwd = Forwarder::new(ForwarderOptions {
            local_addr: addr.to_string(),
            dial_timeout: Duration::from_secs(2),
            ..ForwarderOptions::default()
        });
        tokio::spawn(async move { fwd.serve(client).await });

        let stream = server.open_stream(TunnelProto::Http, None).unwrap();
        let (mut rd, _wr) = stream.into_split();
        assert_eq!(
            rd.recv().await,
            StreamEvent::Reset(ResetReason::TargetUnreachable)
        );
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn forwards_to_local_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut c, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            c.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            c.write_all(b"world").await.unwrap();
        });

        let (server, client) = pair_with(64 * 1024, Arc::new(NoopMetrics));
        let fwd = Forwarder::new(ForwarderOptions {
            local_addr: addr.to_string(),
            ..ForwarderOptions::default()
        });
        tokio::spawn(async move { fwd.serve(client).await });

        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (mut rd, mut wr) = stream.into_split();
        wr.write_all(b"hello").await.unwrap();

        let mut got = Vec::new();
        loop {
            match rd.recv().await {
                StreamEvent::Data(b) => got.extend_from_slice(&b),
                StreamEvent::Closed => break,
                StreamEvent::Reset(r) => panic!("unexpected reset: {r}"),
            }
        }
        assert_eq!(got, b"world");
    }
}
