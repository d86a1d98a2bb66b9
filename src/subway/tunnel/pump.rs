use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::StreamError;
use super::frame::{MAX_FRAME_PAYLOAD, ResetReason};
use super::stream::{Stream, StreamEvent, StreamWriter};

#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    /// Reset the stream when neither direction moves a byte for this long.
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            buffer_size: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Both directions finished with CLOSE.
    Closed,
    /// The peer, or the session, reset the stream.
    ResetByPeer(ResetReason),
    /// This side reset the stream.
    ResetLocally(ResetReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    pub end: PumpEnd,
    /// Bytes written to the local connection.
    pub bytes_to_local: u64,
    /// Bytes read from the local connection and sent on the stream.
    pub bytes_from_local: u64,
}

enum LocalRead {
    Read(usize),
    Stream(StreamError),
    Local(std::io::Error),
}

async fn read_with_credit<R: AsyncRead + Unpin>(
    writer: &mut StreamWriter,
    rd: &mut R,
    buf: &mut [u8],
) -> LocalRead {
    let credit = match writer.reserve().await {
        Ok(n) => n,
        Err(err) => return LocalRead::Stream(err),
    };
    let n = credit.min(buf.len());
    match rd.read(&mut buf[..n]).await {
        Ok(n) => LocalRead::Read(n),
        Err(err) => LocalRead::Local(err),
    }
}

fn stream_end(err: StreamError) -> PumpEnd {
    match err {
        StreamError::Reset(reason) => PumpEnd::ResetByPeer(reason),
        _ => PumpEnd::ResetByPeer(ResetReason::SessionClosed),
    }
}

/// Copies bytes between a stream and a local connection in both directions
/// until both sides have closed or either side fails.
///
/// Local reads only happen while the stream has send credit, and credit is
/// returned to the peer only after the bytes were written locally.
pub async fn pump<L>(stream: Stream, local: &mut L, opts: PumpOptions) -> PumpOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let stream_id = stream.id();
    let (mut reader, mut writer) = stream.into_split();
    let (mut rd, mut wr) = tokio::io::split(local);
    let mut buf = vec![0u8; opts.buffer_size.clamp(1024, MAX_FRAME_PAYLOAD)];

    let mut out = PumpOutcome {
        end: PumpEnd::Closed,
        bytes_to_local: 0,
        bytes_from_local: 0,
    };
    let mut local_eof = false;
    let mut remote_eof = false;

    let idle = opts.idle_timeout.filter(|d| !d.is_zero());
    let idle_timer = tokio::time::sleep(idle.unwrap_or(Duration::MAX / 4));
    tokio::pin!(idle_timer);

    let end = loop {
        if local_eof && remote_eof {
            break PumpEnd::Closed;
        }

        tokio::select! {
            res = read_with_credit(&mut writer, &mut rd, &mut buf), if !local_eof => match res {
                LocalRead::Read(0) => {
                    local_eof = true;
                    if let Err(err) = writer.close() {
                        break stream_end(err);
                    }
                }
                LocalRead::Read(n) => {
                    if let Err(err) = writer.send(&buf[..n]) {
                        break stream_end(err);
                    }
                    out.bytes_from_local += n as u64;
                    if let Some(d) = idle {
                        idle_timer.as_mut().reset(tokio::time::Instant::now() + d);
                    }
                }
                LocalRead::Stream(err) => break stream_end(err),
                LocalRead::Local(err) => {
                    tracing::debug!(stream = stream_id, err = %err, "tunnel: local read failed");
                    writer.reset(ResetReason::Cancelled);
                    break PumpEnd::ResetLocally(ResetReason::Cancelled);
                }
            },
            ev = reader.recv() => match ev {
                StreamEvent::Data(b) => {
                    let written = async {
                        wr.write_all(&b).await?;
                        wr.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        tracing::debug!(stream = stream_id, err = %err, "tunnel: local write failed");
                        writer.reset(ResetReason::Cancelled);
                        break PumpEnd::ResetLocally(ResetReason::Cancelled);
                    }
                    reader.release(b.len());
                    out.bytes_to_local += b.len() as u64;
                    if let Some(d) = idle {
                        idle_timer.as_mut().reset(tokio::time::Instant::now() + d);
                    }
                }
                StreamEvent::Closed => {
                    remote_eof = true;
                    let _ = wr.shutdown().await;
                }
                StreamEvent::Reset(reason) => break PumpEnd::ResetByPeer(reason),
            },
            _ = &mut idle_timer, if idle.is_some() => {
                writer.reset(ResetReason::Timeout);
                break PumpEnd::ResetLocally(ResetReason::Timeout);
            }
        }
    };

    out.end = end;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subway::tunnel::frame::TunnelProto;
    use crate::subway::tunnel::session::tests::pair_with;
    use crate::subway::telemetry::NoopMetrics;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    /// Local connection that accepts writes but fails every flush.
    struct BrokenFlush(DuplexStream);

    impl AsyncRead for BrokenFlush {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenFlush {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn pumps_both_directions_until_both_close() {
        let (server, client) = pair_with(1024, Arc::new(NoopMetrics));

        // Server side plays the external user against a local duplex.
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (mut user, mut user_side) = tokio::io::duplex(4096);
        let server_pump =
            tokio::spawn(async move { pump(stream, &mut user_side, PumpOptions::default()).await });

        // Client side echoes everything back through a local service.
        let accepted = client.accept_stream().await.unwrap();
        accepted.ack();
        let (mut svc, mut svc_side) = tokio::io::duplex(4096);
        let client_pump =
            tokio::spawn(async move { pump(accepted, &mut svc_side, PumpOptions::default()).await });
        let echo = tokio::spawn(async move {
            let mut got = Vec::new();
            svc.read_to_end(&mut got).await.unwrap();
            svc.write_all(&got).await.unwrap();
            svc.shutdown().await.unwrap();
            got.len()
        });

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        user.write_all(&payload).await.unwrap();
        user.shutdown().await.unwrap();
        let mut back = Vec::new();
        user.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, payload);
        assert_eq!(echo.await.unwrap(), payload.len());

        let s = server_pump.await.unwrap();
        let c = client_pump.await.unwrap();
        assert_eq!(s.end, PumpEnd::Closed);
        assert_eq!(c.end, PumpEnd::Closed);
        assert_eq!(s.bytes_from_local, payload.len() as u64);
        assert_eq!(s.bytes_to_local, payload.len() as u64);
        assert_eq!(c.bytes_to_local, payload.len() as u64);
    }

    #[tokio::test]
    async fn peer_reset_ends_the_pump() {
        let (server, client) = pair_with(1024, Arc::new(NoopMetrics));
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (_user, mut user_side) = tokio::io::duplex(1024);
        let server_pump =
            tokio::spawn(async move { pump(stream, &mut user_side, PumpOptions::default()).await });

        let accepted = client.accept_stream().await.unwrap();
        accepted.reset(ResetReason::TargetUnreachable);

        let out = server_pump.await.unwrap();
        assert_eq!(out.end, PumpEnd::ResetByPeer(ResetReason::TargetUnreachable));
        assert_eq!(out.bytes_to_local, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_is_reset_with_timeout() {
        let (server, client) = pair_with(1024, Arc::new(NoopMetrics));
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (_user, mut user_side) = tokio::io::duplex(1024);
        let opts = PumpOptions {
            idle_timeout: Some(Duration::from_secs(30)),
            ..PumpOptions::default()
        };
        let server_pump = tokio::spawn(async move { pump(stream, &mut user_side, opts).await });

        let accepted = client.accept_stream().await.unwrap();
        let (mut rd, _wr) = accepted.into_split();

        let out = server_pump.await.unwrap();
        assert_eq!(out.end, PumpEnd::ResetLocally(ResetReason::Timeout));
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::Timeout));
    }

    #[tokio::test]
    async fn local_flush_failure_resets_the_stream() {
        let (server, client) = pair_with(1024, Arc::new(NoopMetrics));
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let accepted = client.accept_stream().await.unwrap();
        accepted.ack();

        let (_svc, svc_side) = tokio::io::duplex(1024);
        let mut local = BrokenFlush(svc_side);
        let client_pump =
            tokio::spawn(async move { pump(accepted, &mut local, PumpOptions::default()).await });

        let (mut rd, mut wr) = stream.into_split();
        wr.write_all(b"hello").await.unwrap();

        let out = tokio::time::timeout(Duration::from_secs(2), client_pump)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.end, PumpEnd::ResetLocally(ResetReason::Cancelled));
        assert_eq!(out.bytes_to_local, 0);
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::Cancelled));
    }
}
