use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};

use super::error::{CloseReason, StreamError, TunnelError};
use super::frame::{
    Frame, FrameType, OpenRequest, ResetReason, TunnelProto, encode_into, read_frame,
};
use super::registry::Registry;
use super::stream::{
    DEFAULT_WINDOW, Inbound, RecvWindow, Stream, StreamControl, StreamInput, StreamState,
};
use crate::subway::telemetry::{self, MetricsSink, NoopMetrics};

/// Upper bound on bytes coalesced into one transport write.
const WRITE_BATCH_BYTES: usize = 128 * 1024;
/// How long a closing session keeps trying to flush queued frames.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Tunnel server side. Opens even stream ids.
    Server,
    /// Tunnel client side. Opens odd stream ids.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Receive window granted to the peer for every stream.
    pub window: u32,
    /// Zero disables PINGs.
    pub heartbeat_interval: Duration,
    /// Zero disables the idle check.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

pub struct SessionParams {
    /// Assigned by the server; generated when absent.
    pub id: Option<String>,
    pub subdomain: String,
    pub role: Role,
    pub proto: TunnelProto,
    pub public_url: String,
    pub remote_addr: Option<SocketAddr>,
    pub config: SessionConfig,
    /// Initial send window the peer advertised in the handshake.
    pub peer_window: u32,
    /// Whether peer-initiated streams are queued for [`Session::accept_stream`].
    pub accept_streams: bool,
    pub registry: Option<Arc<Registry>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl SessionParams {
    pub fn new(subdomain: impl Into<String>, role: Role) -> Self {
        Self {
            id: None,
            subdomain: subdomain.into(),
            role,
            proto: TunnelProto::Http,
            public_url: String::new(),
            remote_addr: None,
            config: SessionConfig::default(),
            peer_window: DEFAULT_WINDOW,
            accept_streams: role == Role::Client,
            registry: None,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub subdomain: String,
    pub proto: TunnelProto,
    pub state: SessionState,
    pub public_url: String,
    pub remote_addr: Option<String>,
    pub streams: usize,
    pub connected_at_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Initiator {
    Local,
    Remote,
}

struct StreamEntry {
    state: StreamState,
    initiator: Initiator,
    inbound: mpsc::UnboundedSender<Inbound>,
    ctl: watch::Sender<StreamControl>,
    recv_window: RecvWindow,
    bytes_in: u64,
    bytes_out: u64,
}

impl StreamEntry {
    fn new(
        initiator: Initiator,
        recv_window: u32,
        send_window: u32,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Inbound>,
        watch::Receiver<StreamControl>,
    ) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (ctl, ctl_rx) = watch::channel(StreamControl {
            granted: u64::from(send_window),
            reset: None,
        });
        let entry = Self {
            state: StreamState::Opening,
            initiator,
            inbound,
            ctl,
            recv_window: RecvWindow::new(recv_window),
            bytes_in: 0,
            bytes_out: 0,
        };
        (entry, inbound_rx, ctl_rx)
    }

    fn mark_reset(&self, reason: ResetReason) {
        self.ctl.send_modify(|c| {
            if c.reset.is_none() {
                c.reset = Some(reason);
            }
        });
    }
}

struct Streams {
    map: HashMap<u32, StreamEntry>,
    next_local: u32,
    highest_remote: u32,
}

/// One authenticated transport connection carrying many streams.
///
/// A session owns three tasks once [`Session::run`] is called: a decode loop
/// that is the only reader of the transport, a writer that is the only
/// writer, and a heartbeat. Everything else talks to the writer through an
/// unbounded frame queue.
pub struct Session {
    id: String,
    subdomain: String,
    role: Role,
    proto: TunnelProto,
    public_url: String,
    remote_addr: Option<SocketAddr>,
    connected_at_unix_ms: u64,
    config: SessionConfig,
    peer_window: u32,

    state: Mutex<SessionState>,
    streams: Mutex<Streams>,
    stream_count: watch::Sender<usize>,

    outbound: mpsc::UnboundedSender<Frame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<Stream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,

    clock: Instant,
    last_activity_ms: AtomicU64,
    ping_seq: AtomicU64,

    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,

    registry: Option<Arc<Registry>>,
    metrics: Arc<dyn MetricsSink>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

async fn wait_zero(rx: &mut watch::Receiver<usize>) {
    let _ = rx.wait_for(|n| *n == 0).await;
}

impl Session {
    pub fn new(params: SessionParams) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let (stream_count, _) = watch::channel(0);
        let next_local = match params.role {
            Role::Client => 1,
            Role::Server => 2,
        };

        Arc::new(Self {
            id: params.id.unwrap_or_else(telemetry::new_session_id),
            subdomain: params.subdomain,
            role: params.role,
            proto: params.proto,
            public_url: params.public_url,
            remote_addr: params.remote_addr,
            connected_at_unix_ms: telemetry::now_unix_ms(),
            config: params.config,
            peer_window: params.peer_window,
            state: Mutex::new(SessionState::Handshaking),
            streams: Mutex::new(Streams {
                map: HashMap::new(),
                next_local,
                highest_remote: 0,
            }),
            stream_count,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            accept_tx: Mutex::new(params.accept_streams.then_some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            clock: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            ping_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_tx,
            close_reason: Mutex::new(None),
            registry: params.registry,
            metrics: params.metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn proto(&self) -> TunnelProto {
        self.proto
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.close_reason).clone()
    }

    pub fn stream_count(&self) -> usize {
        *self.stream_count.borrow()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            subdomain: self.subdomain.clone(),
            proto: self.proto,
            state: self.state(),
            public_url: self.public_url.clone(),
            remote_addr: self.remote_addr.map(|a| a.to_string()),
            streams: self.stream_count(),
            connected_at_unix_ms: self.connected_at_unix_ms,
        }
    }

    /// Attaches the authenticated transport and starts the session tasks.
    pub fn run<T>(self: &Arc<Self>, transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(outbound_rx) = lock(&self.outbound_rx).take() else {
            tracing::warn!(session = %self.id, "tunnel: session already running");
            return;
        };
        if self.is_closed() {
            return;
        }

        let (rd, wr) = tokio::io::split(transport);
        self.touch();
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Handshaking {
                *state = SessionState::Active;
            }
        }
        self.metrics.on_session_opened(&self.subdomain);

        tokio::spawn(write_loop(self.clone(), wr, outbound_rx));
        tokio::spawn(read_loop(self.clone(), BufReader::new(rd)));
        tokio::spawn(heartbeat_loop(self.clone()));
    }

    /// Opens a new locally-initiated stream.
    pub fn open_stream(
        self: &Arc<Self>,
        proto: TunnelProto,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Stream, TunnelError> {
        if self.state() != SessionState::Active {
            return Err(TunnelError::SessionUnavailable);
        }
        let req = OpenRequest {
            proto,
            remote_addr: remote_addr.map(|a| a.to_string()).unwrap_or_default(),
        };
        let (entry, inbound_rx, ctl_rx) =
            StreamEntry::new(Initiator::Local, self.config.window, self.peer_window);

        let id = {
            let mut streams = lock(&self.streams);
            if self.is_closed() {
                return Err(TunnelError::SessionUnavailable);
            }
            let id = streams.next_local;
            streams.next_local = id.checked_add(2).ok_or(TunnelError::StreamIdsExhausted)?;
            let frame = Frame::open(id, &req)?;
            streams.map.insert(id, entry);
            self.stream_count.send_replace(streams.map.len());
            self.enqueue(frame);
            id
        };
        self.metrics.on_stream_opened(&self.subdomain);
        tracing::debug!(session = %self.id, stream = id, proto = %proto, "tunnel: stream opened");
        Ok(Stream::new(id, req, self.clone(), inbound_rx, ctl_rx))
    }

    /// Next peer-initiated stream. `None` once the session is closed.
    pub async fn accept_stream(&self) -> Option<Stream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        wait_true(&mut rx).await;
    }

    /// Stops new streams, waits up to `grace` for open ones to finish, then
    /// closes the session.
    pub async fn drain(&self, grace: Duration) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Handshaking | SessionState::Active) {
                *state = SessionState::Draining;
            }
        }
        if self.is_closed() {
            return;
        }
        tracing::info!(
            session = %self.id,
            subdomain = %self.subdomain,
            streams = self.stream_count(),
            "tunnel: draining session"
        );

        let mut count = self.stream_count.subscribe();
        let mut closed = self.closed_tx.subscribe();
        let finished = tokio::select! {
            res = tokio::time::timeout(grace, wait_zero(&mut count)) => res.is_ok(),
            _ = wait_true(&mut closed) => return,
        };
        if !finished {
            tracing::warn!(
                session = %self.id,
                streams = self.stream_count(),
                grace = %humantime::format_duration(grace),
                "tunnel: drain grace expired; resetting remaining streams"
            );
        }
        self.close(CloseReason::Drained);
    }

    /// Tears the session down. Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_running =
            std::mem::replace(&mut *lock(&self.state), SessionState::Closed) != SessionState::Handshaking;
        *lock(&self.close_reason) = Some(reason.clone());

        let drained: Vec<StreamEntry> = {
            let mut streams = lock(&self.streams);
            streams.map.drain().map(|(_, e)| e).collect()
        };
        self.stream_count.send_replace(0);
        for entry in drained {
            entry.mark_reset(ResetReason::SessionClosed);
            self.metrics
                .on_stream_closed(&self.subdomain, entry.bytes_in, entry.bytes_out);
        }
        lock(&self.accept_tx).take();

        if let Some(registry) = &self.registry {
            registry.unregister(&self.subdomain, self);
        }
        self.closed_tx.send_replace(true);
        if was_running {
            self.metrics.on_session_closed(&self.subdomain, &reason);
        }

        tracing::info!(
            session = %self.id,
            subdomain = %self.subdomain,
            reason = %reason,
            "tunnel: session closed"
        );
    }

    fn enqueue(&self, frame: Frame) {
        // A failed send means the writer is gone and the session is closing.
        let _ = self.outbound.send(frame);
    }

    fn touch(&self) {
        let ms = self.clock.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.clock + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    fn is_local_id(&self, id: u32) -> bool {
        (id % 2 == 1) == (self.role == Role::Client)
    }

    /// Frames for ids that existed once are discarded; ids never allocated
    /// are a protocol violation.
    fn unknown_stream(&self, streams: &Streams, id: u32, ty: FrameType) -> Result<(), TunnelError> {
        let allocated = if self.is_local_id(id) {
            id < streams.next_local
        } else {
            id <= streams.highest_remote
        };
        if allocated {
            tracing::trace!(session = %self.id, stream = id, frame = ?ty, "tunnel: discarding frame for finished stream");
            Ok(())
        } else {
            Err(TunnelError::protocol(format!(
                "{ty:?} frame for unknown stream {id}"
            )))
        }
    }

    fn remove_stream(&self, streams: &mut Streams, id: u32) -> Option<StreamEntry> {
        let entry = streams.map.remove(&id)?;
        self.stream_count.send_replace(streams.map.len());
        Some(entry)
    }

    fn finish_stream(&self, id: u32, entry: &StreamEntry) {
        self.metrics
            .on_stream_closed(&self.subdomain, entry.bytes_in, entry.bytes_out);
        tracing::debug!(
            session = %self.id,
            stream = id,
            state = ?entry.state,
            initiator = ?entry.initiator,
            bytes_in = entry.bytes_in,
            bytes_out = entry.bytes_out,
            "tunnel: stream finished"
        );
    }

    pub(crate) fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), TunnelError> {
        match frame.ty {
            FrameType::Auth | FrameType::AuthAck => Err(TunnelError::protocol(format!(
                "unexpected {:?} frame after handshake",
                frame.ty
            ))),
            FrameType::Ping => {
                self.enqueue(Frame::pong(frame.nonce()?));
                Ok(())
            }
            FrameType::Pong => Ok(()),
            FrameType::Open => self.on_open(frame),
            FrameType::Data => self.on_data(frame.stream_id, frame.payload),
            FrameType::WindowUpdate => self.on_window_update(frame.stream_id, frame.window_increment()?),
            FrameType::Close => self.on_close(frame.stream_id),
            FrameType::Reset => {
                let reason = frame.reset_reason().unwrap_or(ResetReason::Cancelled);
                self.on_reset(frame.stream_id, reason)
            }
        }
    }

    fn on_open(self: &Arc<Self>, frame: Frame) -> Result<(), TunnelError> {
        let id = frame.stream_id;
        if self.is_local_id(id) {
            return Err(TunnelError::protocol(format!(
                "peer opened stream {id} with the wrong parity"
            )));
        }
        let req = frame.parse_open()?;

        let (entry, inbound_rx, ctl_rx) =
            StreamEntry::new(Initiator::Remote, self.config.window, self.peer_window);
        let accept_tx = {
            let mut streams = lock(&self.streams);
            if id <= streams.highest_remote {
                return Err(TunnelError::protocol(format!(
                    "stream id {id} is not greater than {}",
                    streams.highest_remote
                )));
            }
            streams.highest_remote = id;
            // `close` sets `closed` before it drains this map.
            let accept_tx = if !self.is_closed() && self.state() == SessionState::Active {
                lock(&self.accept_tx).clone()
            } else {
                None
            };
            let Some(accept_tx) = accept_tx else {
                drop(streams);
                tracing::debug!(session = %self.id, stream = id, "tunnel: refusing peer-initiated stream");
                self.enqueue(Frame::reset(id, ResetReason::Cancelled));
                return Ok(());
            };
            streams.map.insert(id, entry);
            self.stream_count.send_replace(streams.map.len());
            accept_tx
        };
        self.metrics.on_stream_opened(&self.subdomain);

        let stream = Stream::new(id, req, self.clone(), inbound_rx, ctl_rx);
        if let Err(mpsc::error::SendError(stream)) = accept_tx.send(stream) {
            stream.reset(ResetReason::Cancelled);
        }
        Ok(())
    }

    fn on_data(&self, id: u32, payload: Bytes) -> Result<(), TunnelError> {
        let len = payload.len();
        let reader_gone = {
            let mut streams = lock(&self.streams);
            let Some(entry) = streams.map.get_mut(&id) else {
                return self.unknown_stream(&streams, id, FrameType::Data);
            };
            if !entry.recv_window.on_data(len) {
                return Err(TunnelError::protocol(format!(
                    "stream {id} sent {len} bytes with only {} bytes of window",
                    entry.recv_window.remaining()
                )));
            }
            entry.state = entry
                .state
                .on(StreamInput::ReceivedData)
                .map_err(|e| TunnelError::protocol(e.to_string()))?;
            entry.bytes_in += len as u64;
            entry.inbound.send(Inbound::Data(payload)).is_err()
        };
        if reader_gone {
            self.reset_stream(id, ResetReason::Cancelled);
        }
        Ok(())
    }

    fn on_window_update(&self, id: u32, increment: u32) -> Result<(), TunnelError> {
        let mut streams = lock(&self.streams);
        let Some(entry) = streams.map.get_mut(&id) else {
            return self.unknown_stream(&streams, id, FrameType::WindowUpdate);
        };
        entry.state = entry
            .state
            .on(StreamInput::ReceivedWindow)
            .map_err(|e| TunnelError::protocol(e.to_string()))?;
        if increment > 0 {
            entry
                .ctl
                .send_modify(|c| c.granted = c.granted.saturating_add(u64::from(increment)));
        }
        Ok(())
    }

    fn on_close(&self, id: u32) -> Result<(), TunnelError> {
        let finished = {
            let mut streams = lock(&self.streams);
            let Some(entry) = streams.map.get_mut(&id) else {
                return self.unknown_stream(&streams, id, FrameType::Close);
            };
            entry.state = entry
                .state
                .on(StreamInput::ReceivedClose)
                .map_err(|e| TunnelError::protocol(e.to_string()))?;
            let _ = entry.inbound.send(Inbound::Close);
            if entry.state.is_terminal() {
                self.remove_stream(&mut streams, id)
            } else {
                None
            }
        };
        if let Some(entry) = finished {
            self.finish_stream(id, &entry);
        }
        Ok(())
    }

    fn on_reset(&self, id: u32, reason: ResetReason) -> Result<(), TunnelError> {
        let removed = {
            let mut streams = lock(&self.streams);
            match self.remove_stream(&mut streams, id) {
                Some(entry) => entry,
                None => return self.unknown_stream(&streams, id, FrameType::Reset),
            }
        };
        let mut entry = removed;
        entry.state = StreamState::Reset;
        entry.mark_reset(reason);
        tracing::debug!(session = %self.id, stream = id, reason = %reason, "tunnel: stream reset by peer");
        self.finish_stream(id, &entry);
        Ok(())
    }

    pub(crate) fn send_data(&self, id: u32, payload: Bytes) -> Result<(), StreamError> {
        let mut streams = lock(&self.streams);
        let Some(entry) = streams.map.get_mut(&id) else {
            return Err(if self.is_closed() {
                StreamError::SessionClosed
            } else {
                StreamError::Reset(ResetReason::Cancelled)
            });
        };
        entry.state = entry
            .state
            .on(StreamInput::SentData)
            .map_err(|_| StreamError::WriteClosed)?;
        entry.bytes_out += payload.len() as u64;
        self.enqueue(Frame::data(id, payload));
        Ok(())
    }

    /// Returns receive credit to the peer. Zero is the open acknowledgement.
    pub(crate) fn grant(&self, id: u32, increment: u32) {
        let mut streams = lock(&self.streams);
        let Some(entry) = streams.map.get_mut(&id) else {
            return;
        };
        if increment > 0 {
            if !entry.state.can_recv() {
                return;
            }
            entry.recv_window.release(increment);
        }
        self.enqueue(Frame::window_update(id, increment));
    }

    pub(crate) fn close_stream(&self, id: u32) -> Result<(), StreamError> {
        let finished = {
            let mut streams = lock(&self.streams);
            let Some(entry) = streams.map.get_mut(&id) else {
                return Ok(());
            };
            let prev = entry.state;
            entry.state = prev
                .on(StreamInput::SentClose)
                .map_err(|_| StreamError::WriteClosed)?;
            if entry.state != prev {
                self.enqueue(Frame::close(id));
            }
            if entry.state.is_terminal() {
                self.remove_stream(&mut streams, id)
            } else {
                None
            }
        };
        if let Some(entry) = finished {
            self.finish_stream(id, &entry);
        }
        Ok(())
    }

    pub(crate) fn reset_stream(&self, id: u32, reason: ResetReason) {
        let removed = {
            let mut streams = lock(&self.streams);
            self.remove_stream(&mut streams, id)
        };
        let Some(mut entry) = removed else {
            return;
        };
        entry.state = StreamState::Reset;
        entry.mark_reset(reason);
        if !self.is_closed() {
            self.enqueue(Frame::reset(id, reason));
        }
        tracing::debug!(session = %self.id, stream = id, reason = %reason, "tunnel: stream reset");
        self.finish_stream(id, &entry);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subdomain", &self.subdomain)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin>(wr: &mut W, buf: &[u8]) -> std::io::Result<()> {
    wr.write_all(buf).await?;
    wr.flush().await
}

async fn write_loop<W>(session: Arc<Session>, mut wr: W, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut closed = session.closed_tx.subscribe();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let first = tokio::select! {
            biased;
            f = rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = wait_true(&mut closed) => break,
        };

        buf.clear();
        let mut res = encode_into(&first, &mut buf);
        while res.is_ok() && buf.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(f) => res = encode_into(&f, &mut buf),
                Err(_) => break,
            }
        }
        if let Err(err) = res {
            session.close(CloseReason::Protocol(err.to_string()));
            break;
        }

        tokio::select! {
            biased;
            res = write_all_flush(&mut wr, &buf) => {
                if let Err(err) = res {
                    session.close(CloseReason::Transport(err.to_string()));
                    return;
                }
            }
            // Abandoning a partial write leaves the transport unusable.
            _ = wait_true(&mut closed) => return,
        }
    }

    // Frames queued just before the close (RESETs, a final CLOSE) still go out.
    let flush = async {
        buf.clear();
        while let Ok(f) = rx.try_recv() {
            if encode_into(&f, &mut buf).is_err() {
                break;
            }
        }
        if !buf.is_empty() {
            let _ = write_all_flush(&mut wr, &buf).await;
        }
        let _ = wr.shutdown().await;
    };
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;
}

async fn read_loop<R>(session: Arc<Session>, mut rd: R)
where
    R: AsyncRead + Unpin,
{
    let mut closed = session.closed_tx.subscribe();
    loop {
        let res = tokio::select! {
            res = read_frame(&mut rd) => res,
            _ = wait_true(&mut closed) => return,
        };
        match res {
            Ok(Some(frame)) => {
                session.touch();
                if let Err(err) = session.handle_frame(frame) {
                    tracing::warn!(session = %session.id, err = %err, "tunnel: closing session");
                    session.close(CloseReason::from(&err));
                    return;
                }
            }
            Ok(None) => {
                session.close(CloseReason::PeerClosed);
                return;
            }
            Err(err) => {
                let err = TunnelError::from(err);
                session.close(CloseReason::from(&err));
                return;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_loop(session: Arc<Session>) {
    let cfg = session.config;
    let mut closed = session.closed_tx.subscribe();
    let mut ping = (!cfg.heartbeat_interval.is_zero()).then(|| {
        let period = cfg.heartbeat_interval;
        tokio::time::interval_at(Instant::now() + period, period)
    });

    loop {
        let idle_deadline =
            (!cfg.idle_timeout.is_zero()).then(|| session.last_activity() + cfg.idle_timeout);
        tokio::select! {
            _ = wait_true(&mut closed) => return,
            _ = tick(&mut ping) => {
                let nonce = session.ping_seq.fetch_add(1, Ordering::Relaxed);
                session.enqueue(Frame::ping(nonce));
            }
            _ = sleep_until(idle_deadline) => {
                if session.last_activity().elapsed() >= cfg.idle_timeout {
                    tracing::warn!(
                        session = %session.id,
                        subdomain = %session.subdomain,
                        idle_timeout = %humantime::format_duration(cfg.idle_timeout),
                        "tunnel: peer went silent"
                    );
                    session.close(CloseReason::IdleTimeout);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::subway::tunnel::frame::write_frame;
    use crate::subway::tunnel::stream::StreamEvent;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    #[derive(Default)]
    pub(crate) struct CountingMetrics {
        pub sessions_opened: AtomicUsize,
        pub sessions_closed: AtomicUsize,
        pub streams_opened: AtomicUsize,
        pub streams_closed: AtomicUsize,
        pub bytes_in: AtomicU64,
        pub bytes_out: AtomicU64,
    }

    impl MetricsSink for CountingMetrics {
        fn on_session_opened(&self, _subdomain: &str) {
            self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stream_opened(&self, _subdomain: &str) {
            self.streams_opened.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stream_closed(&self, _subdomain: &str, bytes_in: u64, bytes_out: u64) {
            self.streams_closed.fetch_add(1, Ordering::SeqCst);
            self.bytes_in.fetch_add(bytes_in, Ordering::SeqCst);
            self.bytes_out.fetch_add(bytes_out, Ordering::SeqCst);
        }
        fn on_session_closed(&self, _subdomain: &str, _reason: &CloseReason) {
            self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params(role: Role, window: u32, metrics: Arc<dyn MetricsSink>) -> SessionParams {
        let mut p = SessionParams::new("myapp", role);
        p.config.window = window;
        p.peer_window = window;
        p.metrics = metrics;
        p
    }

    /// A running server/client session pair over an in-memory transport.
    pub(crate) fn pair_with(
        window: u32,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Arc<Session>, Arc<Session>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = Session::new(params(Role::Server, window, metrics.clone()));
        let client = Session::new(params(Role::Client, window, metrics));
        server.run(a);
        client.run(b);
        (server, client)
    }

    fn pair() -> (Arc<Session>, Arc<Session>) {
        pair_with(DEFAULT_WINDOW, Arc::new(NoopMetrics))
    }

    /// A running session whose peer is driven frame by frame from the test.
    fn raw_peer(role: Role, window: u32) -> (Arc<Session>, DuplexStream) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let s = Session::new(params(role, window, Arc::new(NoopMetrics)));
        s.run(a);
        (s, b)
    }

    async fn recv_all(reader: &mut crate::subway::tunnel::stream::StreamReader) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match reader.recv().await {
                StreamEvent::Data(b) => {
                    out.extend_from_slice(&b);
                    reader.release(b.len());
                }
                StreamEvent::Closed => return out,
                StreamEvent::Reset(r) => panic!("unexpected reset: {r}"),
            }
        }
    }

    #[tokio::test]
    async fn stream_carries_data_both_ways_and_finishes() {
        let metrics = Arc::new(CountingMetrics::default());
        let (server, client) = pair_with(DEFAULT_WINDOW, metrics.clone());

        let stream = server
            .open_stream(TunnelProto::Http, Some("203.0.113.9:4444".parse().unwrap()))
            .unwrap();
        assert_eq!(stream.id(), 2);
        let accepted = client.accept_stream().await.unwrap();
        assert_eq!(accepted.id(), 2);
        assert_eq!(accepted.open_request().remote_addr, "203.0.113.9:4444");
        accepted.ack();

        let (mut s_rd, mut s_wr) = stream.into_split();
        let (mut c_rd, mut c_wr) = accepted.into_split();

        s_wr.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        s_wr.close().unwrap();
        assert_eq!(recv_all(&mut c_rd).await, b"GET / HTTP/1.1\r\n\r\n");

        c_wr.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        c_wr.close().unwrap();
        assert_eq!(recv_all(&mut s_rd).await, b"HTTP/1.1 204 No Content\r\n\r\n");

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.stream_count() + client.stream_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(metrics.streams_opened.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.streams_closed.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.sessions_opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_streams_use_odd_ids() {
        let (_server, client) = pair();
        let a = client.open_stream(TunnelProto::Tcp, None).unwrap();
        let b = client.open_stream(TunnelProto::Tcp, None).unwrap();
        assert_eq!((a.id(), b.id()), (1, 3));
    }

    #[tokio::test]
    async fn server_refuses_peer_initiated_streams() {
        let (server, client) = pair();
        let stream = client.open_stream(TunnelProto::Tcp, None).unwrap();
        let (mut rd, _wr) = stream.into_split();
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::Cancelled));
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn sender_never_exceeds_granted_window() {
        let window = 1024;
        let (server, client) = pair_with(window, Arc::new(NoopMetrics));

        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (_s_rd, mut s_wr) = stream.into_split();
        let writer = tokio::spawn(async move {
            s_wr.write_all(&vec![b'x'; 4096]).await.unwrap();
            s_wr
        });

        let accepted = client.accept_stream().await.unwrap();
        let (mut c_rd, _c_wr) = accepted.into_split();

        // Without releasing credit only the initial window arrives.
        let mut got = 0;
        while got < window as usize {
            match c_rd.recv().await {
                StreamEvent::Data(b) => got += b.len(),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(got, window as usize);
        let more = tokio::time::timeout(Duration::from_millis(100), c_rd.recv()).await;
        assert!(more.is_err(), "peer sent beyond its window");
        assert!(!writer.is_finished());

        c_rd.release(got);
        while got < 4096 {
            match c_rd.recv().await {
                StreamEvent::Data(b) => {
                    got += b.len();
                    c_rd.release(b.len());
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        let s_wr = writer.await.unwrap();
        assert_eq!(s_wr.window().sent(), 4096);
        assert!(s_wr.window().sent() <= s_wr.window().granted());
    }

    #[tokio::test]
    async fn megabyte_flows_through_default_window() {
        let (server, client) = pair();
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (_s_rd, mut s_wr) = stream.into_split();

        let payload: Vec<u8> = (0..(1u32 << 20)).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            s_wr.write_all(&payload).await.unwrap();
            s_wr.close().unwrap();
            s_wr
        });

        let accepted = client.accept_stream().await.unwrap();
        let (mut c_rd, _c_wr) = accepted.into_split();
        let window = DEFAULT_WINDOW as usize;
        let mut got = Vec::with_capacity(expected.len());
        let mut held = 0usize;
        loop {
            match c_rd.recv().await {
                StreamEvent::Data(b) => {
                    got.extend_from_slice(&b);
                    held += b.len();
                    assert!(held <= window, "{held} bytes outstanding");
                    // Hand credit back in coarse chunks.
                    if held >= window / 2 {
                        c_rd.release(held);
                        held = 0;
                    }
                }
                StreamEvent::Closed => break,
                StreamEvent::Reset(r) => panic!("unexpected reset: {r}"),
            }
        }
        assert_eq!(got, expected);
        let s_wr = writer.await.unwrap();
        assert_eq!(s_wr.window().sent(), 1 << 20);
        assert!(s_wr.window().sent() <= s_wr.window().granted());
    }

    #[tokio::test]
    async fn reset_preempts_buffered_data() {
        let (server, client) = pair();
        let stream = server.open_stream(TunnelProto::Http, None).unwrap();
        let (_s_rd, mut s_wr) = stream.into_split();
        s_wr.write_all(b"partial request").await.unwrap();
        s_wr.reset(ResetReason::Timeout);

        let accepted = client.accept_stream().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.stream_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (mut rd, _wr) = accepted.into_split();
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::Timeout));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_resets_streams() {
        let metrics = Arc::new(CountingMetrics::default());
        let (server, client) = pair_with(DEFAULT_WINDOW, metrics.clone());
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let (mut rd, mut wr) = stream.into_split();

        server.close(CloseReason::Shutdown);
        server.close(CloseReason::PeerClosed);

        assert_eq!(server.state(), SessionState::Closed);
        assert_eq!(server.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::SessionClosed));
        assert!(matches!(wr.write_all(b"x").await, Err(StreamError::Reset(ResetReason::SessionClosed))));
        assert!(matches!(
            server.open_stream(TunnelProto::Tcp, None),
            Err(TunnelError::SessionUnavailable)
        ));

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .unwrap();
        assert_eq!(client.close_reason(), Some(CloseReason::PeerClosed));
        assert_eq!(metrics.sessions_closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closing_attached_session_unregisters_it() {
        let registry = Arc::new(Registry::new());
        let mut p = SessionParams::new("myapp", Role::Server);
        p.registry = Some(registry.clone());
        let s = Session::new(p);
        registry.register("myapp", s.clone()).unwrap();

        s.close(CloseReason::PeerClosed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (session, mut peer) = raw_peer(Role::Server, DEFAULT_WINDOW);
        write_frame(&mut peer, &Frame::ping(42)).await.unwrap();
        loop {
            let f = read_frame(&mut peer).await.unwrap().unwrap();
            if f.ty == FrameType::Pong {
                assert_eq!(f.nonce().unwrap(), 42);
                break;
            }
        }
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn data_for_never_opened_stream_is_fatal() {
        let (session, mut peer) = raw_peer(Role::Server, DEFAULT_WINDOW);
        write_frame(&mut peer, &Frame::data(7, Bytes::from_static(b"?")))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .unwrap();
        assert!(matches!(session.close_reason(), Some(CloseReason::Protocol(_))));
    }

    #[tokio::test]
    async fn frames_for_finished_streams_are_discarded() {
        let (session, mut peer) = raw_peer(Role::Client, DEFAULT_WINDOW);
        write_frame(&mut peer, &Frame::open(2, &OpenRequest::default()).unwrap())
            .await
            .unwrap();
        let stream = session.accept_stream().await.unwrap();
        write_frame(&mut peer, &Frame::reset(2, ResetReason::Cancelled))
            .await
            .unwrap();
        write_frame(&mut peer, &Frame::data(2, Bytes::from_static(b"late")))
            .await
            .unwrap();
        write_frame(&mut peer, &Frame::ping(1)).await.unwrap();

        loop {
            let f = read_frame(&mut peer).await.unwrap().unwrap();
            if f.ty == FrameType::Pong {
                break;
            }
        }
        assert!(!session.is_closed());
        let (mut rd, _wr) = stream.into_split();
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::Cancelled));
    }

    #[tokio::test]
    async fn data_beyond_window_is_fatal() {
        let (session, mut peer) = raw_peer(Role::Client, 16);
        write_frame(&mut peer, &Frame::open(2, &OpenRequest::default()).unwrap())
            .await
            .unwrap();
        let _stream = session.accept_stream().await.unwrap();
        write_frame(&mut peer, &Frame::data(2, Bytes::from(vec![0u8; 17])))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .unwrap();
        assert!(matches!(session.close_reason(), Some(CloseReason::Protocol(_))));
    }

    #[tokio::test]
    async fn reused_open_id_is_fatal() {
        let (session, mut peer) = raw_peer(Role::Client, DEFAULT_WINDOW);
        let open = Frame::open(4, &OpenRequest::default()).unwrap();
        write_frame(&mut peer, &open).await.unwrap();
        write_frame(&mut peer, &Frame::open(2, &OpenRequest::default()).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .unwrap();
        assert!(matches!(session.close_reason(), Some(CloseReason::Protocol(_))));
    }

    #[tokio::test]
    async fn open_arriving_after_close_is_refused() {
        let (session, _peer) = raw_peer(Role::Client, DEFAULT_WINDOW);
        assert_eq!(session.state(), SessionState::Active);
        session.close(CloseReason::IdleTimeout);

        let open = Frame::open(2, &OpenRequest::default()).unwrap();
        session.handle_frame(open).unwrap();

        assert!(lock(&session.streams).map.is_empty());
        assert_eq!(session.stream_count(), 0);
        let accepted = tokio::time::timeout(Duration::from_secs(1), session.accept_stream())
            .await
            .unwrap();
        assert!(accepted.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_closed_after_idle_timeout() {
        let (session, _peer) = raw_peer(Role::Server, DEFAULT_WINDOW);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!session.is_closed());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(session.is_closed());
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_an_idle_pair_alive() {
        let (server, client) = pair();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(server.state(), SessionState::Active);
        assert_eq!(client.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn drain_waits_for_open_streams() {
        let (server, client) = pair();
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let accepted = client.accept_stream().await.unwrap();

        let drainer = {
            let server = server.clone();
            tokio::spawn(async move { server.drain(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.state(), SessionState::Draining);
        assert!(matches!(
            server.open_stream(TunnelProto::Tcp, None),
            Err(TunnelError::SessionUnavailable)
        ));

        let (_s_rd, mut s_wr) = stream.into_split();
        let (_c_rd, mut c_wr) = accepted.into_split();
        s_wr.close().unwrap();
        c_wr.close().unwrap();

        tokio::time::timeout(Duration::from_secs(2), drainer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.close_reason(), Some(CloseReason::Drained));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_grace() {
        let (server, client) = pair();
        let stream = server.open_stream(TunnelProto::Tcp, None).unwrap();
        let _accepted = client.accept_stream().await.unwrap();
        let (mut rd, _wr) = stream.into_split();

        server.drain(Duration::from_secs(5)).await;
        assert!(server.is_closed());
        assert_eq!(rd.recv().await, StreamEvent::Reset(ResetReason::SessionClosed));
    }
}
