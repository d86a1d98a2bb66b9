use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::error::StreamError;
use super::frame::{MAX_FRAME_PAYLOAD, OpenRequest, ResetReason};
use super::session::Session;

/// Default per-stream flow-control window (64 KiB).
pub const DEFAULT_WINDOW: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Opening,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

/// Something that happened to a stream, from this endpoint's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInput {
    SentData,
    ReceivedData,
    /// WINDOW_UPDATE from the peer. The first one acknowledges an OPEN.
    ReceivedWindow,
    SentClose,
    ReceivedClose,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream transition: {input:?} in state {state:?}")]
pub struct InvalidTransition {
    pub state: StreamState,
    pub input: StreamInput,
}

impl StreamState {
    pub fn on(self, input: StreamInput) -> Result<StreamState, InvalidTransition> {
        use StreamInput as I;
        use StreamState as S;

        let next = match (self, input) {
            // Terminal states absorb resets and late window updates.
            (S::Closed | S::Reset, I::Reset | I::ReceivedWindow | I::SentClose) => self,
            (_, I::Reset) => S::Reset,

            (S::Opening | S::Open, I::SentData | I::ReceivedData) => S::Open,
            (S::HalfClosedRemote, I::SentData) => S::HalfClosedRemote,
            (S::HalfClosedLocal, I::ReceivedData) => S::HalfClosedLocal,

            (S::Opening, I::ReceivedWindow) => S::Open,
            (_, I::ReceivedWindow) => self,

            (S::Opening | S::Open, I::SentClose) => S::HalfClosedLocal,
            (S::HalfClosedLocal, I::SentClose) => S::HalfClosedLocal,
            (S::HalfClosedRemote, I::SentClose) => S::Closed,

            (S::Opening | S::Open, I::ReceivedClose) => S::HalfClosedRemote,
            (S::HalfClosedLocal, I::ReceivedClose) => S::Closed,

            _ => return Err(InvalidTransition { state: self, input }),
        };
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }

    pub fn can_recv(self) -> bool {
        matches!(
            self,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedLocal
        )
    }
}

/// Sender-side credit accounting: never more than `granted` bytes in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    granted: u64,
    sent: u64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            granted: u64::from(initial),
            sent: 0,
        }
    }

    /// Adopts a cumulative grant total published by the session.
    pub(crate) fn sync_granted(&mut self, total: u64) {
        self.granted = self.granted.max(total);
    }

    pub fn available(&self) -> u64 {
        self.granted - self.sent
    }

    pub fn consume(&mut self, n: usize) -> Result<(), StreamError> {
        let available = self.available();
        if n as u64 > available {
            return Err(StreamError::WindowExceeded {
                requested: n,
                available,
            });
        }
        self.sent += n as u64;
        Ok(())
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn granted(&self) -> u64 {
        self.granted
    }
}

/// Receiver-side accounting of how much the peer may still send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    remaining: u64,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            remaining: u64::from(initial),
        }
    }

    /// Returns false if `n` bytes exceed what was granted.
    pub fn on_data(&mut self, n: usize) -> bool {
        if n as u64 > self.remaining {
            return false;
        }
        self.remaining -= n as u64;
        true
    }

    pub fn release(&mut self, n: u32) {
        self.remaining = self.remaining.saturating_add(u64::from(n));
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

/// Per-stream signals published by the session's decode loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StreamControl {
    /// Cumulative send credit granted by the peer.
    pub granted: u64,
    pub reset: Option<ResetReason>,
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Bytes),
    /// The peer will send no more data.
    Closed,
    Reset(ResetReason),
}

/// One logical bidirectional byte channel inside a session.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    open: OpenRequest,
    reader: StreamReader,
    writer: StreamWriter,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        open: OpenRequest,
        session: Arc<Session>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        ctl: watch::Receiver<StreamControl>,
    ) -> Self {
        let granted = ctl.borrow().granted;
        let mut window = SendWindow::new(0);
        window.sync_granted(granted);
        Self {
            id,
            open,
            reader: StreamReader {
                id,
                session: session.clone(),
                inbound,
                ctl: ctl.clone(),
                ctl_open: true,
                remote_closed: false,
            },
            writer: StreamWriter {
                id,
                session,
                ctl,
                window,
                closed: false,
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn open_request(&self) -> &OpenRequest {
        &self.open
    }

    /// Acknowledges an accepted stream with a zero-increment WINDOW_UPDATE.
    pub fn ack(&self) {
        self.writer.session.grant(self.id, 0);
    }

    pub fn reset(mut self, reason: ResetReason) {
        self.writer.reset(reason);
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write_all(data).await
    }

    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

#[derive(Debug)]
pub struct StreamReader {
    id: u32,
    session: Arc<Session>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    ctl: watch::Receiver<StreamControl>,
    ctl_open: bool,
    remote_closed: bool,
}

impl StreamReader {
    /// Next event from the peer. A reset preempts any data still buffered.
    ///
    /// After `Closed` has been returned, only a later reset can complete this
    /// future.
    pub async fn recv(&mut self) -> StreamEvent {
        loop {
            let reset = self.ctl.borrow_and_update().reset;
            if let Some(reason) = reset {
                return StreamEvent::Reset(reason);
            }

            tokio::select! {
                biased;

                changed = self.ctl.changed(), if self.ctl_open => {
                    if changed.is_err() {
                        self.ctl_open = false;
                    }
                }
                item = self.inbound.recv(), if !self.remote_closed => match item {
                    Some(Inbound::Data(b)) => return StreamEvent::Data(b),
                    Some(Inbound::Close) => {
                        self.remote_closed = true;
                        return StreamEvent::Closed;
                    }
                    None => {
                        self.remote_closed = true;
                        let reason = self.ctl.borrow().reset.unwrap_or(ResetReason::SessionClosed);
                        return StreamEvent::Reset(reason);
                    }
                },
                else => std::future::pending::<()>().await,
            }
        }
    }

    /// Returns `n` consumed bytes of receive credit to the peer.
    pub fn release(&self, n: usize) {
        let mut left = n;
        while left > 0 {
            let chunk = left.min(u32::MAX as usize);
            self.session.grant(self.id, chunk as u32);
            left -= chunk;
        }
    }
}

#[derive(Debug)]
pub struct StreamWriter {
    id: u32,
    session: Arc<Session>,
    ctl: watch::Receiver<StreamControl>,
    window: SendWindow,
    closed: bool,
}

impl StreamWriter {
    /// Waits for send credit and returns how many bytes may go out in the
    /// next frame.
    ///
    /// Cancel safe: nothing is consumed until [`StreamWriter::send`].
    pub async fn reserve(&mut self) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::WriteClosed);
        }
        loop {
            let ctl = *self.ctl.borrow_and_update();
            if let Some(reason) = ctl.reset {
                return Err(StreamError::Reset(reason));
            }
            self.window.sync_granted(ctl.granted);
            let available = self.window.available();
            if available > 0 {
                return Ok(available.min(MAX_FRAME_PAYLOAD as u64) as usize);
            }
            if self.ctl.changed().await.is_err() {
                return Err(StreamError::SessionClosed);
            }
        }
    }

    /// Sends one DATA frame. Fails instead of blocking when `data` exceeds
    /// the credit currently available.
    pub fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::WriteClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        let ctl = *self.ctl.borrow();
        if let Some(reason) = ctl.reset {
            return Err(StreamError::Reset(reason));
        }
        if data.len() > MAX_FRAME_PAYLOAD {
            return Err(StreamError::WindowExceeded {
                requested: data.len(),
                available: MAX_FRAME_PAYLOAD as u64,
            });
        }
        self.window.sync_granted(ctl.granted);
        self.window.consume(data.len())?;
        self.session
            .send_data(self.id, Bytes::copy_from_slice(data))
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), StreamError> {
        while !data.is_empty() {
            let n = self.reserve().await?.min(data.len());
            self.send(&data[..n])?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Half-closes the stream. Idempotent.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.close_stream(self.id)
    }

    pub fn reset(&mut self, reason: ResetReason) {
        self.closed = true;
        self.session.reset_stream(self.id, reason);
    }

    pub fn window(&self) -> SendWindow {
        self.window
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.session.reset_stream(self.id, ResetReason::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let s = StreamState::Opening;
        let s = s.on(StreamInput::ReceivedWindow).unwrap();
        assert_eq!(s, StreamState::Open);
        let s = s.on(StreamInput::SentData).unwrap();
        let s = s.on(StreamInput::ReceivedData).unwrap();
        let s = s.on(StreamInput::SentClose).unwrap();
        assert_eq!(s, StreamState::HalfClosedLocal);
        let s = s.on(StreamInput::ReceivedData).unwrap();
        let s = s.on(StreamInput::ReceivedClose).unwrap();
        assert_eq!(s, StreamState::Closed);
        assert!(s.is_terminal());
    }

    #[test]
    fn first_data_opens_an_opening_stream() {
        assert_eq!(
            StreamState::Opening.on(StreamInput::SentData).unwrap(),
            StreamState::Open
        );
        assert_eq!(
            StreamState::Opening.on(StreamInput::ReceivedData).unwrap(),
            StreamState::Open
        );
    }

    #[test]
    fn remote_close_then_local_close() {
        let s = StreamState::Open.on(StreamInput::ReceivedClose).unwrap();
        assert_eq!(s, StreamState::HalfClosedRemote);
        assert!(!s.can_recv());
        assert_eq!(s.on(StreamInput::SentData).unwrap(), s);
        assert_eq!(s.on(StreamInput::SentClose).unwrap(), StreamState::Closed);
    }

    #[test]
    fn data_after_close_is_rejected() {
        assert!(StreamState::HalfClosedLocal.on(StreamInput::SentData).is_err());
        assert!(StreamState::HalfClosedRemote.on(StreamInput::ReceivedData).is_err());
        assert!(StreamState::Closed.on(StreamInput::ReceivedData).is_err());
        assert!(StreamState::Reset.on(StreamInput::SentData).is_err());
        assert!(StreamState::HalfClosedRemote.on(StreamInput::ReceivedClose).is_err());
    }

    #[test]
    fn close_and_reset_are_idempotent() {
        assert_eq!(
            StreamState::HalfClosedLocal.on(StreamInput::SentClose).unwrap(),
            StreamState::HalfClosedLocal
        );
        assert_eq!(
            StreamState::Closed.on(StreamInput::SentClose).unwrap(),
            StreamState::Closed
        );
        for s in [
            StreamState::Opening,
            StreamState::Open,
            StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote,
        ] {
            assert_eq!(s.on(StreamInput::Reset).unwrap(), StreamState::Reset);
        }
        assert_eq!(
            StreamState::Closed.on(StreamInput::Reset).unwrap(),
            StreamState::Closed
        );
        assert_eq!(
            StreamState::Reset.on(StreamInput::Reset).unwrap(),
            StreamState::Reset
        );
    }

    #[test]
    fn send_window_never_goes_negative() {
        let mut w = SendWindow::new(10);
        w.consume(6).unwrap();
        assert_eq!(w.available(), 4);
        match w.consume(5) {
            Err(StreamError::WindowExceeded {
                requested,
                available,
            }) => {
                assert_eq!(requested, 5);
                assert_eq!(available, 4);
            }
            other => panic!("unexpected: {other:?}"),
        }
        w.sync_granted(16);
        w.consume(10).unwrap();
        assert_eq!(w.available(), 0);
        assert_eq!(w.sent(), 16);
        assert!(w.sent() <= w.granted());

        // Stale totals never shrink the window.
        w.sync_granted(3);
        assert_eq!(w.granted(), 16);
    }

    #[test]
    fn recv_window_rejects_overrun() {
        let mut w = RecvWindow::new(8);
        assert!(w.on_data(8));
        assert!(!w.on_data(1));
        w.release(4);
        assert!(w.on_data(4));
        assert_eq!(w.remaining(), 0);
    }
}
