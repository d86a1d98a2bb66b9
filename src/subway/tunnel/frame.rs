//! Wire format of the multiplexing protocol.
//!
//! Every frame is a fixed 9-byte header followed by the payload:
//!
//! ```text
//! +--------+----------------+----------------+-----------------+
//! | type:u8| stream_id:u32be|  length:u32be  | payload (length)|
//! +--------+----------------+----------------+-----------------+
//! ```
//!
//! Session-level frames (AUTH, AUTH_ACK, PING, PONG) use stream id 0; every
//! other frame addresses a non-zero stream id.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 9;
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Auth = 1,
    AuthAck = 2,
    Open = 3,
    Data = 4,
    WindowUpdate = 5,
    Close = 6,
    Reset = 7,
    Ping = 8,
    Pong = 9,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => FrameType::Auth,
            2 => FrameType::AuthAck,
            3 => FrameType::Open,
            4 => FrameType::Data,
            5 => FrameType::WindowUpdate,
            6 => FrameType::Close,
            7 => FrameType::Reset,
            8 => FrameType::Ping,
            9 => FrameType::Pong,
            _ => return None,
        })
    }

    pub fn is_session_level(self) -> bool {
        matches!(
            self,
            FrameType::Auth | FrameType::AuthAck | FrameType::Ping | FrameType::Pong
        )
    }

    /// Exact payload length for frame types with a fixed-size body.
    fn fixed_len(self) -> Option<usize> {
        match self {
            FrameType::WindowUpdate => Some(4),
            FrameType::Close => Some(0),
            FrameType::Reset => Some(1),
            FrameType::Ping | FrameType::Pong => Some(8),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },
    #[error("frame payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("stream id {id} is not valid for a {ty:?} frame")]
    BadStreamId { ty: FrameType, id: u32 },
    #[error("malformed {0:?} payload")]
    BadPayload(FrameType),
    #[error("unknown reset reason {0}")]
    UnknownReason(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a stream was reset. Carried in RESET frames for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResetReason {
    TargetUnreachable = 1,
    Timeout = 2,
    ProtocolError = 3,
    AuthRevoked = 4,
    SessionClosed = 5,
    Cancelled = 6,
}

impl ResetReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => ResetReason::TargetUnreachable,
            2 => ResetReason::Timeout,
            3 => ResetReason::ProtocolError,
            4 => ResetReason::AuthRevoked,
            5 => ResetReason::SessionClosed,
            6 => ResetReason::Cancelled,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResetReason::TargetUnreachable => "target_unreachable",
            ResetReason::Timeout => "timeout",
            ResetReason::ProtocolError => "protocol_error",
            ResetReason::AuthRevoked => "auth_revoked",
            ResetReason::SessionClosed => "session_closed",
            ResetReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol hint for a tunnel or a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProto {
    #[default]
    Http,
    Tcp,
}

impl TunnelProto {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "http" => Some(TunnelProto::Http),
            "tcp" => Some(TunnelProto::Tcp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelProto::Http => "http",
            TunnelProto::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First frame on a fresh transport, sent by the tunnel client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub version: u8,
    pub subdomain: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub proto: TunnelProto,
    /// Requested public port for TCP tunnels (0 = any).
    #[serde(default)]
    pub remote_port: u16,
    /// Initial per-stream receive window the client grants the server.
    #[serde(default)]
    pub window: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    pub ok: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub window: u32,
}

impl AuthAck {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            session_id: String::new(),
            public_url: String::new(),
            window: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenRequest {
    #[serde(default)]
    pub proto: TunnelProto,
    /// Address of the external peer, for the client's logs.
    #[serde(default)]
    pub remote_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(ty: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            ty,
            stream_id,
            payload,
        }
    }

    pub fn auth(req: &AuthRequest) -> Result<Self, FrameError> {
        Ok(Self::new(FrameType::Auth, 0, json_payload(req)?))
    }

    pub fn auth_ack(ack: &AuthAck) -> Result<Self, FrameError> {
        Ok(Self::new(FrameType::AuthAck, 0, json_payload(ack)?))
    }

    pub fn open(stream_id: u32, req: &OpenRequest) -> Result<Self, FrameError> {
        Ok(Self::new(FrameType::Open, stream_id, json_payload(req)?))
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Self::new(
            FrameType::WindowUpdate,
            stream_id,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    pub fn reset(stream_id: u32, reason: ResetReason) -> Self {
        Self::new(
            FrameType::Reset,
            stream_id,
            Bytes::copy_from_slice(&[reason as u8]),
        )
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(FrameType::Ping, 0, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(FrameType::Pong, 0, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    pub fn parse_auth(&self) -> Result<AuthRequest, FrameError> {
        self.expect(FrameType::Auth)?;
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn parse_auth_ack(&self) -> Result<AuthAck, FrameError> {
        self.expect(FrameType::AuthAck)?;
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn parse_open(&self) -> Result<OpenRequest, FrameError> {
        self.expect(FrameType::Open)?;
        if self.payload.is_empty() {
            return Ok(OpenRequest::default());
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn window_increment(&self) -> Result<u32, FrameError> {
        self.expect(FrameType::WindowUpdate)?;
        let b: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| FrameError::BadPayload(self.ty))?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn reset_reason(&self) -> Result<ResetReason, FrameError> {
        self.expect(FrameType::Reset)?;
        let code = *self
            .payload
            .first()
            .ok_or(FrameError::BadPayload(self.ty))?;
        ResetReason::from_u8(code).ok_or(FrameError::UnknownReason(code))
    }

    pub fn nonce(&self) -> Result<u64, FrameError> {
        if !matches!(self.ty, FrameType::Ping | FrameType::Pong) {
            return Err(FrameError::BadPayload(self.ty));
        }
        let b: [u8; 8] = self.payload[..]
            .try_into()
            .map_err(|_| FrameError::BadPayload(self.ty))?;
        Ok(u64::from_be_bytes(b))
    }

    fn expect(&self, ty: FrameType) -> Result<(), FrameError> {
        if self.ty != ty {
            return Err(FrameError::BadPayload(ty));
        }
        Ok(())
    }
}

fn json_payload<T: Serialize>(v: &T) -> Result<Bytes, FrameError> {
    let b = serde_json::to_vec(v)?;
    if b.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(b.len()));
    }
    Ok(Bytes::from(b))
}

fn check_header(ty: FrameType, stream_id: u32, len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(len));
    }
    if ty.is_session_level() != (stream_id == 0) {
        return Err(FrameError::BadStreamId { ty, id: stream_id });
    }
    if let Some(want) = ty.fixed_len() {
        if want != len {
            return Err(FrameError::BadPayload(ty));
        }
    }
    Ok(())
}

fn parse_header(hdr: &[u8; FRAME_HEADER_LEN]) -> Result<(FrameType, u32, usize), FrameError> {
    let ty = FrameType::from_u8(hdr[0]).ok_or(FrameError::UnknownType(hdr[0]))?;
    let stream_id = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
    let len = u32::from_be_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]) as usize;
    check_header(ty, stream_id, len)?;
    Ok((ty, stream_id, len))
}

pub fn encode_into(frame: &Frame, out: &mut BytesMut) -> Result<(), FrameError> {
    check_header(frame.ty, frame.stream_id, frame.payload.len())?;
    out.reserve(FRAME_HEADER_LEN + frame.payload.len());
    out.put_u8(frame.ty as u8);
    out.put_u32(frame.stream_id);
    out.put_u32(frame.payload.len() as u32);
    out.put_slice(&frame.payload);
    Ok(())
}

pub fn encode(frame: &Frame) -> Result<Bytes, FrameError> {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
    encode_into(frame, &mut out)?;
    Ok(out.freeze())
}

/// Decodes one frame from the front of `buf`, returning it with the number of
/// bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    let Some(hdr) = buf.first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(FrameError::Truncated {
            needed: FRAME_HEADER_LEN - buf.len(),
        });
    };
    let (ty, stream_id, len) = parse_header(hdr)?;
    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        return Err(FrameError::Truncated {
            needed: total - buf.len(),
        });
    }
    let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..total]);
    Ok((Frame::new(ty, stream_id, payload), total))
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let n = r.read(&mut hdr).await?;
    if n == 0 {
        return Ok(None);
    }
    r.read_exact(&mut hdr[n..]).await?;

    // Length is validated before any payload byte is read.
    let (ty, stream_id, len) = parse_header(&hdr)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(Frame::new(ty, stream_id, Bytes::from(payload))))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let b = encode(frame)?;
    w.write_all(&b).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reports_consumed_bytes_for_back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_into(&Frame::data(3, Bytes::from_static(b"hello")), &mut buf).unwrap();
        encode_into(&Frame::window_update(3, 4096), &mut buf).unwrap();
        encode_into(&Frame::reset(5, ResetReason::TargetUnreachable), &mut buf).unwrap();

        let (f1, n1) = decode(&buf).unwrap();
        assert_eq!(f1.ty, FrameType::Data);
        assert_eq!(f1.stream_id, 3);
        assert_eq!(&f1.payload[..], b"hello");
        assert_eq!(n1, FRAME_HEADER_LEN + 5);

        let (f2, n2) = decode(&buf[n1..]).unwrap();
        assert_eq!(f2.window_increment().unwrap(), 4096);

        let (f3, n3) = decode(&buf[n1 + n2..]).unwrap();
        assert_eq!(f3.reset_reason().unwrap(), ResetReason::TargetUnreachable);
        assert_eq!(n1 + n2 + n3, buf.len());
    }

    #[test]
    fn every_frame_type_decodes_to_what_was_encoded() {
        let auth = AuthRequest {
            version: PROTOCOL_VERSION,
            subdomain: "myapp".into(),
            token: "secret".into(),
            proto: TunnelProto::Tcp,
            remote_port: 2222,
            window: 128 * 1024,
        };
        let ack = AuthAck {
            ok: true,
            reason: String::new(),
            session_id: "0123456789abcdef0123456789abcdef".into(),
            public_url: "tcp://tunnel.test:2222".into(),
            window: 64 * 1024,
        };
        let open = OpenRequest {
            proto: TunnelProto::Http,
            remote_addr: "203.0.113.9:4444".into(),
        };
        let frames = [
            Frame::auth(&auth).unwrap(),
            Frame::auth_ack(&ack).unwrap(),
            Frame::open(2, &open).unwrap(),
            Frame::data(2, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")),
            Frame::window_update(2, 4096),
            Frame::close(2),
            Frame::reset(2, ResetReason::Timeout),
            Frame::ping(0xdead_beef),
            Frame::pong(0xdead_beef),
        ];

        let mut seen = Vec::new();
        for frame in &frames {
            let b = encode(frame).unwrap();
            let (back, n) = decode(&b).unwrap();
            assert_eq!(&back, frame);
            assert_eq!(n, b.len());
            seen.push(back.ty);
        }
        assert_eq!(
            seen,
            (1..=9).map(|t| FrameType::from_u8(t).unwrap()).collect::<Vec<_>>()
        );

        assert_eq!(frames[0].parse_auth().unwrap(), auth);
        assert_eq!(frames[1].parse_auth_ack().unwrap(), ack);
        assert_eq!(frames[2].parse_open().unwrap(), open);
        assert_eq!(frames[7].nonce().unwrap(), 0xdead_beef);
        assert_eq!(frames[8].nonce().unwrap(), 0xdead_beef);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let b = encode(&Frame::data(1, Bytes::from_static(b"abcdef"))).unwrap();

        match decode(&b[..4]) {
            Err(FrameError::Truncated { needed }) => assert_eq!(needed, FRAME_HEADER_LEN - 4),
            other => panic!("unexpected: {other:?}"),
        }
        match decode(&b[..b.len() - 2]) {
            Err(FrameError::Truncated { needed }) => assert_eq!(needed, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn max_size_payload_is_accepted_and_one_more_byte_is_not() {
        let full = Bytes::from(vec![7u8; MAX_FRAME_PAYLOAD]);
        let b = encode(&Frame::data(1, full.clone())).unwrap();
        let (f, n) = decode(&b).unwrap();
        assert_eq!(f.payload, full);
        assert_eq!(n, b.len());

        let over = Frame::data(1, Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]));
        assert!(matches!(encode(&over), Err(FrameError::TooLarge(_))));

        let mut hdr = vec![FrameType::Data as u8];
        hdr.extend_from_slice(&1u32.to_be_bytes());
        hdr.extend_from_slice(&((MAX_FRAME_PAYLOAD + 1) as u32).to_be_bytes());
        assert!(matches!(decode(&hdr), Err(FrameError::TooLarge(n)) if n == MAX_FRAME_PAYLOAD + 1));
    }

    #[test]
    fn stream_id_must_match_frame_level() {
        let b = encode(&Frame::ping(1)).unwrap();
        let mut bad = b.to_vec();
        bad[4] = 9; // stream id 9 on a PING
        assert!(matches!(decode(&bad), Err(FrameError::BadStreamId { .. })));

        let data_on_zero = Frame::data(0, Bytes::from_static(b"x"));
        assert!(matches!(encode(&data_on_zero), Err(FrameError::BadStreamId { .. })));
    }

    #[test]
    fn unknown_type_and_bad_fixed_lengths_are_rejected() {
        let mut raw = vec![0x7f];
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(decode(&raw), Err(FrameError::UnknownType(0x7f))));

        let mut raw = vec![FrameType::WindowUpdate as u8];
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&2u32.to_be_bytes());
        raw.extend_from_slice(&[0, 1]);
        assert!(matches!(decode(&raw), Err(FrameError::BadPayload(FrameType::WindowUpdate))));

        let bad_reason = Frame::new(FrameType::Reset, 1, Bytes::from_static(&[42]));
        assert!(matches!(bad_reason.reset_reason(), Err(FrameError::UnknownReason(42))));
    }

    #[test]
    fn auth_payload_defaults_missing_fields() {
        let f = Frame::new(
            FrameType::Auth,
            0,
            Bytes::from_static(br#"{"subdomain":"myapp","token":"t"}"#),
        );
        let req = f.parse_auth().unwrap();
        assert_eq!(req.subdomain, "myapp");
        assert_eq!(req.proto, TunnelProto::Http);
        assert_eq!(req.remote_port, 0);
        assert_eq!(req.window, 0);

        let open = Frame::new(FrameType::Open, 2, Bytes::new()).parse_open().unwrap();
        assert_eq!(open, OpenRequest::default());
    }

    #[tokio::test]
    async fn read_frame_roundtrip_and_clean_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = AuthRequest {
            version: PROTOCOL_VERSION,
            subdomain: "myapp".into(),
            token: "secret".into(),
            proto: TunnelProto::Tcp,
            remote_port: 2222,
            window: 65536,
        };
        let f = Frame::auth(&req).unwrap();
        write_frame(&mut a, &f).await.unwrap();
        write_frame(&mut a, &Frame::close(7)).await.unwrap();
        drop(a);

        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got.parse_auth().unwrap(), req);
        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, Frame::close(7));
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_u8(FrameType::Data as u8).await.unwrap();
            a.write_u32(1).await.unwrap();
            a.write_u32(u32::MAX).await.unwrap();
            // no payload follows
        });

        match read_frame(&mut b).await {
            Err(FrameError::TooLarge(n)) => assert_eq!(n, u32::MAX as usize),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_frame_fails_on_eof_mid_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bytes = encode(&Frame::data(1, Bytes::from_static(b"0123456789"))).unwrap();
        a.write_all(&bytes[..12]).await.unwrap();
        drop(a);

        match read_frame(&mut b).await {
            Err(FrameError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
