//! Binary key-value protocol framing.
//!
//! Every packet is a 24-byte header followed by extras, key and value:
//!
//! ```text
//!  0      1      2..4     4        5        6..8             8..12      12..16  16..24
//!  magic  op     keylen   extlen   dtype    vbucket|status   bodylen    opaque  cas
//! ```
//!
//! Requests carry magic `0x80` and a vbucket id; responses carry `0x81` and a
//! status word. [`BinaryCodec`] decodes and encodes both directions as
//! [`Frame`] values; [`Request`] and [`Response`] are the typed views the
//! client works with.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use keyroute_core::{ObserveKeyState, ResponseStatus};

use crate::error::TransportError;

pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;
pub const HEADER_LEN: usize = 24;

/// Largest body accepted from the wire (20 MiB value limit plus headroom).
const DEFAULT_MAX_BODY: usize = 21 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Opcode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Noop = 0x0a,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    ReplicaRead = 0x83,
    Observe = 0x92,
}

impl Opcode {
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Get,
            0x01 => Self::Set,
            0x02 => Self::Add,
            0x03 => Self::Replace,
            0x04 => Self::Delete,
            0x0a => Self::Noop,
            0x1c => Self::Touch,
            0x1d => Self::GetAndTouch,
            0x83 => Self::ReplicaRead,
            0x92 => Self::Observe,
            _ => return None,
        })
    }
}

/// Store semantics of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Upsert.
    Set,
    /// Insert, fails with `KeyExists` when present.
    Add,
    /// Update, fails with `KeyNotFound` when absent.
    Replace,
}

impl StoreMode {
    fn opcode(self) -> Opcode {
        match self {
            Self::Set => Opcode::Set,
            Self::Add => Opcode::Add,
            Self::Replace => Opcode::Replace,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One packet on the wire, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: u8,
    pub opcode: u8,
    pub data_type: u8,
    /// Vbucket id in requests, status word in responses.
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Codec for [`Frame`]s.
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    max_body: usize,
}

impl BinaryCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_body: DEFAULT_MAX_BODY,
        }
    }

    #[must_use]
    pub fn with_max_body(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BinaryCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = src[0];
        if magic != REQUEST_MAGIC && magic != RESPONSE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid magic byte 0x{magic:02x}"),
            ));
        }

        let key_len = usize::from(u16::from_be_bytes([src[2], src[3]]));
        let extras_len = usize::from(src[4]);
        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        if body_len > self.max_body {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body of {body_len} bytes exceeds limit"),
            ));
        }
        if key_len + extras_len > body_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "key and extras longer than body",
            ));
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let mut body = src.split_to(body_len);

        header.advance(1);
        let opcode = header.get_u8();
        header.advance(3); // key length, extras length
        let data_type = header.get_u8();
        let vbucket_or_status = header.get_u16();
        header.advance(4); // body length
        let opaque = header.get_u32();
        let cas = header.get_u64();

        let extras = body.split_to(extras_len).freeze();
        let key = body.split_to(key_len).freeze();
        let value = body.freeze();

        Ok(Some(Frame {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        }))
    }
}

impl Encoder<Frame> for BinaryCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let key_len = u16::try_from(frame.key.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "key too long"))?;
        let extras_len = u8::try_from(frame.extras.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "extras too long"))?;
        let body_len = frame.body_len();
        if body_len > self.max_body {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame body too large",
            ));
        }
        let body_len_u32 = u32::try_from(body_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame body too large"))?;

        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(frame.magic);
        dst.put_u8(frame.opcode);
        dst.put_u16(key_len);
        dst.put_u8(extras_len);
        dst.put_u8(frame.data_type);
        dst.put_u16(frame.vbucket_or_status);
        dst.put_u32(body_len_u32);
        dst.put_u32(frame.opaque);
        dst.put_u64(frame.cas);
        dst.put_slice(&frame.extras);
        dst.put_slice(&frame.key);
        dst.put_slice(&frame.value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A typed request, vbucket already assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub key: Bytes,
    pub vbucket: u16,
    pub cas: u64,
    pub extras: Bytes,
    pub value: Bytes,
}

impl Request {
    fn simple(opcode: Opcode, key: &str, vbucket: u16) -> Self {
        Self {
            opcode,
            key: Bytes::copy_from_slice(key.as_bytes()),
            vbucket,
            cas: 0,
            extras: Bytes::new(),
            value: Bytes::new(),
        }
    }

    #[must_use]
    pub fn get(key: &str, vbucket: u16) -> Self {
        Self::simple(Opcode::Get, key, vbucket)
    }

    #[must_use]
    pub fn replica_read(key: &str, vbucket: u16) -> Self {
        Self::simple(Opcode::ReplicaRead, key, vbucket)
    }

    #[must_use]
    pub fn noop() -> Self {
        Self::simple(Opcode::Noop, "", 0)
    }

    #[must_use]
    pub fn delete(key: &str, vbucket: u16, cas: u64) -> Self {
        Self {
            cas,
            ..Self::simple(Opcode::Delete, key, vbucket)
        }
    }

    #[must_use]
    pub fn store(
        mode: StoreMode,
        key: &str,
        vbucket: u16,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
    ) -> Self {
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u32(flags);
        extras.put_u32(expiry);
        Self {
            cas,
            extras: extras.freeze(),
            value,
            ..Self::simple(mode.opcode(), key, vbucket)
        }
    }

    #[must_use]
    pub fn touch(key: &str, vbucket: u16, expiry: u32) -> Self {
        Self {
            extras: Bytes::copy_from_slice(&expiry.to_be_bytes()),
            ..Self::simple(Opcode::Touch, key, vbucket)
        }
    }

    #[must_use]
    pub fn get_and_touch(key: &str, vbucket: u16, expiry: u32) -> Self {
        Self {
            extras: Bytes::copy_from_slice(&expiry.to_be_bytes()),
            ..Self::simple(Opcode::GetAndTouch, key, vbucket)
        }
    }

    /// Observe carries its key and vbucket in the body, not the header.
    ///
    /// # Errors
    ///
    /// Fails when the key does not fit a 16-bit length.
    pub fn observe(key: &str, vbucket: u16) -> Result<Self, TransportError> {
        let key_len = u16::try_from(key.len())
            .map_err(|_| TransportError::Protocol("observe key too long".into()))?;
        let mut body = BytesMut::with_capacity(4 + key.len());
        body.put_u16(vbucket);
        body.put_u16(key_len);
        body.put_slice(key.as_bytes());
        Ok(Self {
            opcode: Opcode::Observe,
            key: Bytes::new(),
            vbucket: 0,
            cas: 0,
            extras: Bytes::new(),
            value: body.freeze(),
        })
    }

    #[must_use]
    pub fn into_frame(self, opaque: u32) -> Frame {
        Frame {
            magic: REQUEST_MAGIC,
            opcode: self.opcode as u8,
            data_type: 0,
            vbucket_or_status: self.vbucket,
            opaque,
            cas: self.cas,
            extras: self.extras,
            key: self.key,
            value: self.value,
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A typed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub cas: u64,
    pub flags: u32,
    /// Document body on reads. On not-my-vbucket this may hold a cluster
    /// configuration.
    pub value: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(status: ResponseStatus) -> Self {
        Self {
            status,
            cas: 0,
            flags: 0,
            value: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Builds the typed view of a response frame.
    #[must_use]
    pub fn from_frame(frame: Frame) -> Self {
        let flags = if frame.extras.len() >= 4 {
            u32::from_be_bytes([
                frame.extras[0],
                frame.extras[1],
                frame.extras[2],
                frame.extras[3],
            ])
        } else {
            0
        };
        Self {
            status: ResponseStatus::from_code(frame.vbucket_or_status),
            cas: frame.cas,
            flags,
            value: frame.value,
        }
    }
}

/// Result of observing one key on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveResult {
    pub key_state: ObserveKeyState,
    pub cas: u64,
}

impl ObserveResult {
    /// Parses an observe response body: `vb:u16 keylen:u16 key state:u8 cas:u64`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] for truncated bodies and unknown
    /// key states.
    pub fn parse(mut body: Bytes) -> Result<Self, TransportError> {
        let truncated = || TransportError::Protocol("truncated observe response".into());
        if body.remaining() < 4 {
            return Err(truncated());
        }
        body.advance(2);
        let key_len = usize::from(body.get_u16());
        if body.remaining() < key_len + 9 {
            return Err(truncated());
        }
        body.advance(key_len);
        let state = body.get_u8();
        let cas = body.get_u64();
        let key_state = ObserveKeyState::from_byte(state).ok_or_else(|| {
            TransportError::Protocol(format!("unknown observe key state 0x{state:02x}"))
        })?;
        Ok(Self { key_state, cas })
    }

    /// Encodes a response body; the inverse of [`ObserveResult::parse`].
    #[must_use]
    pub fn encode(&self, key: &str, vbucket: u16) -> Bytes {
        let mut body = BytesMut::with_capacity(13 + key.len());
        body.put_u16(vbucket);
        body.put_u16(u16::try_from(key.len()).unwrap_or(u16::MAX));
        body.put_slice(key.as_bytes());
        body.put_u8(self.key_state.to_byte());
        body.put_u64(self.cas);
        body.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_get_header_layout() {
        let mut codec = BinaryCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Request::get("abc", 0x0102).into_frame(7), &mut buf)
            .unwrap();

        assert_eq!(buf.len(), HEADER_LEN + 3);
        assert_eq!(buf[0], REQUEST_MAGIC);
        assert_eq!(buf[1], Opcode::Get as u8);
        assert_eq!(&buf[2..4], &[0, 3]);
        assert_eq!(buf[4], 0);
        assert_eq!(&buf[6..8], &[0x01, 0x02]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 3]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 7]);
        assert_eq!(&buf[24..], b"abc");
    }

    #[test]
    fn store_carries_flags_and_expiry_extras() {
        let req = Request::store(
            StoreMode::Add,
            "k",
            3,
            Bytes::from_static(b"v"),
            0xdead_beef,
            60,
            42,
        );
        assert_eq!(req.opcode, Opcode::Add);
        assert_eq!(req.cas, 42);
        assert_eq!(&req.extras[..], &[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 60]);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = BinaryCodec::new();
        let mut full = BytesMut::new();
        let frame = Frame {
            magic: RESPONSE_MAGIC,
            opcode: Opcode::Get as u8,
            data_type: 0,
            vbucket_or_status: 0,
            opaque: 9,
            cas: 77,
            extras: Bytes::from_static(&[0, 0, 0, 5]),
            key: Bytes::new(),
            value: Bytes::from_static(b"hello"),
        };
        codec.encode(frame.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..HEADER_LEN + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[HEADER_LEN + 2..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(partial.is_empty());

        let response = Response::from_frame(decoded);
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.flags, 5);
        assert_eq!(response.cas, 77);
        assert_eq!(&response.value[..], b"hello");
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut codec = BinaryCodec::new();
        let mut buf = BytesMut::from(&[0x42u8; HEADER_LEN][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_rejects_oversized_body() {
        let mut codec = BinaryCodec::with_max_body(16);
        let mut buf = BytesMut::new();
        BinaryCodec::new()
            .encode(
                Request::store(StoreMode::Set, "k", 0, Bytes::from(vec![0u8; 64]), 0, 0, 0)
                    .into_frame(1),
                &mut buf,
            )
            .unwrap();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn not_my_vbucket_status_maps() {
        let frame = Frame {
            magic: RESPONSE_MAGIC,
            opcode: Opcode::Set as u8,
            data_type: 0,
            vbucket_or_status: 0x07,
            opaque: 1,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::from_static(b"{}"),
        };
        let response = Response::from_frame(frame);
        assert!(response.status.is_not_my_vbucket());
    }

    #[test]
    fn observe_request_and_response_bodies() {
        let req = Request::observe("user::1", 513).unwrap();
        assert_eq!(req.opcode, Opcode::Observe);
        assert!(req.key.is_empty());
        assert_eq!(&req.value[..4], &[0x02, 0x01, 0, 7]);
        assert_eq!(&req.value[4..], b"user::1");

        let result = ObserveResult {
            key_state: ObserveKeyState::FoundPersisted,
            cas: 0x0102_0304,
        };
        let parsed = ObserveResult::parse(result.encode("user::1", 513)).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn observe_parse_rejects_truncated_and_unknown_state() {
        assert!(ObserveResult::parse(Bytes::from_static(&[0, 1])).is_err());

        let mut body = BytesMut::new();
        body.put_u16(0);
        body.put_u16(1);
        body.put_u8(b'k');
        body.put_u8(0x05);
        body.put_u64(1);
        assert!(ObserveResult::parse(body.freeze()).is_err());
    }
}
