//! Plexus wire format: transport frames and the few game packets the relay
//! decodes.
//!
//! A frame is a fixed 5-byte header followed by its body:
//!
//!   [ length: u32 LE ][ flags: u8 ][ body: length bytes ]
//!
//! Flag bit 0 marks an encrypted body (see `cipher`). A plain body is a
//! varuint packet header (`id = header & 0x3ff`, upper bits carry sub-client
//! routing and are preserved) followed by the packet payload.
//!
//! Every packet id not listed below is opaque to the relay and travels as
//! raw bytes. The header layout is checked at compile time; payload codecs
//! use the game's own varint and little-endian conventions.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Packet ids ────────────────────────────────────────────────────────────────

pub const LOGIN: u32 = 0x01;
pub const SERVER_TO_CLIENT_HANDSHAKE: u32 = 0x03;
pub const CLIENT_TO_SERVER_HANDSHAKE: u32 = 0x04;
pub const DISCONNECT: u32 = 0x05;
pub const START_GAME: u32 = 0x0b;
pub const CHANGE_DIMENSION: u32 = 0x3d;

/// Mask selecting the packet id out of the packet header.
pub const PACKET_ID_MASK: u32 = 0x3ff;

/// Human-readable name for logs.
pub fn packet_name(id: u32) -> &'static str {
    match id {
        LOGIN => "login",
        SERVER_TO_CLIENT_HANDSHAKE => "server-handshake",
        CLIENT_TO_SERVER_HANDSHAKE => "client-handshake-ack",
        DISCONNECT => "disconnect",
        START_GAME => "start-of-session",
        CHANGE_DIMENSION => "change-dimension",
        _ => "opaque",
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// Transport frame header.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Body length in bytes, not counting this header.
    pub length: U32<LittleEndian>,
    /// bit 0: body is encrypted. bits 1-7: reserved, zero.
    pub flags: u8,
}

assert_eq_size!(FrameHeader, [u8; 5]);

pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Largest body a peer may announce. Bigger frames close the connection.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

impl FrameHeader {
    pub fn new(length: u32, flags: u8) -> Self {
        Self {
            length: U32::new(length),
            flags,
        }
    }

    pub fn body_len(&self) -> usize {
        self.length.get() as usize
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

/// One transport frame, body still in its on-wire (possibly encrypted) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

/// Append a framed `body` to `dst`.
pub fn encode_frame(dst: &mut BytesMut, flags: u8, body: &[u8]) -> Result<(), WireError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let header = FrameHeader::new(body.len() as u32, flags);
    dst.reserve(FRAME_HEADER_LEN + body.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(body);
    Ok(())
}

/// Take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed,
/// so callers can keep appending reads to the same buffer.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
    let Some(header) = buf
        .get(..FRAME_HEADER_LEN)
        .and_then(FrameHeader::read_from)
    else {
        return Ok(None);
    };
    let len = header.body_len();
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        buf.reserve(FRAME_HEADER_LEN + len - buf.len());
        return Ok(None);
    }
    let mut frame = buf.split_to(FRAME_HEADER_LEN + len);
    let body = frame.split_off(FRAME_HEADER_LEN).freeze();
    Ok(Some(Frame {
        flags: header.flags,
        body,
    }))
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decrypted game packet. `as_bytes` returns exactly what arrived, so a
/// relayed packet is byte-identical to the one received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: u32,
    body: Bytes,
    payload_offset: usize,
}

impl Packet {
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let header = id & PACKET_ID_MASK;
        let mut body = BytesMut::with_capacity(payload.len() + 5);
        put_varuint32(&mut body, header);
        let payload_offset = body.len();
        body.put_slice(payload);
        Self {
            header,
            body: body.freeze(),
            payload_offset,
        }
    }

    pub fn decode(body: Bytes) -> Result<Self, WireError> {
        let mut reader = Reader::new(&body);
        let header = reader.varuint32()?;
        let payload_offset = reader.position();
        Ok(Self {
            header,
            body,
            payload_offset,
        })
    }

    pub fn id(&self) -> u32 {
        self.header & PACKET_ID_MASK
    }

    pub fn name(&self) -> &'static str {
        packet_name(self.id())
    }

    pub fn payload(&self) -> &[u8] {
        &self.body[self.payload_offset..]
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.body
    }

    fn reader_for(&self, id: u32) -> Result<Reader<'_>, WireError> {
        if self.id() != id {
            return Err(WireError::UnexpectedPacketId {
                expected: id,
                actual: self.id(),
            });
        }
        Ok(Reader::new(self.payload()))
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// 0x01. The client's identity chain and client-data token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPacket {
    pub protocol_version: i32,
    pub chain: Vec<String>,
    pub client_data: String,
}

#[derive(Serialize, Deserialize)]
struct ChainJson {
    chain: Vec<String>,
}

impl LoginPacket {
    pub fn decode(packet: &Packet) -> Result<Self, WireError> {
        let mut r = packet.reader_for(LOGIN)?;
        let protocol_version = r.i32_be()?;
        let total = r.varuint32()? as usize;
        let mut r = Reader::new(r.bytes(total)?);

        let chain_len = r.u32_le()? as usize;
        let chain: ChainJson = serde_json::from_slice(r.bytes(chain_len)?)
            .map_err(|e| WireError::InvalidJson(e.to_string()))?;
        let data_len = r.u32_le()? as usize;
        let client_data = std::str::from_utf8(r.bytes(data_len)?)
            .map_err(|_| WireError::InvalidUtf8)?
            .to_string();

        Ok(Self {
            protocol_version,
            chain: chain.chain,
            client_data,
        })
    }

    pub fn encode(&self) -> Result<Packet, WireError> {
        let chain = serde_json::to_vec(&ChainJson {
            chain: self.chain.clone(),
        })
        .map_err(|e| WireError::InvalidJson(e.to_string()))?;

        let mut inner = BytesMut::new();
        inner.put_u32_le(chain.len() as u32);
        inner.put_slice(&chain);
        inner.put_u32_le(self.client_data.len() as u32);
        inner.put_slice(self.client_data.as_bytes());

        let mut payload = BytesMut::with_capacity(inner.len() + 9);
        payload.put_i32(self.protocol_version);
        put_varuint32(&mut payload, inner.len() as u32);
        payload.put_slice(&inner);
        Ok(Packet::new(LOGIN, &payload))
    }
}

/// 0x03. Server's signed token carrying its key and the salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub token: String,
}

impl ServerHandshake {
    pub fn decode(packet: &Packet) -> Result<Self, WireError> {
        let mut r = packet.reader_for(SERVER_TO_CLIENT_HANDSHAKE)?;
        Ok(Self { token: r.string()? })
    }

    pub fn encode(&self) -> Packet {
        let mut payload = BytesMut::new();
        put_string(&mut payload, &self.token);
        Packet::new(SERVER_TO_CLIENT_HANDSHAKE, &payload)
    }
}

/// 0x04. Empty acknowledgement that the client has enabled encryption.
pub fn client_handshake_ack() -> Packet {
    Packet::new(CLIENT_TO_SERVER_HANDSHAKE, &[])
}

/// 0x05.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub hide_screen: bool,
    pub message: String,
}

impl Disconnect {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            hide_screen: false,
            message: message.into(),
        }
    }

    pub fn decode(packet: &Packet) -> Result<Self, WireError> {
        let mut r = packet.reader_for(DISCONNECT)?;
        let hide_screen = r.bool()?;
        let message = if hide_screen { String::new() } else { r.string()? };
        Ok(Self {
            hide_screen,
            message,
        })
    }

    pub fn encode(&self) -> Packet {
        let mut payload = BytesMut::new();
        payload.put_u8(self.hide_screen as u8);
        if !self.hide_screen {
            put_string(&mut payload, &self.message);
        }
        Packet::new(DISCONNECT, &payload)
    }
}

/// 0x0b. Only the leading fields up to the dimension are decoded; the rest
/// of the payload is kept as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct StartGame {
    pub unique_entity_id: i64,
    pub runtime_entity_id: u64,
    pub gamemode: i32,
    pub position: [f32; 3],
    pub rotation: [f32; 2],
    pub seed: i32,
    pub dimension_id: i32,
    pub trailing: Bytes,
}

impl StartGame {
    pub fn decode(packet: &Packet) -> Result<Self, WireError> {
        let mut r = packet.reader_for(START_GAME)?;
        Ok(Self {
            unique_entity_id: r.zigzag64()?,
            runtime_entity_id: r.varuint64()?,
            gamemode: r.zigzag32()?,
            position: [r.f32_le()?, r.f32_le()?, r.f32_le()?],
            rotation: [r.f32_le()?, r.f32_le()?],
            seed: r.zigzag32()?,
            dimension_id: r.zigzag32()?,
            trailing: Bytes::copy_from_slice(r.rest()),
        })
    }

    pub fn encode(&self) -> Packet {
        let mut p = BytesMut::new();
        put_zigzag64(&mut p, self.unique_entity_id);
        put_varuint64(&mut p, self.runtime_entity_id);
        put_zigzag32(&mut p, self.gamemode);
        for v in self.position.iter().chain(self.rotation.iter()) {
            p.put_f32_le(*v);
        }
        put_zigzag32(&mut p, self.seed);
        put_zigzag32(&mut p, self.dimension_id);
        p.put_slice(&self.trailing);
        Packet::new(START_GAME, &p)
    }
}

/// 0x3d.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDimension {
    pub dimension_id: i32,
    pub position: [f32; 3],
    pub respawn: bool,
}

impl ChangeDimension {
    pub fn decode(packet: &Packet) -> Result<Self, WireError> {
        let mut r = packet.reader_for(CHANGE_DIMENSION)?;
        Ok(Self {
            dimension_id: r.zigzag32()?,
            position: [r.f32_le()?, r.f32_le()?, r.f32_le()?],
            respawn: r.bool()?,
        })
    }

    pub fn encode(&self) -> Packet {
        let mut p = BytesMut::new();
        put_zigzag32(&mut p, self.dimension_id);
        for v in self.position {
            p.put_f32_le(v);
        }
        p.put_u8(self.respawn as u8);
        Packet::new(CHANGE_DIMENSION, &p)
    }
}

// ── Primitive codecs ──────────────────────────────────────────────────────────

pub fn put_varuint32(dst: &mut BytesMut, mut v: u32) {
    while v >= 0x80 {
        dst.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    dst.put_u8(v as u8);
}

pub fn put_varuint64(dst: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        dst.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    dst.put_u8(v as u8);
}

pub fn put_zigzag32(dst: &mut BytesMut, v: i32) {
    put_varuint32(dst, ((v << 1) ^ (v >> 31)) as u32);
}

pub fn put_zigzag64(dst: &mut BytesMut, v: i64) {
    put_varuint64(dst, ((v << 1) ^ (v >> 63)) as u64);
}

pub fn put_string(dst: &mut BytesMut, s: &str) {
    put_varuint32(dst, s.len() as u32);
    dst.put_slice(s.as_bytes());
}

/// Bounds-checked cursor over a payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    pub fn u32_le(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32_be(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn f32_le(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn varuint32(&mut self) -> Result<u32, WireError> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let b = self.u8()?;
            value |= ((b & 0x7f) as u32) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarIntTooLong)
    }

    pub fn varuint64(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        for shift in (0..70).step_by(7) {
            let b = self.u8()?;
            value |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarIntTooLong)
    }

    pub fn zigzag32(&mut self) -> Result<i32, WireError> {
        let v = self.varuint32()?;
        Ok(((v >> 1) as i32) ^ -((v & 1) as i32))
    }

    pub fn zigzag64(&mut self) -> Result<i64, WireError> {
        let v = self.varuint64()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.varuint32()? as usize;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| WireError::InvalidUtf8)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("varint is too long")]
    VarIntTooLong,

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("expected packet {expected:#04x}, got {actual:#04x}")]
    UnexpectedPacketId { expected: u32, actual: u32 },
}
