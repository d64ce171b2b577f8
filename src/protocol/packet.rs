//! Packet encoding and decoding.
//!
//! A packet is a fixed-size byte buffer with a single read/write cursor.
//! The cursor starts just past the length header for both directions:
//!
//! ```text
//! offset 0..3  : u32 LE  total frame length (header + type + payload)
//! offset 4     : u8      packet type
//! offset 5..   : payload (little-endian numbers, u16-length-prefixed strings)
//! ```
//!
//! Outbound packets are filled with `push_*` calls and sealed with
//! `record_length` right before they are queued. Inbound packets wrap one
//! reassembled frame; the first read is always the type byte.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Size of the little-endian length header at the start of every frame.
pub const HEADER_SIZE: usize = 4;

/// Smallest frame that can be valid: a header plus the type byte.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;

/// Kind of frame carried on the wire.
///
/// Values 1-3 are consumed by the connection itself; only `UserMessage`
/// frames reach the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Liveness probe sent by the initiating side.
    HeartbeatRequest = 1,
    /// Reply to a `HeartbeatRequest`.
    HeartbeatAck = 2,
    /// Remote asks for a graceful close.
    DisconnectSignal = 3,
    /// Application payload.
    UserMessage = 4,
}

impl PacketType {
    /// Whether the type is reserved for connection housekeeping.
    pub fn is_system(self) -> bool {
        !matches!(self, PacketType::UserMessage)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::HeartbeatRequest),
            2 => Ok(PacketType::HeartbeatAck),
            3 => Ok(PacketType::DisconnectSignal),
            4 => Ok(PacketType::UserMessage),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// Errors raised while reading an inbound packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// A frame under construction or being read.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: BytesMut,
    position: usize,
}

impl Packet {
    /// Create an empty outbound packet backed by `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` cannot hold a header and a type byte.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= MIN_FRAME_SIZE,
            "packet capacity {capacity} is smaller than a frame header"
        );
        Self {
            buf: BytesMut::zeroed(capacity),
            position: HEADER_SIZE,
        }
    }

    /// Create an outbound application packet with its type byte written.
    pub fn user_message(capacity: usize) -> Self {
        let mut packet = Self::new(capacity);
        packet.push_byte(PacketType::UserMessage as u8);
        packet
    }

    /// Create a payload-less system packet.
    pub fn system(kind: PacketType) -> Self {
        let mut packet = Self::new(MIN_FRAME_SIZE);
        packet.push_byte(kind as u8);
        packet
    }

    /// Wrap a reassembled inbound frame. The cursor is placed past the header.
    pub fn from_frame(frame: BytesMut) -> Self {
        Self {
            buf: frame,
            position: HEADER_SIZE,
        }
    }

    /// Current cursor offset.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes left to read (inbound) or room left to write (outbound).
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.position)
    }

    /// The bytes up to the cursor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.position]
    }

    // Write side

    fn put(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        assert!(
            end <= self.buf.len(),
            "packet overflow: writing {} bytes at offset {} of {}",
            bytes.len(),
            self.position,
            self.buf.len()
        );
        self.buf[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    /// Append one byte.
    ///
    /// # Panics
    /// All `push_*` methods panic when the write would pass the end of the
    /// buffer; sizing packets is the caller's responsibility.
    pub fn push_byte(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub fn push_i16(&mut self, value: i16) {
        self.put(&value.to_le_bytes());
    }

    pub fn push_i32(&mut self, value: i32) {
        self.put(&value.to_le_bytes());
    }

    pub fn push_f32(&mut self, value: f32) {
        self.put(&value.to_le_bytes());
    }

    /// Append a u16-length-prefixed UTF-8 string.
    ///
    /// # Panics
    /// Panics if the encoded string is longer than `u16::MAX` bytes.
    pub fn push_string(&mut self, value: &str) {
        let len = u16::try_from(value.len())
            .unwrap_or_else(|_| panic!("string of {} bytes exceeds u16 length", value.len()));
        self.put(&len.to_le_bytes());
        self.put(value.as_bytes());
    }

    /// Write the cursor position into the header as the frame length.
    ///
    /// Called exactly once, after the last payload write and right before
    /// the packet is queued.
    pub fn record_length(&mut self) {
        let len = self.position as u32;
        self.buf[..HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
    }

    /// Consume the packet, keeping only the written frame bytes.
    pub fn into_frame(mut self) -> Bytes {
        self.buf.truncate(self.position);
        self.buf.freeze()
    }

    // Read side

    fn take<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_slice(&mut self, n: usize) -> Result<&[u8], PacketError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(PacketError::UnexpectedEnd {
                needed: n,
                remaining,
            });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.buf[start..start + n])
    }

    /// Read the type byte of an inbound frame.
    pub fn pop_packet_type(&mut self) -> Result<PacketType, PacketError> {
        PacketType::try_from(self.pop_byte()?)
    }

    pub fn pop_byte(&mut self) -> Result<u8, PacketError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn pop_i16(&mut self) -> Result<i16, PacketError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub fn pop_i32(&mut self) -> Result<i32, PacketError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub fn pop_f32(&mut self) -> Result<f32, PacketError> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn pop_string(&mut self) -> Result<String, PacketError> {
        let len = u16::from_le_bytes(self.take()?) as usize;
        let bytes = self.take_slice(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| PacketError::InvalidUtf8)
    }
}
