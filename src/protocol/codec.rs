//! Frame reassembly.
//!
//! TCP delivers a byte stream, so one read may hold half a frame, exactly one
//! frame, or several frames back to back. `FrameCodec` copies incoming bytes
//! into a fixed-size buffer in two phases:
//!
//! 1. header phase: accumulate `HEADER_SIZE` bytes and decode the length `L`
//! 2. body phase: accumulate until `L` bytes (header included) are buffered
//!
//! A completed frame is handed to the caller, the codec resets to the header
//! phase and keeps consuming the rest of the chunk. A chunk that ends
//! mid-phase leaves the state in place for the next call.

use bytes::BytesMut;
use thiserror::Error;

use super::packet::{HEADER_SIZE, MIN_FRAME_SIZE};

/// A declared frame length the codec refuses to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("declared frame length {declared} exceeds buffer capacity {capacity}")]
    TooLarge { declared: usize, capacity: usize },
    #[error("declared frame length {declared} is smaller than a minimal frame")]
    TooSmall { declared: usize },
}

/// Reassembles length-prefixed frames from arbitrary chunks.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: Box<[u8]>,
    /// Bytes of the current frame buffered so far.
    position: usize,
    /// Bytes the current phase needs in total.
    target: usize,
}

impl FrameCodec {
    /// Create a codec whose largest accepted frame is `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` cannot hold a minimal frame.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= MIN_FRAME_SIZE,
            "codec capacity {capacity} is smaller than a minimal frame"
        );
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            target: HEADER_SIZE,
        }
    }

    /// Largest frame this codec will assemble.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// True when no frame is partially assembled.
    pub fn is_idle(&self) -> bool {
        self.position == 0
    }

    /// Feed one chunk of stream bytes, calling `on_frame` for every frame
    /// completed by it, in stream order.
    ///
    /// On error the partial state is discarded; frames completed earlier in
    /// the same chunk have already been delivered.
    pub fn feed<F>(&mut self, mut chunk: &[u8], mut on_frame: F) -> Result<(), FrameError>
    where
        F: FnMut(BytesMut),
    {
        while !chunk.is_empty() {
            if self.position < HEADER_SIZE {
                self.target = HEADER_SIZE;
                if !self.read_until_target(&mut chunk) {
                    break;
                }

                let declared = self.declared_length();
                if declared < MIN_FRAME_SIZE {
                    self.stop();
                    return Err(FrameError::TooSmall { declared });
                }
                if declared > self.buffer.len() {
                    self.stop();
                    return Err(FrameError::TooLarge {
                        declared,
                        capacity: self.buffer.len(),
                    });
                }
                self.target = declared;
            }

            if !self.read_until_target(&mut chunk) {
                break;
            }

            on_frame(BytesMut::from(&self.buffer[..self.target]));
            self.stop();
        }

        Ok(())
    }

    /// Drop any partially assembled frame and return to the header phase.
    ///
    /// Holding `&mut self` means no `feed` is running, so this is the
    /// quiescence point used during connection teardown.
    pub fn stop(&mut self) {
        self.position = 0;
        self.target = HEADER_SIZE;
    }

    /// Copy from `chunk` until the phase target is reached or the chunk is
    /// spent. Returns whether the target was reached.
    fn read_until_target(&mut self, chunk: &mut &[u8]) -> bool {
        let wanted = self.target - self.position;
        let n = wanted.min(chunk.len());
        self.buffer[self.position..self.position + n].copy_from_slice(&chunk[..n]);
        self.position += n;
        *chunk = &chunk[n..];
        self.position == self.target
    }

    fn declared_length(&self) -> usize {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buffer[..HEADER_SIZE]);
        u32::from_le_bytes(header) as usize
    }
}
