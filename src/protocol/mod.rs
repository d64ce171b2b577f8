//! Wire protocol: packet layout and frame reassembly.

pub mod codec;
pub mod packet;

pub use codec::{FrameCodec, FrameError};
pub use packet::{Packet, PacketError, PacketType, HEADER_SIZE, MIN_FRAME_SIZE};
