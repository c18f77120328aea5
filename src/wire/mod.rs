//! Wire-level framing: the stateful frame parser, the command encoder, and the
//! transparent per-connection compression wrappers.

pub mod codec;
pub mod compression;

pub use codec::{CodecError, Frame, FrameType, Message, Reader};
pub use compression::CompressedReader;
