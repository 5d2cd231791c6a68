//! Protocol module containing message types, the line codec and the sequence counter.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_command, decode_reply, encode_command, encode_reply, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
