//! Wire protocol of the depot file service: message enums, MessagePack
//! encoding and length-delimited framing.

pub mod framing;
pub mod proto;

pub use proto::*;
