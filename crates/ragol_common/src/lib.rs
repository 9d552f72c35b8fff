//! Shared protocol pieces for the Ragol ship server: client version tags,
//! the wire codecs and stream ciphers, the deterministic RNG used by blocks,
//! PRS decompression, the item model and the shipgate frame format.

pub mod codec;
pub mod crypt;
pub mod item;
pub mod packets;
pub mod prs;
pub mod rng;
pub mod shipgate;
pub mod text;
pub mod version;

pub use item::ItemData;
pub use version::Version;

/// Shipgate protocol revision we speak. See `shipgate`.
pub const SHIPGATE_PROTO_VER: u32 = 19;
