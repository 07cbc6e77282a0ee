//! 6LoWPAN fragmentation library.
//!
//! This library fragments IPv6 datagrams into IEEE 802.15.4 frames and
//! reassembles them on the receiving side. It is platform-independent and
//! allocates all of its buffers up front, so the same code runs on a
//! constrained node and under test on the host machine.

pub mod buffer;
pub mod config;
pub mod lowpan;

// Re-export commonly used items
pub use buffer::{BufferKind, BufferRef, Packet, PacketPool};
pub use config::{ConfigError, FragConfig, PoolConfig};
pub use lowpan::{
    Bridge, FragEngine, FragError, FragStats, LinkLayer, NetworkLayer, NoBridge, Outcome,
    RxOutcome,
};
