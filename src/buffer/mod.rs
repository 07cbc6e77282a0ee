//! Packet buffer pool.
//!
//! The stack never allocates packet memory after start-up. Every frame and
//! every reassembled datagram lives in a buffer taken from [`PacketPool`] and
//! is returned to it exactly once.

mod pool;

pub use pool::{BufferKind, BufferRef, Packet, PacketError, PacketPool, PoolError};
