//! Fixed-capacity packet buffer pool.
//!
//! All backing storage is allocated once in [`PacketPool::new`]; afterwards
//! buffers are only handed out and returned. Each buffer is addressed by a
//! [`BufferRef`], a `Copy` handle combining the slot index with a generation
//! counter. The generation is bumped on every free, so a handle that outlives
//! its buffer never matches the slot's next occupant and a double free is
//! detected instead of corrupting the free list.
//!
//! # Example
//!
//! ```
//! use lowpan_frag::buffer::{BufferKind, PacketPool};
//! use lowpan_frag::config::PoolConfig;
//!
//! let mut pool = PacketPool::new(PoolConfig::default()).unwrap();
//! let buf = pool.allocate(BufferKind::Frame).unwrap();
//! pool.get_mut(buf).unwrap().set_payload(&[1, 2, 3]).unwrap();
//! assert_eq!(pool.get(buf).unwrap().payload(), &[1, 2, 3]);
//!
//! pool.free(buf).unwrap();
//! assert!(pool.free(buf).is_err()); // double free
//! ```

use crate::config::{ConfigError, PoolConfig};

/// Capacity class of a pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Holds a single radio frame.
    Frame,
    /// Holds a whole reassembled datagram.
    Large,
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame => write!(f, "frame"),
            Self::Large => write!(f, "large"),
        }
    }
}

/// Handle to a buffer owned by a [`PacketPool`].
///
/// Equality is identity: two handles are equal only if they name the same
/// slot during the same allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef {
    slot: u16,
    generation: u32,
}

impl BufferRef {
    /// Slot index inside the pool.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl std::fmt::Display for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}.{}", self.slot, self.generation)
    }
}

/// Errors from pool operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The handle does not name a currently allocated buffer.
    StaleBuffer(BufferRef),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleBuffer(buf) => write!(f, "{} is not allocated", buf),
        }
    }
}

impl std::error::Error for PoolError {}

/// Errors from packet window manipulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Not enough room after the payload start.
    NoRoom {
        /// Bytes requested.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// Not enough headroom to prepend a header.
    NoHeadroom {
        /// Bytes requested.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// Tried to strip more bytes than the payload holds.
    Underflow {
        /// Bytes requested.
        needed: usize,
        /// Payload length.
        len: usize,
    },
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRoom { needed, available } => {
                write!(f, "packet has room for {} bytes, needed {}", available, needed)
            }
            Self::NoHeadroom { needed, available } => {
                write!(f, "packet has {} bytes of headroom, needed {}", available, needed)
            }
            Self::Underflow { needed, len } => {
                write!(f, "cannot strip {} bytes from a {}-byte payload", needed, len)
            }
        }
    }
}

impl std::error::Error for PacketError {}

/// A pool buffer: fixed backing storage with a movable payload window.
///
/// The window starts after `headroom` bytes so lower layers can prepend
/// headers without copying the payload.
#[derive(Debug)]
pub struct Packet {
    data: Box<[u8]>,
    headroom: usize,
    head: usize,
    len: usize,
    /// Set on buffers that carry a 6LoWPAN fragment.
    pub is_fragment: bool,
    /// Set on datagrams produced by reassembly.
    pub from_reassembly: bool,
}

impl Packet {
    fn new(capacity: usize, headroom: usize) -> Self {
        Self {
            data: vec![0u8; headroom + capacity].into_boxed_slice(),
            headroom,
            head: headroom,
            len: 0,
            is_fragment: false,
            from_reassembly: false,
        }
    }

    fn reset(&mut self) {
        self.head = self.headroom;
        self.len = 0;
        self.is_fragment = false;
        self.from_reassembly = false;
    }

    /// The payload window.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    /// The payload window, mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.head + self.len]
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes the payload may grow to from its current start.
    pub fn room(&self) -> usize {
        self.data.len() - self.head
    }

    /// Bytes available in front of the payload.
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Replace the payload with `bytes`.
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        self.set_len(bytes.len())?;
        self.payload_mut().copy_from_slice(bytes);
        Ok(())
    }

    /// Resize the payload window. New bytes keep whatever the buffer held.
    pub fn set_len(&mut self, len: usize) -> Result<(), PacketError> {
        if len > self.room() {
            return Err(PacketError::NoRoom {
                needed: len,
                available: self.room(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Grow the payload at the front by `n` bytes and return the new bytes.
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8], PacketError> {
        if n > self.head {
            return Err(PacketError::NoHeadroom {
                needed: n,
                available: self.head,
            });
        }
        self.head -= n;
        self.len += n;
        Ok(&mut self.data[self.head..self.head + n])
    }

    /// Drop `n` bytes from the front of the payload.
    pub fn strip(&mut self, n: usize) -> Result<(), PacketError> {
        if n > self.len {
            return Err(PacketError::Underflow {
                needed: n,
                len: self.len,
            });
        }
        self.head += n;
        self.len -= n;
        Ok(())
    }
}

#[derive(Debug)]
struct Slot {
    kind: BufferKind,
    generation: u32,
    allocated: bool,
    packet: Packet,
}

/// Fixed-capacity pool of frame and large buffers.
pub struct PacketPool {
    config: PoolConfig,
    slots: Vec<Slot>,
    free_frames: Vec<u16>,
    free_large: Vec<u16>,
}

impl PacketPool {
    /// Create a pool, allocating all backing storage up front.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let total = config.frame_buffers + config.large_buffers;
        let mut slots = Vec::with_capacity(total);
        for _ in 0..config.frame_buffers {
            slots.push(Slot {
                kind: BufferKind::Frame,
                generation: 0,
                allocated: false,
                packet: Packet::new(config.frame_capacity, config.headroom),
            });
        }
        for _ in 0..config.large_buffers {
            slots.push(Slot {
                kind: BufferKind::Large,
                generation: 0,
                allocated: false,
                packet: Packet::new(config.large_capacity, config.headroom),
            });
        }
        // Reverse so the lowest slot index is handed out first.
        let free_frames = (0..config.frame_buffers as u16).rev().collect();
        let free_large = (config.frame_buffers as u16..total as u16).rev().collect();
        Ok(Self {
            config,
            slots,
            free_frames,
            free_large,
        })
    }

    /// Take a free buffer of the given kind, or `None` if exhausted.
    pub fn allocate(&mut self, kind: BufferKind) -> Option<BufferRef> {
        let slot = self.free_list(kind).pop()?;
        let entry = &mut self.slots[slot as usize];
        entry.allocated = true;
        entry.packet.reset();
        Some(BufferRef {
            slot,
            generation: entry.generation,
        })
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, buf: BufferRef) -> Result<(), PoolError> {
        let kind = {
            let entry = self.slot_mut(buf).ok_or(PoolError::StaleBuffer(buf))?;
            entry.allocated = false;
            entry.generation = entry.generation.wrapping_add(1);
            entry.kind
        };
        self.free_list(kind).push(buf.slot);
        Ok(())
    }

    /// Borrow an allocated buffer.
    pub fn get(&self, buf: BufferRef) -> Option<&Packet> {
        self.slots
            .get(buf.slot())
            .filter(|s| s.allocated && s.generation == buf.generation)
            .map(|s| &s.packet)
    }

    /// Mutably borrow an allocated buffer.
    pub fn get_mut(&mut self, buf: BufferRef) -> Option<&mut Packet> {
        self.slot_mut(buf).map(|s| &mut s.packet)
    }

    /// Borrow two distinct allocated buffers, the first shared and the
    /// second mutable.
    ///
    /// Used to copy between buffers of the same pool.
    pub fn pair_mut(&mut self, src: BufferRef, dst: BufferRef) -> Option<(&Packet, &mut Packet)> {
        if src.slot == dst.slot || !self.is_allocated(src) || !self.is_allocated(dst) {
            return None;
        }
        let (s, d) = (src.slot(), dst.slot());
        if s < d {
            let (lo, hi) = self.slots.split_at_mut(d);
            Some((&lo[s].packet, &mut hi[0].packet))
        } else {
            let (lo, hi) = self.slots.split_at_mut(s);
            Some((&hi[0].packet, &mut lo[d].packet))
        }
    }

    /// Whether `buf` names a currently allocated buffer.
    pub fn is_allocated(&self, buf: BufferRef) -> bool {
        self.get(buf).is_some()
    }

    /// Kind of an allocated buffer.
    pub fn kind_of(&self, buf: BufferRef) -> Option<BufferKind> {
        self.slots
            .get(buf.slot())
            .filter(|s| s.allocated && s.generation == buf.generation)
            .map(|s| s.kind)
    }

    /// Number of free buffers of a kind.
    pub fn free_count(&self, kind: BufferKind) -> usize {
        match kind {
            BufferKind::Frame => self.free_frames.len(),
            BufferKind::Large => self.free_large.len(),
        }
    }

    /// Number of allocated buffers of a kind.
    pub fn in_use(&self, kind: BufferKind) -> usize {
        self.capacity(kind) - self.free_count(kind)
    }

    /// Total number of buffers of a kind.
    pub fn capacity(&self, kind: BufferKind) -> usize {
        match kind {
            BufferKind::Frame => self.config.frame_buffers,
            BufferKind::Large => self.config.large_buffers,
        }
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slot_mut(&mut self, buf: BufferRef) -> Option<&mut Slot> {
        self.slots
            .get_mut(buf.slot())
            .filter(|s| s.allocated && s.generation == buf.generation)
    }

    fn free_list(&mut self, kind: BufferKind) -> &mut Vec<u16> {
        match kind {
            BufferKind::Frame => &mut self.free_frames,
            BufferKind::Large => &mut self.free_large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> PacketPool {
        PacketPool::new(PoolConfig {
            frame_buffers: 2,
            large_buffers: 1,
            frame_capacity: 16,
            large_capacity: 64,
            headroom: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = small_pool();
        assert!(pool.allocate(BufferKind::Frame).is_some());
        assert!(pool.allocate(BufferKind::Frame).is_some());
        assert!(pool.allocate(BufferKind::Frame).is_none());
        assert_eq!(pool.free_count(BufferKind::Frame), 0);

        // Large class is independent
        assert!(pool.allocate(BufferKind::Large).is_some());
        assert!(pool.allocate(BufferKind::Large).is_none());
    }

    #[test]
    fn test_free_returns_capacity() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        assert_eq!(pool.in_use(BufferKind::Frame), 1);
        pool.free(buf).unwrap();
        assert_eq!(pool.in_use(BufferKind::Frame), 0);
        assert_eq!(pool.free_count(BufferKind::Frame), 2);
    }

    #[test]
    fn test_double_free_detected() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        pool.free(buf).unwrap();
        assert_eq!(pool.free(buf), Err(PoolError::StaleBuffer(buf)));
        assert_eq!(pool.free_count(BufferKind::Frame), 2);
    }

    #[test]
    fn test_reused_slot_gets_new_identity() {
        let mut pool = PacketPool::new(PoolConfig {
            frame_buffers: 1,
            large_buffers: 0,
            ..Default::default()
        })
        .unwrap();
        let first = pool.allocate(BufferKind::Frame).unwrap();
        pool.free(first).unwrap();
        let second = pool.allocate(BufferKind::Frame).unwrap();

        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(pool.get(first).is_none());
        assert!(pool.get(second).is_some());
    }

    #[test]
    fn test_allocated_buffer_is_reset() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        {
            let packet = pool.get_mut(buf).unwrap();
            packet.set_payload(&[9; 8]).unwrap();
            packet.is_fragment = true;
        }
        pool.free(buf).unwrap();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        let packet = pool.get(buf).unwrap();
        assert!(packet.is_empty());
        assert!(!packet.is_fragment);
        assert_eq!(packet.headroom(), 4);
    }

    #[test]
    fn test_prepend_and_strip() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        let packet = pool.get_mut(buf).unwrap();
        packet.set_payload(&[1, 2, 3]).unwrap();

        packet.prepend(2).unwrap().copy_from_slice(&[0xAA, 0xBB]);
        assert_eq!(packet.payload(), &[0xAA, 0xBB, 1, 2, 3]);

        packet.strip(2).unwrap();
        assert_eq!(packet.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_prepend_beyond_headroom_fails() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        let packet = pool.get_mut(buf).unwrap();
        assert_eq!(
            packet.prepend(5).err(),
            Some(PacketError::NoHeadroom {
                needed: 5,
                available: 4
            })
        );
    }

    #[test]
    fn test_set_payload_too_large_fails() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        let packet = pool.get_mut(buf).unwrap();
        assert!(matches!(
            packet.set_payload(&[0; 17]),
            Err(PacketError::NoRoom { needed: 17, .. })
        ));
        assert!(packet.set_payload(&[0; 16]).is_ok());
    }

    #[test]
    fn test_strip_underflow() {
        let mut pool = small_pool();
        let buf = pool.allocate(BufferKind::Frame).unwrap();
        let packet = pool.get_mut(buf).unwrap();
        packet.set_payload(&[1]).unwrap();
        assert_eq!(
            packet.strip(2),
            Err(PacketError::Underflow { needed: 2, len: 1 })
        );
    }

    #[test]
    fn test_pair_mut_copies_between_buffers() {
        let mut pool = small_pool();
        let src = pool.allocate(BufferKind::Frame).unwrap();
        let dst = pool.allocate(BufferKind::Large).unwrap();
        pool.get_mut(src).unwrap().set_payload(&[4, 5, 6]).unwrap();

        let (from, to) = pool.pair_mut(src, dst).unwrap();
        to.set_payload(from.payload()).unwrap();
        assert_eq!(pool.get(dst).unwrap().payload(), &[4, 5, 6]);

        // Reverse slot order works too
        let (from, to) = pool.pair_mut(dst, src).unwrap();
        to.set_payload(&from.payload()[..1]).unwrap();
        assert_eq!(pool.get(src).unwrap().payload(), &[4]);
    }

    #[test]
    fn test_pair_mut_rejects_same_or_stale() {
        let mut pool = small_pool();
        let a = pool.allocate(BufferKind::Frame).unwrap();
        let b = pool.allocate(BufferKind::Frame).unwrap();
        assert!(pool.pair_mut(a, a).is_none());
        pool.free(b).unwrap();
        assert!(pool.pair_mut(a, b).is_none());
    }

    #[test]
    fn test_kind_of() {
        let mut pool = small_pool();
        let frame = pool.allocate(BufferKind::Frame).unwrap();
        let large = pool.allocate(BufferKind::Large).unwrap();
        assert_eq!(pool.kind_of(frame), Some(BufferKind::Frame));
        assert_eq!(pool.kind_of(large), Some(BufferKind::Large));
        pool.free(large).unwrap();
        assert_eq!(pool.kind_of(large), None);
    }
}
