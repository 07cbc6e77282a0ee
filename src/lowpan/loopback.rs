//! In-memory layer implementations.
//!
//! Host-side stand-ins for the MAC layer, the header-compression layer and
//! the bridge. They record what the engine hands them, which makes them
//! useful for tests and for the simulation binary.

use super::engine::release;
use super::layers::{Bridge, LinkError, LinkLayer, NetworkLayer, Outcome, PeekedHeader};
use crate::buffer::{BufferKind, BufferRef, PacketPool};
use std::collections::VecDeque;
use std::net::Ipv6Addr;

/// Link layer that queues submitted frames in memory.
///
/// Frames stay queued until popped; the caller plays the radio and reports
/// each one back through `on_fragment_sent`.
#[derive(Debug)]
pub struct LoopbackLink {
    queue: VecDeque<BufferRef>,
    capacity: usize,
    attempts: usize,
    fail_on: Option<usize>,
}

impl LoopbackLink {
    /// Create a link whose transmit queue holds `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            attempts: 0,
            fail_on: None,
        }
    }

    /// Refuse the submission with the given zero-based attempt number.
    pub fn fail_on_attempt(&mut self, attempt: usize) {
        self.fail_on = Some(attempt);
    }

    /// Number of queued frames.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Take the oldest queued frame.
    pub fn pop(&mut self) -> Option<BufferRef> {
        self.queue.pop_front()
    }

    /// Number of submissions seen, accepted or not.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl LinkLayer for LoopbackLink {
    fn submit(&mut self, _pool: &mut PacketPool, frame: BufferRef) -> Result<(), LinkError> {
        let attempt = self.attempts;
        self.attempts += 1;
        if self.fail_on == Some(attempt) {
            return Err(LinkError::Rejected("injected failure"));
        }
        if self.queue.len() >= self.capacity {
            return Err(LinkError::QueueFull);
        }
        self.queue.push_back(frame);
        Ok(())
    }
}

/// A datagram handed up to [`RecordingNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Datagram bytes.
    pub bytes: Vec<u8>,
    /// Whether the datagram came out of reassembly.
    pub from_reassembly: bool,
}

/// Network layer that records deliveries and completions.
///
/// Received datagrams are copied out and their buffers released.
/// Completed datagrams are released as well. Destinations are peeked by
/// reading the first 16 bytes of the compressed header as an IPv6 address.
#[derive(Debug, Default)]
pub struct RecordingNetwork {
    /// Datagrams received, in order.
    pub delivered: Vec<Delivered>,
    /// Send completions, in order.
    pub completions: Vec<(BufferRef, Outcome)>,
}

impl RecordingNetwork {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetworkLayer for RecordingNetwork {
    fn peek_destination(&self, compressed: &[u8]) -> Option<PeekedHeader> {
        let octets: [u8; 16] = compressed.get(..16)?.try_into().ok()?;
        Some(PeekedHeader {
            destination: Ipv6Addr::from(octets),
            header_len: 16,
        })
    }

    fn receive(&mut self, pool: &mut PacketPool, datagram: BufferRef) {
        if let Some(packet) = pool.get(datagram) {
            self.delivered.push(Delivered {
                bytes: packet.payload().to_vec(),
                from_reassembly: packet.from_reassembly,
            });
        }
        release(pool, datagram);
    }

    fn send_done(&mut self, pool: &mut PacketPool, datagram: BufferRef, outcome: Outcome) {
        self.completions.push((datagram, outcome));
        release(pool, datagram);
    }
}

/// Bridge that records the raw frames it is handed.
#[derive(Debug, Default)]
pub struct RecordingBridge {
    /// Raw frames forwarded, header included.
    pub forwarded: Vec<Vec<u8>>,
}

impl RecordingBridge {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bridge for RecordingBridge {
    fn forward(&mut self, pool: &mut PacketPool, frame: BufferRef) {
        if let Some(packet) = pool.get(frame) {
            self.forwarded.push(packet.payload().to_vec());
        }
        release(pool, frame);
    }
}

/// Copy a frame into a fresh frame buffer, as a radio hop would.
///
/// Returns `None` if the pool has no frame buffer left.
pub fn copy_frame(pool: &mut PacketPool, frame: BufferRef) -> Option<BufferRef> {
    let copy = pool.allocate(BufferKind::Frame)?;
    let copied = match pool.pair_mut(frame, copy) {
        Some((src, dst)) => dst.set_payload(src.payload()).is_ok(),
        None => false,
    };
    if !copied {
        release(pool, copy);
        return None;
    }
    Some(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[test]
    fn test_link_queue_full() {
        let mut pool = PacketPool::new(PoolConfig::default()).unwrap();
        let mut link = LoopbackLink::new(1);
        let a = pool.allocate(BufferKind::Frame).unwrap();
        let b = pool.allocate(BufferKind::Frame).unwrap();
        assert!(link.submit(&mut pool, a).is_ok());
        assert_eq!(link.submit(&mut pool, b), Err(LinkError::QueueFull));
        assert_eq!(link.attempts(), 2);
    }

    #[test]
    fn test_link_injected_failure_is_one_shot() {
        let mut pool = PacketPool::new(PoolConfig::default()).unwrap();
        let mut link = LoopbackLink::new(4);
        link.fail_on_attempt(0);
        let a = pool.allocate(BufferKind::Frame).unwrap();
        assert!(link.submit(&mut pool, a).is_err());
        assert!(link.submit(&mut pool, a).is_ok());
        assert_eq!(link.pop(), Some(a));
    }

    #[test]
    fn test_peek_reads_destination() {
        let net = RecordingNetwork::new();
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut bytes = addr.octets().to_vec();
        bytes.push(0xFF);
        assert_eq!(net.peek_destination(&bytes).unwrap().destination, addr);
        assert!(net.peek_destination(&bytes[..15]).is_none());
    }

    #[test]
    fn test_copy_frame() {
        let mut pool = PacketPool::new(PoolConfig::default()).unwrap();
        let a = pool.allocate(BufferKind::Frame).unwrap();
        pool.get_mut(a).unwrap().set_payload(&[1, 2, 3]).unwrap();
        let b = copy_frame(&mut pool, a).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.get(b).unwrap().payload(), &[1, 2, 3]);
    }
}
