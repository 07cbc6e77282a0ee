//! Interfaces to the layers around the fragmentation engine.
//!
//! The engine sits between the header-compression layer above and the MAC
//! layer below. It never calls into them on its own: every entry point of
//! [`FragEngine`](super::FragEngine) receives the collaborators it needs as
//! arguments and runs to completion before returning.
//!
//! Buffer ownership moves with the [`BufferRef`]: a handle passed to
//! [`LinkLayer::submit`], [`NetworkLayer::receive`],
//! [`NetworkLayer::send_done`] or [`Bridge::forward`] belongs to the callee
//! from then on.

use crate::buffer::{BufferRef, PacketPool};
use log::warn;
use std::net::Ipv6Addr;

/// Final result of a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The frame (or every fragment of the datagram) was sent.
    Success,
    /// The frame (or at least one fragment of the datagram) was not sent.
    Failure,
}

impl Outcome {
    /// Whether this is [`Outcome::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Synchronous refusal from the link layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The transmit queue is full.
    QueueFull,
    /// The link layer refused the frame for another reason.
    Rejected(&'static str),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "link transmit queue full"),
            Self::Rejected(reason) => write!(f, "link rejected frame: {}", reason),
        }
    }
}

impl std::error::Error for LinkError {}

/// What the header-compression layer learned from peeking at a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeekedHeader {
    /// Final IPv6 destination of the datagram.
    pub destination: Ipv6Addr,
    /// Length of the compressed inner header.
    pub header_len: usize,
}

/// The MAC layer below the engine.
pub trait LinkLayer {
    /// Queue a frame for transmission.
    ///
    /// On `Ok` the link layer owns `frame` and will later report it through
    /// [`FragEngine::on_fragment_sent`](super::FragEngine::on_fragment_sent)
    /// exactly once. On `Err` ownership stays with the caller.
    fn submit(&mut self, pool: &mut PacketPool, frame: BufferRef) -> Result<(), LinkError>;
}

/// The header-compression layer above the engine.
pub trait NetworkLayer {
    /// Decompress just enough of `compressed` to find the final destination.
    fn peek_destination(&self, compressed: &[u8]) -> Option<PeekedHeader>;

    /// Take a complete inbound datagram (reassembled or never fragmented).
    fn receive(&mut self, pool: &mut PacketPool, datagram: BufferRef);

    /// Learn the outcome of a datagram handed to
    /// [`FragEngine::fragment_and_send`](super::FragEngine::fragment_and_send).
    ///
    /// Called once per datagram that was accepted for sending.
    fn send_done(&mut self, pool: &mut PacketPool, datagram: BufferRef, outcome: Outcome);
}

/// Off-mesh output of a border router.
pub trait Bridge {
    /// Forward a raw, still-fragmented frame upstream.
    fn forward(&mut self, pool: &mut PacketPool, frame: BufferRef);
}

/// Bridge for nodes that are not the border router.
///
/// Any frame it is handed is released back to the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBridge;

impl Bridge for NoBridge {
    fn forward(&mut self, pool: &mut PacketPool, frame: BufferRef) {
        warn!("No bridge configured, dropping {}", frame);
        if let Err(e) = pool.free(frame) {
            warn!("Failed to release bridged frame: {}", e);
        }
    }
}
