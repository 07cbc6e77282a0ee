//! Fragmentation engine state.
//!
//! [`FragEngine`] is the single context object for the fragmentation layer.
//! It owns the tag counter, the bridging state and both slot tables; the
//! send path lives in `fragmenter.rs` and the receive path in
//! `reassembler.rs`, both as further `impl FragEngine` blocks.
//!
//! # Example
//!
//! ```
//! use lowpan_frag::buffer::{BufferKind, PacketPool};
//! use lowpan_frag::config::{FragConfig, PoolConfig};
//! use lowpan_frag::lowpan::loopback::{LoopbackLink, RecordingNetwork};
//! use lowpan_frag::lowpan::{FragEngine, Outcome};
//!
//! let mut pool = PacketPool::new(PoolConfig::default()).unwrap();
//! let mut engine = FragEngine::new(FragConfig::default(), 0x100).unwrap();
//! let mut link = LoopbackLink::new(16);
//! let mut net = RecordingNetwork::new();
//!
//! let datagram = pool.allocate(BufferKind::Large).unwrap();
//! pool.get_mut(datagram).unwrap().set_payload(&[0xAB; 200]).unwrap();
//! engine.fragment_and_send(&mut pool, &mut link, datagram).unwrap();
//! assert_eq!(link.pending(), 3);
//!
//! while let Some(frame) = link.pop() {
//!     engine.on_fragment_sent(&mut pool, &mut net, frame, Outcome::Success).unwrap();
//! }
//! assert_eq!(net.completions, vec![(datagram, Outcome::Success)]);
//! ```

use super::header::Dispatch;
use super::stats::FragStats;
use super::table::SlotTable;
use crate::buffer::{BufferRef, PacketPool};
use crate::config::{ConfigError, FragConfig};
use log::{info, warn};
use rand_core::{OsRng, RngCore};

/// One in-flight outbound fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundFragment {
    /// Header type the fragment carries.
    pub dispatch: Dispatch,
    /// Size of the whole datagram in bytes.
    pub datagram_size: u16,
    /// Tag shared by all fragments of the datagram.
    pub datagram_tag: u16,
    /// Position of this fragment in 8-byte units.
    pub datagram_offset: u8,
    /// Datagram bytes carried by this fragment.
    pub fragment_length: u16,
    /// Set once any fragment of the datagram failed to send.
    pub tx_failed: bool,
    /// Set when the datagram was aborted and its failure already reported
    /// to the caller; no completion is raised for it.
    pub aborted: bool,
    /// Frame buffer holding header and payload.
    pub buffer: BufferRef,
    /// The unfragmented datagram (not owned).
    pub original: BufferRef,
}

/// One fragment waiting for the rest of its datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyEntry {
    /// Header type the fragment arrived with.
    pub dispatch: Dispatch,
    /// Size of the whole datagram in bytes.
    pub datagram_size: u16,
    /// Tag shared by all fragments of the datagram.
    pub datagram_tag: u16,
    /// Position of this fragment in 8-byte units.
    pub datagram_offset: u8,
    /// Datagram bytes carried by this fragment.
    pub fragment_length: u16,
    /// Frame buffer holding the payload (header already stripped).
    pub buffer: BufferRef,
}

/// Which inbound datagram, if any, is being bridged without reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectForward {
    /// No datagram is being bridged.
    #[default]
    Idle,
    /// Fragments with this tag go straight to the bridge.
    Tag(u16),
}

/// The 6LoWPAN fragmentation and reassembly engine.
#[derive(Debug)]
pub struct FragEngine {
    pub(super) config: FragConfig,
    pub(super) next_tag: u16,
    pub(super) direct_forward: DirectForward,
    pub(super) outbound: SlotTable<OutboundFragment>,
    pub(super) reassembly: SlotTable<ReassemblyEntry>,
    pub(super) stats: FragStats,
}

impl FragEngine {
    /// Create an engine whose first datagram tag is `initial_tag`.
    pub fn new(config: FragConfig, initial_tag: u16) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "6LoWPAN fragmentation: {} bytes/fragment, {} outbound / {} reassembly slots{}",
            config.max_fragment_size,
            config.fragment_buffers,
            config.reassembly_buffers,
            if config.is_root { ", border router" } else { "" }
        );
        Ok(Self {
            config,
            next_tag: initial_tag,
            direct_forward: DirectForward::Idle,
            outbound: SlotTable::new(config.fragment_buffers),
            reassembly: SlotTable::new(config.reassembly_buffers),
            stats: FragStats::new(),
        })
    }

    /// Create an engine with a tag counter seeded from the OS RNG.
    pub fn with_random_tag(config: FragConfig) -> Result<Self, ConfigError> {
        Self::new(config, random_tag())
    }

    /// Return to the freshly initialized state.
    ///
    /// Partial datagrams are discarded and their buffers released. Outbound
    /// records are forgotten, but their frames stay with the link layer;
    /// their completions will be reported as missing records and released
    /// then.
    pub fn reset(&mut self, pool: &mut PacketPool, initial_tag: u16) {
        let partial = self
            .reassembly
            .remove_where(|_| true, |entry| release(pool, entry.buffer));
        let outbound = self.outbound.remove_where(|_| true, |_| {});
        if partial > 0 || outbound > 0 {
            warn!(
                "Reset discarded {} reassembly and {} outbound records",
                partial, outbound
            );
        }
        self.next_tag = initial_tag;
        self.direct_forward = DirectForward::Idle;
    }

    /// The configuration this engine runs with.
    pub fn config(&self) -> &FragConfig {
        &self.config
    }

    /// Tag the next fragmented datagram will carry.
    pub fn next_tag(&self) -> u16 {
        self.next_tag
    }

    /// Current bridging state.
    pub fn direct_forward(&self) -> DirectForward {
        self.direct_forward
    }

    /// Number of outbound fragments in flight.
    pub fn outbound_in_flight(&self) -> usize {
        self.outbound.len()
    }

    /// Number of fragments held for reassembly.
    pub fn reassembly_in_flight(&self) -> usize {
        self.reassembly.len()
    }

    /// Outbound fragment records.
    pub fn outbound_fragments(&self) -> impl Iterator<Item = &OutboundFragment> {
        self.outbound.iter().map(|(_, r)| r)
    }

    /// Reassembly records.
    pub fn reassembly_entries(&self) -> impl Iterator<Item = &ReassemblyEntry> {
        self.reassembly.iter().map(|(_, r)| r)
    }

    /// Cumulative counters.
    pub fn stats(&self) -> &FragStats {
        &self.stats
    }

    /// Post-increment the tag counter.
    pub(super) fn allocate_tag(&mut self) -> u16 {
        let tag = self.next_tag;
        self.next_tag = tag.wrapping_add(1);
        tag
    }
}

/// Draw a random 16-bit tag from the OS RNG.
pub fn random_tag() -> u16 {
    (OsRng.next_u32() & 0xFFFF) as u16
}

/// Return a buffer to the pool, logging instead of failing on a stale handle.
pub(super) fn release(pool: &mut PacketPool, buf: BufferRef) {
    if let Err(e) = pool.free(buf) {
        warn!("Failed to release {}: {}", buf, e);
    }
}
