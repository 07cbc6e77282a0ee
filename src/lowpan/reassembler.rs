//! Inbound path: reassembly and border-router bridging.
//!
//! Every received frame is classified by its dispatch. Frames without a
//! fragmentation header go straight up to the network layer. Fragments are
//! stored in the reassembly table until the byte count for their tag equals
//! the advertised datagram size, at which point the datagram is rebuilt in a
//! large buffer and delivered.
//!
//! On the border router, fragments of datagrams leaving the mesh are not
//! reassembled: the FIRST fragment is inspected, and if the inner destination
//! is unicast the frame and every later fragment with the same tag are
//! forwarded raw to the [`Bridge`].
//!
//! Partial datagrams are never timed out. A record whose tag has fallen more
//! than `stale_tag_distance` behind the tag of an arriving fragment is
//! presumed abandoned and evicted.

use super::engine::{release, DirectForward, FragEngine, ReassemblyEntry};
use super::error::FragError;
use super::header::FragHeader;
use super::layers::{Bridge, NetworkLayer};
use crate::buffer::{BufferKind, BufferRef, PacketPool};
use log::{debug, info, warn};

/// What the engine did with a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxOutcome {
    /// No fragmentation header; handed to the network layer as is.
    Unfragmented,
    /// Forwarded raw to the bridge.
    Bridged {
        /// Datagram tag.
        tag: u16,
    },
    /// Stored; the datagram is still incomplete.
    Stored {
        /// Datagram tag.
        tag: u16,
        /// Bytes held for the tag so far.
        received: usize,
        /// Advertised datagram size.
        size: usize,
    },
    /// Completed a datagram, which was delivered to the network layer.
    Reassembled {
        /// Datagram tag.
        tag: u16,
        /// Datagram size.
        size: usize,
    },
    /// Same tag and offset already stored; discarded.
    Duplicate {
        /// Datagram tag.
        tag: u16,
        /// Offset in 8-byte units.
        offset: u8,
    },
    /// Discarded.
    Dropped(FragError),
}

impl FragEngine {
    /// Handle a frame received from the link layer.
    ///
    /// The engine takes ownership of `frame`: by the time this returns it has
    /// been passed on to `net` or `bridge`, stored, or released.
    pub fn on_fragment_received<N, B>(
        &mut self,
        pool: &mut PacketPool,
        net: &mut N,
        bridge: &mut B,
        frame: BufferRef,
    ) -> RxOutcome
    where
        N: NetworkLayer + ?Sized,
        B: Bridge + ?Sized,
    {
        let parsed = match pool.get(frame) {
            Some(packet) => FragHeader::parse(packet.payload()),
            None => {
                warn!("Received unknown buffer {}", frame);
                return RxOutcome::Dropped(FragError::UnknownBuffer(frame));
            }
        };
        let header = match parsed {
            Ok(Some(header)) => header,
            Ok(None) => {
                debug!("Frame {} is not a fragment, passing up", frame);
                net.receive(pool, frame);
                return RxOutcome::Unfragmented;
            }
            Err(e) => return self.drop_frame(pool, frame, e.into()),
        };

        self.stats.fragments_received += 1;
        let tag = header.tag();

        if self.should_bridge(pool, net, frame, &header) {
            debug!(
                "Bridging fragment offset {} of tag {:#06x}",
                header.offset(),
                tag
            );
            self.stats.bridged_frames += 1;
            bridge.forward(pool, frame);
            return RxOutcome::Bridged { tag };
        }

        let len = match strip_header(pool, frame, header.len()) {
            Ok(len) => len,
            Err(e) => return self.drop_frame(pool, frame, e),
        };
        let size = header.size() as usize;
        let offset = header.offset();
        if len == 0 {
            return self.drop_frame(
                pool,
                frame,
                FragError::Inconsistent("fragment carries no payload"),
            );
        }
        if size == 0 || offset as usize * 8 + len > size {
            return self.drop_frame(
                pool,
                frame,
                FragError::Inconsistent("fragment extends past datagram size"),
            );
        }

        if self
            .reassembly
            .any(|r| r.datagram_tag == tag && r.datagram_offset == offset)
        {
            warn!(
                "Duplicate fragment offset {} of tag {:#06x}, dropping",
                offset, tag
            );
            self.stats.duplicates_dropped += 1;
            release(pool, frame);
            return RxOutcome::Duplicate { tag, offset };
        }

        self.evict_stale(pool, tag);

        let start = offset as usize * 8;
        let mut stored = 0;
        let mut size_mismatch = false;
        let mut overlaps = false;
        for (_, r) in self.reassembly.iter().filter(|(_, r)| r.datagram_tag == tag) {
            size_mismatch |= r.datagram_size as usize != size;
            let r_start = r.datagram_offset as usize * 8;
            overlaps |= start < r_start + r.fragment_length as usize && r_start < start + len;
            stored += r.fragment_length as usize;
        }
        if size_mismatch {
            return self.drop_frame(
                pool,
                frame,
                FragError::Inconsistent("datagram size disagrees with stored fragments"),
            );
        }
        // Disjoint in-bounds ranges summing to `size` cover the whole datagram
        if overlaps || stored + len > size {
            return self.drop_frame(
                pool,
                frame,
                FragError::Inconsistent("fragment overlaps stored fragments"),
            );
        }

        let entry = ReassemblyEntry {
            dispatch: header.dispatch(),
            datagram_size: size as u16,
            datagram_tag: tag,
            datagram_offset: offset,
            fragment_length: len as u16,
            buffer: frame,
        };
        if self.reassembly.insert(entry).is_err() {
            return self.drop_frame(pool, frame, FragError::ReassemblyTableFull);
        }

        let received = stored + len;
        if received < size {
            debug!(
                "Stored fragment offset {} of tag {:#06x} ({}/{} bytes)",
                offset, tag, received, size
            );
            return RxOutcome::Stored {
                tag,
                received,
                size,
            };
        }

        match self.reassemble(pool, tag, size) {
            Ok(datagram) => {
                net.receive(pool, datagram);
                RxOutcome::Reassembled { tag, size }
            }
            Err(e) => RxOutcome::Dropped(e),
        }
    }

    /// Rebuild the datagram for `tag` from its stored fragments.
    ///
    /// Each fragment is copied to byte position `offset * 8` of a fresh large
    /// buffer, and its record and frame buffer are released. Meant to be
    /// called once the tag's fragments cover `size` bytes. If no large buffer
    /// is available, or `size` does not fit one, every fragment of the tag is
    /// discarded.
    pub fn reassemble(
        &mut self,
        pool: &mut PacketPool,
        tag: u16,
        size: usize,
    ) -> Result<BufferRef, FragError> {
        let Some(datagram) = pool.allocate(BufferKind::Large) else {
            warn!("No large buffer for datagram with tag {:#06x}", tag);
            self.discard(pool, tag);
            return Err(FragError::NoLargeBuffer);
        };
        let fits = pool
            .get_mut(datagram)
            .is_some_and(|packet| packet.set_len(size).is_ok());
        if !fits {
            release(pool, datagram);
            self.discard(pool, tag);
            return Err(FragError::DatagramTooLarge {
                len: size,
                max: pool.config().large_capacity,
            });
        }

        let mut copy_error = None;
        let copied = self.reassembly.remove_where(
            |r| r.datagram_tag == tag,
            |r| {
                if let Err(e) = copy_fragment(pool, &r, datagram) {
                    copy_error.get_or_insert(e);
                }
                release(pool, r.buffer);
            },
        );
        if let Some(e) = copy_error {
            warn!("Reassembly of tag {:#06x} failed: {}", tag, e);
            release(pool, datagram);
            self.stats.reassembly_drops += 1;
            return Err(e);
        }

        if let Some(packet) = pool.get_mut(datagram) {
            packet.from_reassembly = true;
        }
        self.stats.datagrams_reassembled += 1;
        info!(
            "Reassembled {}-byte datagram from {} fragments (tag {:#06x})",
            size, copied, tag
        );
        Ok(datagram)
    }

    /// Decide whether a fragment bypasses reassembly, updating the
    /// direct-forward state on FIRST fragments.
    fn should_bridge<N>(
        &mut self,
        pool: &PacketPool,
        net: &N,
        frame: BufferRef,
        header: &FragHeader,
    ) -> bool
    where
        N: NetworkLayer + ?Sized,
    {
        match *header {
            FragHeader::First { tag, .. } => {
                let forward = self.config.is_root
                    && pool
                        .get(frame)
                        .and_then(|packet| packet.payload().get(header.len()..))
                        .and_then(|inner| net.peek_destination(inner))
                        .is_some_and(|peeked| !peeked.destination.is_multicast());
                self.direct_forward = if forward {
                    DirectForward::Tag(tag)
                } else {
                    DirectForward::Idle
                };
                forward
            }
            FragHeader::Subsequent { tag, .. } => {
                self.config.is_root && self.direct_forward == DirectForward::Tag(tag)
            }
        }
    }

    /// Evict records whose tag is too far behind `current`.
    fn evict_stale(&mut self, pool: &mut PacketPool, current: u16) {
        let distance = self.config.stale_tag_distance;
        let evicted = self.reassembly.remove_where(
            |r| is_stale(current, r.datagram_tag, distance),
            |r| {
                warn!(
                    "Evicting stale fragment offset {} of tag {:#06x}",
                    r.datagram_offset, r.datagram_tag
                );
                release(pool, r.buffer);
            },
        );
        self.stats.stale_evicted += evicted as u64;
    }

    /// Drop every stored fragment of `tag`.
    fn discard(&mut self, pool: &mut PacketPool, tag: u16) {
        let dropped = self
            .reassembly
            .remove_where(|r| r.datagram_tag == tag, |r| release(pool, r.buffer));
        warn!("Dropped {} fragments of tag {:#06x}", dropped, tag);
        self.stats.reassembly_drops += 1;
    }

    fn drop_frame(&mut self, pool: &mut PacketPool, frame: BufferRef, err: FragError) -> RxOutcome {
        warn!("Dropping received frame {}: {}", frame, err);
        release(pool, frame);
        self.stats.reassembly_drops += 1;
        RxOutcome::Dropped(err)
    }
}

/// Whether `tag` is more than `distance` behind `current` in wrapping
/// 16-bit tag space. Tags ahead of `current` are never stale.
fn is_stale(current: u16, tag: u16, distance: u16) -> bool {
    let behind = current.wrapping_sub(tag);
    behind > distance && behind < 0x8000
}

fn strip_header(pool: &mut PacketPool, frame: BufferRef, n: usize) -> Result<usize, FragError> {
    let packet = pool.get_mut(frame).ok_or(FragError::UnknownBuffer(frame))?;
    packet.strip(n)?;
    Ok(packet.len())
}

fn copy_fragment(
    pool: &mut PacketPool,
    entry: &ReassemblyEntry,
    datagram: BufferRef,
) -> Result<(), FragError> {
    let (src, dst) = pool
        .pair_mut(entry.buffer, datagram)
        .ok_or(FragError::UnknownBuffer(entry.buffer))?;
    let bytes = src.payload();
    let start = entry.datagram_offset as usize * 8;
    dst.payload_mut()
        .get_mut(start..start + bytes.len())
        .ok_or(FragError::Inconsistent("fragment outside reassembled datagram"))?
        .copy_from_slice(bytes);
    Ok(())
}
