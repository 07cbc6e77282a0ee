//! Outbound path: fragmentation and send-completion tracking.
//!
//! A datagram longer than `max_fragment_size` is carved into fragments of
//! exactly `max_fragment_size` bytes (the last one may be shorter). Every
//! fragment gets its own frame buffer and an outbound table record; only
//! once the whole set is buffered are the frames handed to the link layer,
//! in ascending offset order.
//!
//! The link layer reports each frame back through
//! [`FragEngine::on_fragment_sent`]. When the last fragment of a datagram
//! comes back, the network layer gets a single completion for the original
//! datagram.

use super::engine::{release, FragEngine, OutboundFragment};
use super::error::FragError;
use super::header::{FragHeader, MAX_DATAGRAM_SIZE};
use super::layers::{LinkLayer, NetworkLayer, Outcome};
use crate::buffer::{BufferKind, BufferRef, PacketPool};
use log::{debug, info, warn};

impl FragEngine {
    /// Whether a datagram of `len` bytes has to be fragmented.
    pub fn needs_fragmentation(&self, len: usize) -> bool {
        len > self.config.max_fragment_size
    }

    /// Send a datagram, fragmenting it if it does not fit one frame.
    ///
    /// On `Ok` the datagram is in flight and its outcome will arrive through
    /// [`NetworkLayer::send_done`] exactly once. On `Err` nothing is in
    /// flight on behalf of the caller, every buffer the engine took has been
    /// released, and the caller still owns `datagram`.
    pub fn fragment_and_send<L>(
        &mut self,
        pool: &mut PacketPool,
        link: &mut L,
        datagram: BufferRef,
    ) -> Result<(), FragError>
    where
        L: LinkLayer + ?Sized,
    {
        let len = pool
            .get(datagram)
            .ok_or(FragError::UnknownBuffer(datagram))?
            .len();

        if !self.needs_fragmentation(len) {
            return self.send_unfragmented(pool, link, datagram, len);
        }
        if len > MAX_DATAGRAM_SIZE {
            warn!(
                "Datagram of {} bytes exceeds {} byte fragmentation limit",
                len, MAX_DATAGRAM_SIZE
            );
            return Err(FragError::DatagramTooLarge {
                len,
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let tag = self.allocate_tag();
        let slots = self.carve(pool, datagram, tag, len)?;
        self.submit_fragments(pool, link, tag, &slots)?;

        self.stats.datagrams_sent += 1;
        info!(
            "Sent {}-byte datagram as {} fragments (tag {:#06x})",
            len,
            slots.len(),
            tag
        );
        Ok(())
    }

    /// Resolve a link-layer completion.
    ///
    /// The frame is matched by identity against the outbound table and
    /// released. A frame that never was a fragment is reported upward as
    /// its own datagram.
    pub fn on_fragment_sent<N>(
        &mut self,
        pool: &mut PacketPool,
        net: &mut N,
        frame: BufferRef,
        outcome: Outcome,
    ) -> Result<(), FragError>
    where
        N: NetworkLayer + ?Sized,
    {
        let Some(record) = self
            .outbound
            .position(|r| r.buffer == frame)
            .and_then(|idx| self.outbound.remove(idx))
        else {
            return self.complete_unmatched(pool, net, frame, outcome);
        };
        release(pool, frame);

        let tag = record.datagram_tag;
        let failed = record.tx_failed || !outcome.is_success();
        if failed {
            for sibling in self.outbound.values_mut() {
                if sibling.datagram_tag == tag {
                    sibling.tx_failed = true;
                }
            }
        }

        let remaining = self
            .outbound
            .iter()
            .filter(|(_, r)| r.datagram_tag == tag)
            .count();
        debug!(
            "Fragment offset {} of tag {:#06x} done ({}), {} remaining",
            record.datagram_offset, tag, outcome, remaining
        );
        if remaining > 0 {
            return Ok(());
        }
        if record.aborted {
            debug!("Tag {:#06x} was aborted, completion already reported", tag);
            return Ok(());
        }

        let outcome = if failed {
            self.stats.send_failures += 1;
            Outcome::Failure
        } else {
            Outcome::Success
        };
        info!("Datagram with tag {:#06x} completed: {}", tag, outcome);
        net.send_done(pool, record.original, outcome);
        Ok(())
    }

    fn send_unfragmented<L>(
        &mut self,
        pool: &mut PacketPool,
        link: &mut L,
        datagram: BufferRef,
        len: usize,
    ) -> Result<(), FragError>
    where
        L: LinkLayer + ?Sized,
    {
        if let Some(packet) = pool.get_mut(datagram) {
            packet.is_fragment = false;
        }
        match link.submit(pool, datagram) {
            Ok(()) => {
                self.stats.datagrams_sent += 1;
                debug!("Sent {}-byte datagram without fragmentation", len);
                Ok(())
            }
            Err(e) => {
                warn!("Link refused unfragmented datagram: {}", e);
                self.stats.send_failures += 1;
                Err(FragError::SendFailed)
            }
        }
    }

    /// Buffer every fragment of a datagram. All or nothing.
    fn carve(
        &mut self,
        pool: &mut PacketPool,
        datagram: BufferRef,
        tag: u16,
        len: usize,
    ) -> Result<Vec<usize>, FragError> {
        let max = self.config.max_fragment_size;
        let mut slots = Vec::with_capacity(len.div_ceil(max));
        let mut start = 0;

        while start < len {
            let slice_len = (len - start).min(max);
            match self.carve_one(pool, datagram, tag, len, start, slice_len) {
                Ok(idx) => slots.push(idx),
                Err(e) => {
                    warn!(
                        "Fragmenting tag {:#06x} failed after {} fragments: {}",
                        tag,
                        slots.len(),
                        e
                    );
                    self.release_outbound(pool, &slots);
                    return Err(e);
                }
            }
            start += slice_len;
        }
        Ok(slots)
    }

    fn carve_one(
        &mut self,
        pool: &mut PacketPool,
        datagram: BufferRef,
        tag: u16,
        size: usize,
        start: usize,
        slice_len: usize,
    ) -> Result<usize, FragError> {
        let buffer = pool
            .allocate(BufferKind::Frame)
            .ok_or(FragError::NoFreeBuffer)?;

        // `start` is a multiple of 8: max_fragment_size is validated to be one
        let header = FragHeader::for_offset(size as u16, tag, (start / 8) as u8);
        let record = OutboundFragment {
            dispatch: header.dispatch(),
            datagram_size: size as u16,
            datagram_tag: tag,
            datagram_offset: header.offset(),
            fragment_length: slice_len as u16,
            tx_failed: false,
            aborted: false,
            buffer,
            original: datagram,
        };
        let idx = match self.outbound.insert(record) {
            Ok(idx) => idx,
            Err(_) => {
                release(pool, buffer);
                return Err(FragError::FragmentTableFull);
            }
        };

        if let Err(e) = write_fragment(pool, datagram, buffer, start..start + slice_len, &header) {
            self.release_outbound(pool, &[idx]);
            return Err(e);
        }
        Ok(idx)
    }

    /// Hand buffered fragments to the link layer in order.
    ///
    /// If the link refuses one, the datagram is aborted: fragments not yet
    /// submitted are released now, fragments already submitted are marked
    /// so their completions are absorbed without a second report.
    fn submit_fragments<L>(
        &mut self,
        pool: &mut PacketPool,
        link: &mut L,
        tag: u16,
        slots: &[usize],
    ) -> Result<(), FragError>
    where
        L: LinkLayer + ?Sized,
    {
        for (k, &idx) in slots.iter().enumerate() {
            let Some(buffer) = self.outbound.get(idx).map(|r| r.buffer) else {
                continue;
            };
            if let Err(e) = link.submit(pool, buffer) {
                warn!(
                    "Link refused fragment {} of {} (tag {:#06x}): {}, aborting datagram",
                    k + 1,
                    slots.len(),
                    tag,
                    e
                );
                if let Some(record) = self.outbound.get_mut(idx) {
                    record.tx_failed = true;
                }
                self.release_outbound(pool, &slots[k..]);
                for &sent in &slots[..k] {
                    if let Some(record) = self.outbound.get_mut(sent) {
                        record.tx_failed = true;
                        record.aborted = true;
                    }
                }
                self.stats.send_failures += 1;
                return Err(FragError::SendFailed);
            }
            self.stats.fragments_sent += 1;
            debug!("Submitted fragment {} of tag {:#06x} as {}", k, tag, buffer);
        }
        Ok(())
    }

    fn release_outbound(&mut self, pool: &mut PacketPool, slots: &[usize]) {
        for &idx in slots {
            if let Some(record) = self.outbound.remove(idx) {
                release(pool, record.buffer);
            }
        }
    }

    fn complete_unmatched<N>(
        &mut self,
        pool: &mut PacketPool,
        net: &mut N,
        frame: BufferRef,
        outcome: Outcome,
    ) -> Result<(), FragError>
    where
        N: NetworkLayer + ?Sized,
    {
        let is_fragment = pool
            .get(frame)
            .ok_or(FragError::UnknownBuffer(frame))?
            .is_fragment;
        if is_fragment {
            warn!("No outbound record for {}, releasing it", frame);
            self.stats.missing_records += 1;
            release(pool, frame);
            return Err(FragError::MissingFragmentRecord(frame));
        }
        if !outcome.is_success() {
            self.stats.send_failures += 1;
        }
        net.send_done(pool, frame, outcome);
        Ok(())
    }
}

/// Copy `range` of the datagram into `buffer` behind a fragment header.
fn write_fragment(
    pool: &mut PacketPool,
    datagram: BufferRef,
    buffer: BufferRef,
    range: std::ops::Range<usize>,
    header: &FragHeader,
) -> Result<(), FragError> {
    let (src, dst) = pool
        .pair_mut(datagram, buffer)
        .ok_or(FragError::UnknownBuffer(datagram))?;
    let slice = src
        .payload()
        .get(range)
        .ok_or(FragError::Inconsistent("fragment slice outside datagram"))?;
    dst.set_payload(slice)?;
    header.write_to(dst.prepend(header.len())?)?;
    dst.is_fragment = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::header::Dispatch;
    use super::super::loopback::{LoopbackLink, RecordingNetwork};
    use super::*;
    use crate::config::{FragConfig, PoolConfig};

    fn setup(frame_buffers: usize) -> (PacketPool, FragEngine) {
        let pool = PacketPool::new(PoolConfig {
            frame_buffers,
            ..Default::default()
        })
        .unwrap();
        let engine = FragEngine::new(FragConfig::default(), 0x4000).unwrap();
        (pool, engine)
    }

    fn datagram(pool: &mut PacketPool, len: usize) -> BufferRef {
        let buf = pool.allocate(BufferKind::Large).unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| i as u8).collect();
        pool.get_mut(buf).unwrap().set_payload(&bytes).unwrap();
        buf
    }

    #[test]
    fn test_small_datagram_bypasses_fragmentation() {
        let (mut pool, mut engine) = setup(4);
        let mut link = LoopbackLink::new(4);
        let dgram = datagram(&mut pool, 96);

        engine.fragment_and_send(&mut pool, &mut link, dgram).unwrap();

        assert_eq!(link.pending(), 1);
        assert_eq!(link.pop(), Some(dgram));
        assert_eq!(engine.outbound_in_flight(), 0);
        assert_eq!(engine.next_tag(), 0x4000); // no tag consumed
        assert!(!pool.get(dgram).unwrap().is_fragment);
    }

    #[test]
    fn test_unfragmented_completion_reported_immediately() {
        let (mut pool, mut engine) = setup(4);
        let mut link = LoopbackLink::new(4);
        let mut net = RecordingNetwork::new();
        let dgram = datagram(&mut pool, 10);

        engine.fragment_and_send(&mut pool, &mut link, dgram).unwrap();
        let frame = link.pop().unwrap();
        engine
            .on_fragment_sent(&mut pool, &mut net, frame, Outcome::Failure)
            .unwrap();

        assert_eq!(net.completions, vec![(dgram, Outcome::Failure)]);
        assert_eq!(engine.stats().send_failures, 1);
    }

    #[test]
    fn test_fragment_layout_200_bytes() {
        let (mut pool, mut engine) = setup(8);
        let mut link = LoopbackLink::new(8);
        let dgram = datagram(&mut pool, 200);

        engine.fragment_and_send(&mut pool, &mut link, dgram).unwrap();
        assert_eq!(engine.outbound_in_flight(), 3);
        assert_eq!(engine.next_tag(), 0x4001);

        let mut records: Vec<OutboundFragment> = engine.outbound_fragments().copied().collect();
        records.sort_by_key(|r| r.datagram_offset);
        let lengths: Vec<u16> = records.iter().map(|r| r.fragment_length).collect();
        let offsets: Vec<u8> = records.iter().map(|r| r.datagram_offset).collect();
        assert_eq!(lengths, vec![96, 96, 8]);
        assert_eq!(offsets, vec![0, 12, 24]);
        assert!(records.iter().all(|r| r.datagram_tag == 0x4000));
        assert!(records.iter().all(|r| r.datagram_size == 200));
        assert!(records.iter().all(|r| r.original == dgram));
        assert_eq!(records[0].dispatch, Dispatch::First);
        assert_eq!(records[2].dispatch, Dispatch::Subsequent);

        // Frames are submitted in ascending offset order
        let frames: Vec<BufferRef> = std::iter::from_fn(|| link.pop()).collect();
        let headers: Vec<FragHeader> = frames
            .iter()
            .map(|f| FragHeader::parse(pool.get(*f).unwrap().payload()).unwrap().unwrap())
            .collect();
        assert_eq!(
            headers,
            vec![
                FragHeader::First {
                    size: 200,
                    tag: 0x4000
                },
                FragHeader::Subsequent {
                    size: 200,
                    tag: 0x4000,
                    offset: 12
                },
                FragHeader::Subsequent {
                    size: 200,
                    tag: 0x4000,
                    offset: 24
                },
            ]
        );
        let first = pool.get(frames[0]).unwrap();
        assert_eq!(first.len(), 4 + 96);
        assert_eq!(&first.payload()[4..8], &[0, 1, 2, 3]);
        let last = pool.get(frames[2]).unwrap();
        assert_eq!(last.payload()[5..], [192, 193, 194, 195, 196, 197, 198, 199]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let (mut pool, mut engine) = setup(8);
        let mut link = LoopbackLink::new(8);
        let dgram = datagram(&mut pool, 192);

        engine.fragment_and_send(&mut pool, &mut link, dgram).unwrap();
        assert_eq!(link.pending(), 2);
    }

    #[test]
    fn test_completion_once_after_all_fragments() {
        let (mut pool, mut engine) = setup(8);
        let mut link = LoopbackLink::new(8);
        let mut net = RecordingNetwork::new();
        let dgram = datagram(&mut pool, 300);

        engine.fragment_and_send(&mut pool, &mut link, dgram).unwrap();
        let mut frames: Vec<BufferRef> = std::iter::from_fn(|| link.pop()).collect();
        assert_eq!(frames.len(), 4);
        frames.reverse();

        for (i, frame) in frames.into_iter().enumerate() {
            assert!(net.completions.is_empty(), "early completion at {}", i);
            engine
                .on_fragment_sent(&mut pool, &mut net, frame, Outcome::Success)
                .unwrap();
        }
        assert_eq!(net.completions, vec![(dgram, Outcome::Success)]);
        assert_eq!(engine.outbound_in_flight(), 0);
        assert_eq!(pool.in_use(BufferKind::Frame), 0);
    }

    #[test]
    fn test_one_failed_fragment_fails_datagram() {
        let (mut pool, mut engine) = setup(8);
        let mut link = LoopbackLink::new(8);
        let mut net = RecordingNetwork::new();
        let dgram = datagram(&mut pool, 200);

        engine.fragment_and_send(&mut pool, &mut link, dgram).unwrap();
        let frames: Vec<BufferRef> = std::iter::from_fn(|| link.pop()).collect();
        engine
            .on_fragment_sent(&mut pool, &mut net, frames[0], Outcome::Success)
            .unwrap();
        engine
            .on_fragment_sent(&mut pool, &mut net, frames[1], Outcome::Failure)
            .unwrap();
        engine
            .on_fragment_sent(&mut pool, &mut net, frames[2], Outcome::Success)
            .unwrap();

        assert_eq!(net.completions, vec![(dgram, Outcome::Failure)]);
    }

    #[test]
    fn test_no_free_buffer_releases_partial_work() {
        let (mut pool, mut engine) = setup(2);
        let mut link = LoopbackLink::new(8);
        let dgram = datagram(&mut pool, 300); // needs 4 frames

        assert_eq!(
            engine.fragment_and_send(&mut pool, &mut link, dgram),
            Err(FragError::NoFreeBuffer)
        );
        assert_eq!(pool.in_use(BufferKind::Frame), 0);
        assert_eq!(engine.outbound_in_flight(), 0);
        assert_eq!(link.pending(), 0);
        assert!(pool.is_allocated(dgram));
    }

    #[test]
    fn test_fragment_table_full_releases_partial_work() {
        let mut pool = PacketPool::new(PoolConfig::default()).unwrap();
        let mut engine = FragEngine::new(
            FragConfig {
                fragment_buffers: 2,
                ..Default::default()
            },
            0,
        )
        .unwrap();
        let mut link = LoopbackLink::new(8);
        let dgram = datagram(&mut pool, 300);

        assert_eq!(
            engine.fragment_and_send(&mut pool, &mut link, dgram),
            Err(FragError::FragmentTableFull)
        );
        assert_eq!(pool.in_use(BufferKind::Frame), 0);
        assert_eq!(engine.outbound_in_flight(), 0);
    }

    #[test]
    fn test_submit_failure_aborts_datagram() {
        let (mut pool, mut engine) = setup(8);
        let mut link = LoopbackLink::new(8);
        link.fail_on_attempt(1);
        let mut net = RecordingNetwork::new();
        let dgram = datagram(&mut pool, 300);

        assert_eq!(
            engine.fragment_and_send(&mut pool, &mut link, dgram),
            Err(FragError::SendFailed)
        );
        // Fragment 0 is with the link; fragments 1..3 were released
        assert_eq!(link.pending(), 1);
        assert_eq!(engine.outbound_in_flight(), 1);
        assert_eq!(pool.in_use(BufferKind::Frame), 1);

        let frame = link.pop().unwrap();
        engine
            .on_fragment_sent(&mut pool, &mut net, frame, Outcome::Success)
            .unwrap();
        assert!(net.completions.is_empty());
        assert_eq!(engine.outbound_in_flight(), 0);
        assert_eq!(pool.in_use(BufferKind::Frame), 0);
        assert_eq!(engine.stats().send_failures, 1);
    }

    #[test]
    fn test_first_submit_failure_leaves_nothing_in_flight() {
        let (mut pool, mut engine) = setup(8);
        let mut link = LoopbackLink::new(8);
        link.fail_on_attempt(0);
        let dgram = datagram(&mut pool, 200);

        assert_eq!(
            engine.fragment_and_send(&mut pool, &mut link, dgram),
            Err(FragError::SendFailed)
        );
        assert_eq!(engine.outbound_in_flight(), 0);
        assert_eq!(pool.in_use(BufferKind::Frame), 0);
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut pool = PacketPool::new(PoolConfig {
            large_capacity: 4096,
            ..Default::default()
        })
        .unwrap();
        let mut engine = FragEngine::new(FragConfig::default(), 0).unwrap();
        let mut link = LoopbackLink::new(64);
        let dgram = datagram(&mut pool, 2048);

        assert_eq!(
            engine.fragment_and_send(&mut pool, &mut link, dgram),
            Err(FragError::DatagramTooLarge {
                len: 2048,
                max: 2047
            })
        );
        assert_eq!(engine.next_tag(), 0);
    }

    #[test]
    fn test_unknown_completion_is_missing_record() {
        let (mut pool, mut engine) = setup(4);
        let mut net = RecordingNetwork::new();
        let stray = pool.allocate(BufferKind::Frame).unwrap();
        pool.get_mut(stray).unwrap().is_fragment = true;

        assert_eq!(
            engine.on_fragment_sent(&mut pool, &mut net, stray, Outcome::Success),
            Err(FragError::MissingFragmentRecord(stray))
        );
        assert!(!pool.is_allocated(stray));
        assert_eq!(engine.stats().missing_records, 1);
        assert!(net.completions.is_empty());
    }

    #[test]
    fn test_stale_handle_completion_rejected() {
        let (mut pool, mut engine) = setup(4);
        let mut net = RecordingNetwork::new();
        let stale = pool.allocate(BufferKind::Frame).unwrap();
        pool.free(stale).unwrap();

        assert_eq!(
            engine.on_fragment_sent(&mut pool, &mut net, stale, Outcome::Success),
            Err(FragError::UnknownBuffer(stale))
        );
    }

    #[test]
    fn test_interleaved_datagrams_complete_independently() {
        let (mut pool, mut engine) = setup(12);
        let mut link = LoopbackLink::new(12);
        let mut net = RecordingNetwork::new();
        let a = datagram(&mut pool, 150);
        let b = datagram(&mut pool, 150);

        engine.fragment_and_send(&mut pool, &mut link, a).unwrap();
        engine.fragment_and_send(&mut pool, &mut link, b).unwrap();
        let frames: Vec<BufferRef> = std::iter::from_fn(|| link.pop()).collect();
        assert_eq!(frames.len(), 4);

        // Finish b before a
        for &i in &[3, 2, 0, 1] {
            engine
                .on_fragment_sent(&mut pool, &mut net, frames[i], Outcome::Success)
                .unwrap();
        }
        assert_eq!(
            net.completions,
            vec![(b, Outcome::Success), (a, Outcome::Success)]
        );
    }
}
