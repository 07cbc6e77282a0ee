//! Fragmentation counters.
//!
//! Plain counters updated by the engine as it runs. They are cumulative
//! since the engine was created (a [`reset`](super::FragEngine::reset) does
//! not clear them) and serialize to JSON for export:
//!
//! ```json
//! {
//!   "datagrams_sent": 12,
//!   "fragments_sent": 40,
//!   "send_failures": 1,
//!   "fragments_received": 38,
//!   "datagrams_reassembled": 11,
//!   "duplicates_dropped": 2,
//!   "stale_evicted": 1,
//!   "bridged_frames": 0,
//!   "reassembly_drops": 0,
//!   "missing_records": 0
//! }
//! ```

use serde::Serialize;

/// Cumulative engine counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FragStats {
    /// Datagrams accepted for sending (fragmented or not).
    pub datagrams_sent: u64,
    /// Fragments handed to the link layer.
    pub fragments_sent: u64,
    /// Datagrams that completed with a failure or were aborted.
    pub send_failures: u64,
    /// Fragment frames received.
    pub fragments_received: u64,
    /// Datagrams reassembled and delivered upward.
    pub datagrams_reassembled: u64,
    /// Duplicate fragments discarded.
    pub duplicates_dropped: u64,
    /// Reassembly records evicted as stale.
    pub stale_evicted: u64,
    /// Frames forwarded through the bridge.
    pub bridged_frames: u64,
    /// Fragments or datagrams dropped on the receive path.
    pub reassembly_drops: u64,
    /// Send completions that matched no record.
    pub missing_records: u64,
}

impl FragStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }
}
