//! 6LoWPAN fragmentation and reassembly.
//!
//! IPv6 requires a 1280-byte MTU while an IEEE 802.15.4 frame carries at
//! most 127 bytes. This module splits outbound datagrams into fragments
//! with RFC 4944 fragmentation headers and puts inbound fragments back
//! together, in any arrival order.
//!
//! The engine sits between the header-compression layer and the MAC layer;
//! see [`layers`] for the interfaces it expects from both.

mod engine;
mod error;
mod fragmenter;
pub mod header;
pub mod layers;
pub mod loopback;
mod reassembler;
mod stats;
mod table;

pub use engine::{random_tag, DirectForward, FragEngine, OutboundFragment, ReassemblyEntry};
pub use error::FragError;
pub use header::{Dispatch, FragHeader, HeaderError};
pub use layers::{Bridge, LinkError, LinkLayer, NetworkLayer, NoBridge, Outcome, PeekedHeader};
pub use reassembler::RxOutcome;
pub use stats::FragStats;
pub use table::SlotTable;
