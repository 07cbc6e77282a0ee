//! Error type for fragmentation and reassembly.

use super::header::HeaderError;
use crate::buffer::{BufferRef, PacketError};

/// Errors that can occur during fragmentation or reassembly.
///
/// None of these are fatal. Every path that returns one has already released
/// the buffers it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragError {
    /// The pool had no frame buffer for the next fragment.
    NoFreeBuffer,
    /// The outbound fragment table is full.
    FragmentTableFull,
    /// The link layer refused a fragment; the datagram was aborted.
    SendFailed,
    /// The datagram cannot be described by the 11-bit size field, or does
    /// not fit a large buffer.
    DatagramTooLarge {
        /// Datagram length in bytes.
        len: usize,
        /// Largest supported length.
        max: usize,
    },
    /// A send completion matched no outbound fragment.
    MissingFragmentRecord(BufferRef),
    /// The reassembly table is full; the fragment was dropped.
    ReassemblyTableFull,
    /// No large buffer was free for a completed datagram; it was dropped.
    NoLargeBuffer,
    /// The handle does not name an allocated buffer.
    UnknownBuffer(BufferRef),
    /// A received fragment header is malformed or inconsistent.
    Malformed(HeaderError),
    /// A fragment does not fit the datagram it claims to belong to.
    Inconsistent(&'static str),
    /// Packet window manipulation failed.
    Packet(PacketError),
}

impl std::fmt::Display for FragError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoFreeBuffer => write!(f, "no free buffer for fragment"),
            Self::FragmentTableFull => write!(f, "outbound fragment table full"),
            Self::SendFailed => write!(f, "fragment submission failed"),
            Self::DatagramTooLarge { len, max } => {
                write!(f, "datagram of {} bytes exceeds {} bytes", len, max)
            }
            Self::MissingFragmentRecord(buf) => {
                write!(f, "no outbound fragment record for {}", buf)
            }
            Self::ReassemblyTableFull => write!(f, "reassembly table full"),
            Self::NoLargeBuffer => write!(f, "no large buffer for reassembly"),
            Self::UnknownBuffer(buf) => write!(f, "{} is not allocated", buf),
            Self::Malformed(e) => write!(f, "malformed fragment: {}", e),
            Self::Inconsistent(msg) => write!(f, "inconsistent fragment: {}", msg),
            Self::Packet(e) => write!(f, "packet error: {}", e),
        }
    }
}

impl std::error::Error for FragError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            Self::Packet(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HeaderError> for FragError {
    fn from(e: HeaderError) -> Self {
        Self::Malformed(e)
    }
}

impl From<PacketError> for FragError {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}
