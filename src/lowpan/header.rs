//! 6LoWPAN fragmentation headers (RFC 4944, section 5.3).
//!
//! # Header Format
//!
//! ```text
//! FIRST (4 bytes):
//!  0                   1                   2                   3
//! |1 1 0 0 0|    datagram_size    |         datagram_tag          |
//!
//! SUBSEQUENT (5 bytes):
//! |1 1 1 0 0|    datagram_size    |         datagram_tag          |
//! |datagram_offset|
//! ```
//!
//! The dispatch occupies the top 5 bits of the first 16-bit word and the
//! datagram size its low 11 bits. All multi-byte fields are big-endian. The
//! offset counts 8-byte units.
//!
//! The FIRST dispatch is the RFC 4944 value `11000`, not its bit-reversal
//! `00011`; the latter falls in the "not a LoWPAN frame" range.
//!
//! # Example
//!
//! ```
//! use lowpan_frag::lowpan::header::FragHeader;
//!
//! let header = FragHeader::Subsequent { size: 200, tag: 0x1234, offset: 12 };
//! let mut buf = [0u8; 5];
//! assert_eq!(header.write_to(&mut buf).unwrap(), 5);
//! assert_eq!(FragHeader::parse(&buf).unwrap(), Some(header));
//! ```

/// Dispatch value of a FIRST fragment header (`11000`).
pub const DISPATCH_FRAG_FIRST: u8 = 0b11000;

/// Dispatch value of a SUBSEQUENT fragment header (`11100`).
pub const DISPATCH_FRAG_SUBSEQUENT: u8 = 0b11100;

/// Length of a FIRST fragment header in bytes.
pub const FIRST_HEADER_LEN: usize = 4;

/// Length of a SUBSEQUENT fragment header in bytes.
pub const SUBSEQUENT_HEADER_LEN: usize = 5;

/// Largest datagram the 11-bit size field can describe.
pub const MAX_DATAGRAM_SIZE: usize = 0x7FF;

const DISPATCH_SHIFT: u16 = 11;
const SIZE_MASK: u16 = 0x07FF;

/// Which fragmentation header a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// First fragment of a datagram (implicit offset 0).
    First,
    /// Any later fragment (explicit offset).
    Subsequent,
}

impl Dispatch {
    /// The 5-bit dispatch code.
    pub const fn code(self) -> u8 {
        match self {
            Self::First => DISPATCH_FRAG_FIRST,
            Self::Subsequent => DISPATCH_FRAG_SUBSEQUENT,
        }
    }

    /// Header length for this dispatch.
    pub const fn header_len(self) -> usize {
        match self {
            Self::First => FIRST_HEADER_LEN,
            Self::Subsequent => SUBSEQUENT_HEADER_LEN,
        }
    }

    /// Classify the first byte of a frame.
    ///
    /// Returns `None` if the frame does not start with a fragmentation
    /// header.
    pub fn from_first_byte(byte: u8) -> Option<Self> {
        match byte >> 3 {
            DISPATCH_FRAG_FIRST => Some(Self::First),
            DISPATCH_FRAG_SUBSEQUENT => Some(Self::Subsequent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::First => write!(f, "FRAG1"),
            Self::Subsequent => write!(f, "FRAGN"),
        }
    }
}

/// Errors from header encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Input ends before the header does.
    TooShort {
        /// Bytes the header needs.
        needed: usize,
        /// Bytes available.
        got: usize,
    },
    /// Output buffer cannot hold the header.
    BufferTooSmall,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { needed, got } => {
                write!(f, "fragment header needs {} bytes, got {}", needed, got)
            }
            Self::BufferTooSmall => write!(f, "buffer too small for fragment header"),
        }
    }
}

impl std::error::Error for HeaderError {}

/// A decoded fragmentation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragHeader {
    /// FIRST fragment header.
    First {
        /// Datagram size in bytes (11 bits).
        size: u16,
        /// Datagram tag.
        tag: u16,
    },
    /// SUBSEQUENT fragment header.
    Subsequent {
        /// Datagram size in bytes (11 bits).
        size: u16,
        /// Datagram tag.
        tag: u16,
        /// Offset in 8-byte units.
        offset: u8,
    },
}

impl FragHeader {
    /// Build the header for a fragment at `offset` (8-byte units).
    ///
    /// Offset 0 yields a FIRST header, anything else a SUBSEQUENT one.
    pub fn for_offset(size: u16, tag: u16, offset: u8) -> Self {
        if offset == 0 {
            Self::First { size, tag }
        } else {
            Self::Subsequent { size, tag, offset }
        }
    }

    /// Which dispatch this header carries.
    pub fn dispatch(&self) -> Dispatch {
        match self {
            Self::First { .. } => Dispatch::First,
            Self::Subsequent { .. } => Dispatch::Subsequent,
        }
    }

    /// Datagram size in bytes.
    pub fn size(&self) -> u16 {
        match *self {
            Self::First { size, .. } | Self::Subsequent { size, .. } => size,
        }
    }

    /// Datagram tag.
    pub fn tag(&self) -> u16 {
        match *self {
            Self::First { tag, .. } | Self::Subsequent { tag, .. } => tag,
        }
    }

    /// Offset in 8-byte units (0 for FIRST).
    pub fn offset(&self) -> u8 {
        match *self {
            Self::First { .. } => 0,
            Self::Subsequent { offset, .. } => offset,
        }
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.dispatch().header_len()
    }

    /// Headers are never empty; provided for symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Serialize into `buf`, returning the number of bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, HeaderError> {
        let len = self.len();
        let out = buf.get_mut(..len).ok_or(HeaderError::BufferTooSmall)?;
        let word = ((self.dispatch().code() as u16) << DISPATCH_SHIFT) | (self.size() & SIZE_MASK);
        out[0..2].copy_from_slice(&word.to_be_bytes());
        out[2..4].copy_from_slice(&self.tag().to_be_bytes());
        if let Self::Subsequent { offset, .. } = *self {
            out[4] = offset;
        }
        Ok(len)
    }

    /// Decode the header at the start of `bytes`.
    ///
    /// Returns `Ok(None)` if the frame does not carry a fragmentation
    /// header at all.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, HeaderError> {
        let Some(&first) = bytes.first() else {
            return Err(HeaderError::TooShort { needed: 1, got: 0 });
        };
        let Some(dispatch) = Dispatch::from_first_byte(first) else {
            return Ok(None);
        };
        let needed = dispatch.header_len();
        let hdr = bytes.get(..needed).ok_or(HeaderError::TooShort {
            needed,
            got: bytes.len(),
        })?;

        let size = u16::from_be_bytes([hdr[0], hdr[1]]) & SIZE_MASK;
        let tag = u16::from_be_bytes([hdr[2], hdr[3]]);
        Ok(Some(match dispatch {
            Dispatch::First => Self::First { size, tag },
            Dispatch::Subsequent => Self::Subsequent {
                size,
                tag,
                offset: hdr[4],
            },
        }))
    }
}
