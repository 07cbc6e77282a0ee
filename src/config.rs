//! Engine and buffer pool configuration.
//!
//! Both configuration types are plain `Copy` structs with sensible defaults
//! and a `validate()` method. The defaults match a typical IEEE 802.15.4
//! deployment: 127-byte frames, 96 bytes of datagram per fragment, and
//! enough table slots in each direction for one full 1280-byte IPv6
//! datagram.
//!
//! Host binaries can overlay environment variables on the defaults:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `LOWPAN_MAX_FRAGMENT_SIZE` | [`FragConfig::max_fragment_size`] |
//! | `LOWPAN_FRAGMENT_BUFFERS` | [`FragConfig::fragment_buffers`] |
//! | `LOWPAN_REASSEMBLY_BUFFERS` | [`FragConfig::reassembly_buffers`] |
//! | `LOWPAN_STALE_TAG_DISTANCE` | [`FragConfig::stale_tag_distance`] |
//! | `LOWPAN_ROOT` | [`FragConfig::is_root`] |
//!
//! `LOWPAN_ROOT` accepts `1`/`0`, `true`/`false`, `yes`/`no` and `on`/`off`.
//!
//! # Example
//!
//! ```
//! use lowpan_frag::config::FragConfig;
//!
//! let config = FragConfig {
//!     max_fragment_size: 64,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::lowpan::header::{MAX_DATAGRAM_SIZE, SUBSEQUENT_HEADER_LEN};
use log::warn;

/// Maximum payload of an IEEE 802.15.4 frame.
pub const IEEE802154_FRAME_SIZE: usize = 127;

/// Default number of datagram bytes carried per fragment.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 96;

/// Default capacity of the outbound fragment table.
pub const DEFAULT_FRAGMENT_BUFFERS: usize = 16;

/// Default capacity of the reassembly table.
pub const DEFAULT_REASSEMBLY_BUFFERS: usize = 16;

/// Default tag distance after which a partial datagram is presumed abandoned.
pub const DEFAULT_STALE_TAG_DISTANCE: u16 = 4;

/// Largest offset the 8-bit offset field can express, in bytes.
const MAX_OFFSET_BYTES: usize = u8::MAX as usize * 8;

/// Error returned when a configuration value is out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Fragmentation engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragConfig {
    /// Datagram bytes per fragment. Must be a non-zero multiple of 8.
    pub max_fragment_size: usize,
    /// Capacity of the outbound fragment table.
    pub fragment_buffers: usize,
    /// Capacity of the reassembly table.
    pub reassembly_buffers: usize,
    /// How far behind the newest tag a partial datagram may fall before it is
    /// evicted.
    pub stale_tag_distance: u16,
    /// Whether this node is the border router (enables direct forwarding).
    pub is_root: bool,
}

impl Default for FragConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            fragment_buffers: DEFAULT_FRAGMENT_BUFFERS,
            reassembly_buffers: DEFAULT_REASSEMBLY_BUFFERS,
            stale_tag_distance: DEFAULT_STALE_TAG_DISTANCE,
            is_root: false,
        }
    }
}

impl FragConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fragment_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_fragment_size must be greater than 0",
            ));
        }
        if self.max_fragment_size % 8 != 0 {
            return Err(ConfigError::InvalidConfig(
                "max_fragment_size must be a multiple of 8",
            ));
        }
        if self.max_fragment_size > MAX_OFFSET_BYTES.min(MAX_DATAGRAM_SIZE) {
            return Err(ConfigError::InvalidConfig(
                "max_fragment_size must fit the 8-bit offset field",
            ));
        }
        if self.fragment_buffers == 0 {
            return Err(ConfigError::InvalidConfig(
                "fragment_buffers must be greater than 0",
            ));
        }
        if self.reassembly_buffers == 0 {
            return Err(ConfigError::InvalidConfig(
                "reassembly_buffers must be greater than 0",
            ));
        }
        if self.stale_tag_distance == 0 {
            return Err(ConfigError::InvalidConfig(
                "stale_tag_distance must be greater than 0",
            ));
        }
        if self.stale_tag_distance >= 0x8000 {
            return Err(ConfigError::InvalidConfig(
                "stale_tag_distance must be below half the tag space",
            ));
        }
        Ok(())
    }

    /// Defaults overlaid with `LOWPAN_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("LOWPAN_MAX_FRAGMENT_SIZE") {
            config.max_fragment_size = v;
        }
        if let Some(v) = env_parse("LOWPAN_FRAGMENT_BUFFERS") {
            config.fragment_buffers = v;
        }
        if let Some(v) = env_parse("LOWPAN_REASSEMBLY_BUFFERS") {
            config.reassembly_buffers = v;
        }
        if let Some(v) = env_parse("LOWPAN_STALE_TAG_DISTANCE") {
            config.stale_tag_distance = v;
        }
        if let Some(v) = env_flag("LOWPAN_ROOT") {
            config.is_root = v;
        }
        config
    }
}

/// Packet buffer pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of frame-sized buffers.
    pub frame_buffers: usize,
    /// Number of large (reassembly-sized) buffers.
    pub large_buffers: usize,
    /// Usable bytes in a frame buffer, not counting headroom.
    pub frame_capacity: usize,
    /// Usable bytes in a large buffer, not counting headroom.
    pub large_capacity: usize,
    /// Bytes reserved in front of every payload for prepending headers.
    pub headroom: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            frame_buffers: 24,
            large_buffers: 2,
            frame_capacity: IEEE802154_FRAME_SIZE,
            large_capacity: 1280,
            headroom: SUBSEQUENT_HEADER_LEN,
        }
    }
}

impl PoolConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_buffers == 0 {
            return Err(ConfigError::InvalidConfig(
                "frame_buffers must be greater than 0",
            ));
        }
        if self.frame_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "frame_capacity must be greater than 0",
            ));
        }
        if self.large_buffers > 0 && self.large_capacity < self.frame_capacity {
            return Err(ConfigError::InvalidConfig(
                "large_capacity must be >= frame_capacity",
            ));
        }
        if self.frame_buffers + self.large_buffers > u16::MAX as usize {
            return Err(ConfigError::InvalidConfig(
                "pool cannot hold more than 65535 buffers",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    let flag = parse_flag(&raw);
    if flag.is_none() {
        warn!("Ignoring {}={:?}: not a valid flag", name, raw);
    }
    flag
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
