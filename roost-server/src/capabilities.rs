//! Capability negotiation for streaming connections.
//!
//! Children either report a sequential protocol version, or, for newer
//! protocols, their full capability bitset. The negotiated bitset is the
//! single source of truth after parsing: the initial handshake response is a
//! pure function of it.

use bitflags::bitflags;

use crate::constants::{
    START_STREAMING_PROMPT_V1, START_STREAMING_PROMPT_V2, START_STREAMING_PROMPT_VN,
};

/// The highest sequential protocol version. Anything above this on the wire
/// is a capability bitset.
const MAX_SEQUENTIAL_VERSION: u32 = 5;

bitflags! {
    /// Features negotiated with a child on connect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StreamCapabilities: u32 {
        /// The original line protocol.
        const V1 = 1 << 0;
        /// The second revision, adding host labels at connect.
        const V2 = 1 << 1;
        /// Versioned prompts: the response carries a version number.
        const VN = 1 << 2;
        /// Capability exchange: version numbers are full bitsets.
        const VCAPS = 1 << 3;
        const HOST_LABELS = 1 << 4;
        const CLAIM = 1 << 5;
        const CHART_LABELS = 1 << 6;
        const LZ4 = 1 << 7;
        const FUNCTIONS = 1 << 8;
        const REPLICATION = 1 << 9;
        const INTERPOLATED = 1 << 10;
        const IEEE754 = 1 << 11;
        const ML_MODELS = 1 << 12;
        const ZSTD = 1 << 13;
        const GZIP = 1 << 14;
        const BROTLI = 1 << 15;

        /// Sentinel for "not negotiated yet". Never survives parsing.
        const INVALID = 1 << 31;
    }
}

/// Compression applied to the child's byte stream after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Zstd,
    Lz4,
    Brotli,
    Gzip,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
            Self::Brotli => "brotli",
            Self::Gzip => "gzip",
        }
    }
}

impl StreamCapabilities {
    /// Everything this server supports.
    pub fn local() -> Self {
        let caps = Self::V1
            | Self::V2
            | Self::VN
            | Self::VCAPS
            | Self::HOST_LABELS
            | Self::CLAIM
            | Self::CHART_LABELS
            | Self::LZ4
            | Self::FUNCTIONS
            | Self::REPLICATION
            | Self::INTERPOLATED
            | Self::IEEE754
            | Self::ML_MODELS
            | Self::ZSTD
            | Self::GZIP
            | Self::BROTLI;

        // The response dispatch checks VCAPS before VN and relies on every
        // VCAPS peer also speaking VN.
        debug_assert!(caps.contains(Self::VCAPS | Self::VN));
        caps
    }

    /// Maps a `ver` parameter to a capability set.
    ///
    /// Sequential versions accumulate features; larger values are the peer's
    /// capability bitset and get intersected with our own.
    pub fn from_version(version: u32) -> Self {
        match version {
            0 | 1 => Self::V1,
            2 => Self::V1 | Self::V2,
            3 => Self::V1 | Self::V2 | Self::VN,
            4 => Self::V1 | Self::V2 | Self::VN | Self::HOST_LABELS,
            5 => Self::V1 | Self::V2 | Self::VN | Self::HOST_LABELS | Self::CLAIM,
            bits => {
                let caps = Self::from_bits_truncate(bits) & Self::local();
                if caps.contains(Self::VCAPS) {
                    caps
                } else {
                    // A peer that claims a bitset without the exchange flag is
                    // not speaking the bitset protocol. Treat it as the
                    // highest sequential version instead.
                    Self::from_version(MAX_SEQUENTIAL_VERSION)
                }
            }
        }
    }

    /// The sequential version equivalent of this capability set.
    pub fn to_version(self) -> u32 {
        if self.contains(Self::CLAIM) {
            5
        } else if self.contains(Self::HOST_LABELS) {
            4
        } else if self.contains(Self::VN) {
            3
        } else if self.contains(Self::V2) {
            2
        } else {
            1
        }
    }

    /// Composes the initial handshake response for this capability set.
    pub fn initial_response(self) -> String {
        if self.contains(Self::VCAPS) {
            format!("{}{}", START_STREAMING_PROMPT_VN, self.bits())
        } else if self.contains(Self::VN) {
            format!("{}{}", START_STREAMING_PROMPT_VN, self.to_version())
        } else if self.contains(Self::V2) {
            START_STREAMING_PROMPT_V2.to_owned()
        } else {
            START_STREAMING_PROMPT_V1.to_owned()
        }
    }

    /// Picks the decompressor for the child's stream, best algorithm first.
    pub fn select_compression(self) -> Option<CompressionAlgorithm> {
        if self.contains(Self::ZSTD) {
            Some(CompressionAlgorithm::Zstd)
        } else if self.contains(Self::LZ4) {
            Some(CompressionAlgorithm::Lz4)
        } else if self.contains(Self::BROTLI) {
            Some(CompressionAlgorithm::Brotli)
        } else if self.contains(Self::GZIP) {
            Some(CompressionAlgorithm::Gzip)
        } else {
            None
        }
    }
}
