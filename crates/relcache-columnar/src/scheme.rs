use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of per-column compression schemes.
///
/// Selection is cost-based: the encoder estimates the encoded size of
/// every scheme applicable to the column's type and picks the smallest,
/// breaking ties toward the cheaper decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionScheme {
    /// Uncompressed values; the universal fallback.
    Plain,
    /// One bit per boolean value.
    BitPacked,
    /// (value, run length) pairs.
    RunLength,
    /// First value plus zigzag-varint deltas; integers only.
    Delta,
    /// Bounded dictionary plus u32 codes.
    Dictionary,
}

impl CompressionScheme {
    /// Relative decode cost; lower decodes faster. Used to break size ties.
    pub fn decode_rank(&self) -> u8 {
        match self {
            CompressionScheme::Plain => 0,
            CompressionScheme::BitPacked => 1,
            CompressionScheme::RunLength => 2,
            CompressionScheme::Delta => 3,
            CompressionScheme::Dictionary => 4,
        }
    }
}

impl fmt::Display for CompressionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionScheme::Plain => "plain",
            CompressionScheme::BitPacked => "bit-packed",
            CompressionScheme::RunLength => "run-length",
            CompressionScheme::Delta => "delta",
            CompressionScheme::Dictionary => "dictionary",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rank_ordering() {
        assert!(CompressionScheme::Plain.decode_rank() < CompressionScheme::BitPacked.decode_rank());
        assert!(
            CompressionScheme::RunLength.decode_rank() < CompressionScheme::Delta.decode_rank()
        );
        assert!(
            CompressionScheme::Delta.decode_rank() < CompressionScheme::Dictionary.decode_rank()
        );
    }
}
