use crate::error::PipelineError;

/// Upper bound for the decompressed size of a single packet. Legitimate packets are a few KB at
///  most, so anything bigger is either corrupt or a decompression bomb.
pub const MAX_DECOMPRESSED_LEN: usize = 1024 * 1024;

/// What kind of data is being compressed, chosen from the serialization format in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionHint {
    /// JSON text: highly redundant, worth the extra effort of the maximum level
    Text,
    /// binary map encoding: less redundancy to find
    Generic,
}
impl CompressionHint {
    pub fn level(&self) -> i32 {
        match self {
            CompressionHint::Text => 19,
            CompressionHint::Generic => 15,
        }
    }
}

/// Single-pass zstd compression of a serialized batch. There is no second pass after
///  encryption: ciphertext is indistinguishable from random data and does not compress.
pub fn compress(data: &[u8], hint: CompressionHint) -> Result<Vec<u8>, PipelineError> {
    zstd::bulk::compress(data, hint.level())
        .map_err(PipelineError::Compression)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    zstd::bulk::decompress(data, MAX_DECOMPRESSED_LEN)
        .map_err(PipelineError::Decompression)
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::text_empty(CompressionHint::Text, b"".to_vec())]
    #[case::text(CompressionHint::Text, br#"{"0":{"context":"vessels.self","updates":[]}}"#.repeat(20))]
    #[case::generic(CompressionHint::Generic, (0..=255u8).cycle().take(3000).collect())]
    fn test_round_trip(#[case] hint: CompressionHint, #[case] data: Vec<u8>) {
        let compressed = compress(&data, hint).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_redundant_text_shrinks() {
        let data = br#"{"path":"navigation.speedOverGround","value":3.2}"#.repeat(30);
        let compressed = compress(&data, CompressionHint::Text).unwrap();
        assert!(compressed.len() * 10 < data.len());
    }

    #[test]
    fn test_corrupt_input() {
        assert!(matches!(decompress(b"definitely not zstd"), Err(PipelineError::Decompression(_))));
    }

    #[test]
    fn test_size_cap() {
        let data = vec![0u8; MAX_DECOMPRESSED_LEN + 1];
        let compressed = compress(&data, CompressionHint::Generic).unwrap();
        assert!(matches!(decompress(&compressed), Err(PipelineError::Decompression(_))));
    }
}
