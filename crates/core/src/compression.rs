//! GZip stream compression for the upload pipeline (spec §2, §4.3).

use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Read;

use crate::error::AgentError;

/// Compress `data` with GZip at the default compression level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, AgentError> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Decompress a GZip stream produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, AgentError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_data() {
        let data = b"hello world ".repeat(100);
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn round_trips_empty_input() {
        let compressed = compress(&[]).unwrap();
        let decompressed = decompress(&compressed).unwrap();
        assert!(decompressed.is_empty());
    }
}
