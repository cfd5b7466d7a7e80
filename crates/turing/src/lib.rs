//! Turing keystream cipher for scrambled DVR transport streams.
//!
//! Every elementary stream in a recording is scrambled with its own
//! keystream, re-keyed once per block (one block covers sixteen transport
//! packets of that stream). The decoder keeps one [`TuringStream`] per
//! elementary stream and re-keys it whenever the block number advances;
//! inside a block the keystream continues across packets, so decryption
//! order must match encryption order.
//!
//! The high-level flow mirrors the decode path of the container:
//!
//! 1. [`derive_stream_key`] turns the media access key and the per-stream
//!    nonce from the file header into a 16-byte stream key.
//! 2. [`TuringHeader::parse`] recovers the stream id and the base block
//!    number from the keying material.
//! 3. [`TuringDecoder::prepare_frame`] selects (and if necessary re-keys)
//!    the per-stream cipher state.
//! 4. [`TuringStream::decrypt_bytes`] XORs keystream into the scrambled
//!    region in place.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod stream;

pub use stream::TuringStream;

/// Size of a per-stream key in bytes.
pub const KEY_SIZE: usize = 16;

/// Size of the per-stream keying material carried by the container header.
pub const MATERIAL_SIZE: usize = 16;

/// Errors reported by the cipher layer.
#[derive(Error, Debug)]
pub enum TuringError {
    #[error("keying material is missing the marker bit: 0x{0:02x}")]
    MissingMarker(u8),

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("no key registered for stream 0x{0:02x}")]
    UnknownStream(u8),
}

/// Result type for cipher operations.
pub type Result<T> = std::result::Result<T, TuringError>;

/// A 16-byte per-stream cipher key.
///
/// The key bytes are zeroized when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TuringKey([u8; KEY_SIZE]);

impl TuringKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a key from a byte slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(TuringError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for TuringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material
        write!(f, "TuringKey([REDACTED])")
    }
}

/// Derive the cipher key for one elementary stream.
///
/// The derivation is a pure function of the media access key, the stream
/// id, and the stream's nonce from the container header; the same inputs
/// always yield the same key.
pub fn derive_stream_key(mak: &str, stream_id: u8, nonce: &[u8; MATERIAL_SIZE]) -> TuringKey {
    let mut hasher = Sha256::new();
    hasher.update(mak.as_bytes());
    hasher.update([stream_id]);
    hasher.update(nonce);
    let digest = hasher.finalize();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    TuringKey(key)
}

/// Fields recovered from the leading bytes of per-stream keying material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuringHeader {
    /// Cipher stream id (7 bits).
    pub stream_id: u8,
    /// Base block number for the stream's first block.
    pub block_number: u32,
}

impl TuringHeader {
    /// Parse stream id and base block number out of keying material.
    ///
    /// Byte 0 carries a marker bit in its MSB and the stream id in the
    /// remaining seven bits; the block number is bit-packed across bytes
    /// 1 through 4.
    pub fn parse(material: &[u8; MATERIAL_SIZE]) -> Result<Self> {
        if material[0] & 0x80 == 0 {
            return Err(TuringError::MissingMarker(material[0]));
        }
        let stream_id = material[0] & 0x7F;
        let block_number = (u32::from(material[1]) << 19)
            | (u32::from(material[2]) << 11)
            | (u32::from(material[3]) << 3)
            | (u32::from(material[4]) >> 5);
        Ok(Self {
            stream_id,
            block_number,
        })
    }
}

/// Registry of per-stream cipher states.
///
/// Streams are registered once, from the container header; afterwards the
/// decode loop calls [`prepare_frame`](Self::prepare_frame) for every
/// scrambled packet and decrypts through the returned stream state.
#[derive(Default)]
pub struct TuringDecoder {
    streams: HashMap<u8, TuringStream>,
}

impl TuringDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key for one elementary stream.
    ///
    /// Registering a stream id twice replaces the previous key and resets
    /// the stream's cipher state.
    pub fn register_stream(&mut self, stream_id: u8, key: TuringKey) {
        self.streams.insert(stream_id, TuringStream::new(key));
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Fetch the cipher state for `stream_id`, keyed for `block_number`.
    ///
    /// Re-keys the stream when the block number differs from the one the
    /// stream is currently keyed for; otherwise the keystream continues
    /// where the previous decrypt stopped.
    pub fn prepare_frame(&mut self, stream_id: u8, block_number: u32) -> Result<&mut TuringStream> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TuringError::UnknownStream(stream_id))?;
        if stream.block_number() != Some(block_number) {
            stream.rekey(block_number);
        }
        Ok(stream)
    }
}

impl fmt::Debug for TuringDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TuringDecoder")
            .field("stream_count", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> TuringKey {
        TuringKey::new(*b"0123456789abcdef")
    }

    #[test]
    fn test_derive_stream_key_deterministic() {
        let nonce = [0x42u8; MATERIAL_SIZE];
        let a = derive_stream_key("0123456789", 0x21, &nonce);
        let b = derive_stream_key("0123456789", 0x21, &nonce);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_stream_key_varies_by_input() {
        let nonce = [0x42u8; MATERIAL_SIZE];
        let base = derive_stream_key("0123456789", 0x21, &nonce);
        let other_mak = derive_stream_key("9876543210", 0x21, &nonce);
        let other_id = derive_stream_key("0123456789", 0x22, &nonce);
        let other_nonce = derive_stream_key("0123456789", 0x21, &[0x43u8; MATERIAL_SIZE]);
        assert_ne!(base.as_bytes(), other_mak.as_bytes());
        assert_ne!(base.as_bytes(), other_id.as_bytes());
        assert_ne!(base.as_bytes(), other_nonce.as_bytes());
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(TuringKey::from_slice(&[0u8; KEY_SIZE]).is_ok());
        assert!(matches!(
            TuringKey::from_slice(&[0u8; 8]),
            Err(TuringError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_key_debug_redacts() {
        let key = test_key();
        assert_eq!(format!("{key:?}"), "TuringKey([REDACTED])");
    }

    #[test]
    fn test_header_parse() {
        let mut material = [0u8; MATERIAL_SIZE];
        material[0] = 0x80 | 0x21;
        material[1] = 0x00;
        material[2] = 0x00;
        material[3] = 0x00;
        material[4] = 0x20; // 0x20 >> 5 == 1
        let header = TuringHeader::parse(&material).unwrap();
        assert_eq!(header.stream_id, 0x21);
        assert_eq!(header.block_number, 1);
    }

    #[test]
    fn test_header_parse_bit_packing() {
        let mut material = [0u8; MATERIAL_SIZE];
        material[0] = 0xFF;
        material[1] = 0x01;
        material[2] = 0x01;
        material[3] = 0x01;
        material[4] = 0xE0;
        let header = TuringHeader::parse(&material).unwrap();
        assert_eq!(header.stream_id, 0x7F);
        assert_eq!(header.block_number, (1 << 19) | (1 << 11) | (1 << 3) | 7);
    }

    #[test]
    fn test_header_parse_missing_marker() {
        let material = [0u8; MATERIAL_SIZE];
        assert!(matches!(
            TuringHeader::parse(&material),
            Err(TuringError::MissingMarker(0))
        ));
    }

    #[test]
    fn test_prepare_frame_unknown_stream() {
        let mut decoder = TuringDecoder::new();
        assert!(matches!(
            decoder.prepare_frame(0x21, 0),
            Err(TuringError::UnknownStream(0x21))
        ));
    }

    #[test]
    fn test_decrypt_round_trip() {
        let mut decoder = TuringDecoder::new();
        decoder.register_stream(0x21, test_key());

        let plaintext = b"a scrambled transport packet payload".to_vec();
        let mut data = plaintext.clone();

        let stream = decoder.prepare_frame(0x21, 0).unwrap();
        stream.decrypt_bytes(&mut data);
        assert_ne!(data, plaintext);

        // Re-keying for a different block and back resets the keystream.
        decoder.prepare_frame(0x21, 1).unwrap();
        let stream = decoder.prepare_frame(0x21, 0).unwrap();
        stream.decrypt_bytes(&mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_keystream_continues_within_block() {
        let mut one_pass = vec![0u8; 64];
        let mut two_pass = vec![0u8; 64];

        let mut decoder = TuringDecoder::new();
        decoder.register_stream(0x21, test_key());
        decoder
            .prepare_frame(0x21, 7)
            .unwrap()
            .decrypt_bytes(&mut one_pass);

        let mut decoder = TuringDecoder::new();
        decoder.register_stream(0x21, test_key());
        let (head, tail) = two_pass.split_at_mut(20);
        decoder.prepare_frame(0x21, 7).unwrap().decrypt_bytes(head);
        decoder.prepare_frame(0x21, 7).unwrap().decrypt_bytes(tail);

        assert_eq!(one_pass, two_pass);
    }

    #[test]
    fn test_keystream_differs_across_blocks_and_streams() {
        let mut decoder = TuringDecoder::new();
        decoder.register_stream(0x21, test_key());
        decoder.register_stream(0x22, test_key());

        let mut block0 = vec![0u8; 32];
        let mut block1 = vec![0u8; 32];
        let mut other = vec![0u8; 32];

        decoder
            .prepare_frame(0x21, 0)
            .unwrap()
            .decrypt_bytes(&mut block0);
        decoder
            .prepare_frame(0x21, 1)
            .unwrap()
            .decrypt_bytes(&mut block1);
        decoder
            .prepare_frame(0x22, 0)
            .unwrap()
            .decrypt_bytes(&mut other);

        assert_ne!(block0, block1);
        // Same key, same block: stream id does not enter the schedule.
        assert_eq!(block0, other);
    }
}
