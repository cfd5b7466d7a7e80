//! Container header parsing.
//!
//! A recording starts with a fixed header naming the elementary streams
//! and where the transport packets begin; everything between the stream
//! table and `mpeg_offset` is opaque recorder metadata the decoder skips.
//! All integers are big-endian.

use tracing::debug;

use turing::MATERIAL_SIZE;

use crate::error::{DvrError, Result};
use crate::reader::CountingReader;

/// File magic, first four bytes of every recording.
pub const MAGIC: [u8; 4] = *b"TVDR";

/// Flag bit marking the transport-stream variant.
pub const FLAG_TRANSPORT: u16 = 0x0001;

/// One elementary stream announced by the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Stream id; also the PID its packets are carried on.
    pub stream_id: u8,
    /// Stream-type code (see the stream-type map).
    pub stream_type: u8,
    /// Per-stream keying material.
    pub initial_nonce: [u8; MATERIAL_SIZE],
}

/// Parsed container header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Variant flags.
    pub flags: u16,
    /// Absolute offset of the first transport packet.
    pub mpeg_offset: u32,
    /// Announced elementary streams.
    pub streams: Vec<StreamDescriptor>,
}

impl FileHeader {
    /// Parse the header and leave `reader` positioned on the first
    /// transport packet.
    pub fn read_from(reader: &mut CountingReader) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DvrError::BadMagic(magic));
        }

        let flags = reader.read_u16()?;
        let _reserved = reader.read_u16()?;
        let mpeg_offset = reader.read_u32()?;
        if flags & FLAG_TRANSPORT == 0 {
            return Err(DvrError::UnsupportedFormat("program stream"));
        }

        let stream_count = reader.read_u16()?;
        let mut streams = Vec::with_capacity(usize::from(stream_count));
        for _ in 0..stream_count {
            let stream_id = reader.read_u8()?;
            let stream_type = reader.read_u8()?;
            let mut initial_nonce = [0u8; MATERIAL_SIZE];
            reader.read_exact(&mut initial_nonce)?;
            streams.push(StreamDescriptor {
                stream_id,
                stream_type,
                initial_nonce,
            });
        }

        let position = reader.position();
        if u64::from(mpeg_offset) < position {
            return Err(DvrError::MalformedHeader(format!(
                "mpeg offset {mpeg_offset} lies inside the stream table (ends at {position})"
            )));
        }
        reader.skip((u64::from(mpeg_offset) - position) as usize)?;

        debug!(
            flags,
            mpeg_offset,
            streams = streams.len(),
            "parsed container header"
        );
        Ok(Self {
            flags,
            mpeg_offset,
            streams,
        })
    }
}
