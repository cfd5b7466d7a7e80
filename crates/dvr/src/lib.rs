//! Decoder for encrypted DVR transport-stream containers.
//!
//! A recording is a fixed header (stream table plus keying material)
//! followed by 188-byte transport packets in which selected payloads are
//! scrambled with a per-stream Turing keystream. [`decode`] restores the
//! plain transport stream: PES headers and all TS framing pass through
//! bit-for-bit, scrambled regions are decrypted in place, and the
//! scrambling-control bits come out cleared.
//!
//! Input is pulled by a dedicated fill thread through an expanding shared
//! buffer, so piped sources never stall on a full kernel buffer while the
//! decode loop is busy.

pub mod buffer;
pub mod container;
pub mod error;
pub mod mpeg;
pub mod packet;
pub mod processor;
pub mod reader;
mod stream;

pub use buffer::{ByteRing, FillOutcome};
pub use container::{FileHeader, StreamDescriptor};
pub use error::{DvrError, Result};
pub use packet::{TsPacket, PACKET_SIZE, SYNC_BYTE};
pub use processor::{DecodeStats, TsProcessor};
pub use reader::CountingReader;
pub use stream::StreamType;

use std::io::{Read, Write};

/// Decode a whole recording from `source` into `sink`.
///
/// Spawns the fill thread, parses the container header, and runs the
/// transport processor to end of input. Output written before a failure
/// stays in the sink.
pub fn decode<R, W>(source: R, mak: &str, sink: W) -> Result<DecodeStats>
where
    R: Read + Send + 'static,
    W: Write,
{
    let mut reader = CountingReader::spawn(source)?;
    let header = FileHeader::read_from(&mut reader)?;
    let mut processor = TsProcessor::new(&header, mak, sink);
    let stats = processor.process(&mut reader);
    reader.close();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use turing::{derive_stream_key, TuringDecoder, TuringHeader, MATERIAL_SIZE};

    const MAK: &str = "4927615308";
    const VIDEO_ID: u8 = 0x21;
    const AUDIO_ID: u8 = 0x22;

    fn nonce(stream_id: u8) -> [u8; MATERIAL_SIZE] {
        let mut nonce = [0u8; MATERIAL_SIZE];
        nonce[0] = 0x80 | stream_id;
        nonce[10] = stream_id.wrapping_mul(3);
        nonce
    }

    fn build_container(packets: &[[u8; PACKET_SIZE]]) -> Vec<u8> {
        let descriptors = [(VIDEO_ID, 0x02u8), (AUDIO_ID, 0x81u8)];
        let mpeg_offset = (14 + 18 * descriptors.len()) as u32;

        let mut data = Vec::new();
        data.extend_from_slice(&container::MAGIC);
        data.extend_from_slice(&container::FLAG_TRANSPORT.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&mpeg_offset.to_be_bytes());
        data.extend_from_slice(&(descriptors.len() as u16).to_be_bytes());
        for (stream_id, stream_type) in descriptors {
            data.push(stream_id);
            data.push(stream_type);
            data.extend_from_slice(&nonce(stream_id));
        }
        for packet in packets {
            data.extend_from_slice(packet);
        }
        data
    }

    fn scrambled_pes_packet(stream_id: u8, header_data_length: u8, fill: u8) -> [u8; PACKET_SIZE] {
        let mut packet = [fill; PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x40;
        packet[2] = stream_id;
        packet[3] = 0xD0;
        packet[4..8].copy_from_slice(&[0x00, 0x00, 0x01, 0xE0]);
        packet[8..10].copy_from_slice(&[0x00, 0x00]);
        packet[10] = 0x80;
        packet[11] = 0x80;
        packet[12] = header_data_length;
        for stuffing in packet.iter_mut().skip(13).take(header_data_length as usize) {
            *stuffing = 0xFF;
        }
        packet
    }

    #[test]
    fn test_decode_mixed_streams_end_to_end() {
        // One scrambled video PES, one clear audio continuation, one
        // packet on an unannounced PID.
        let mut video = scrambled_pes_packet(VIDEO_ID, 3, 0x33);
        let mut video_clear = video;
        video_clear[3] &= 0x3F;

        let mut audio = [0x44u8; PACKET_SIZE];
        audio[0] = SYNC_BYTE;
        audio[1] = 0x00;
        audio[2] = AUDIO_ID;
        audio[3] = 0x11;

        let mut other = [0x55u8; PACKET_SIZE];
        other[0] = SYNC_BYTE;
        other[1] = 0x00;
        other[2] = 0x77;
        other[3] = 0x12;

        // Scramble the video payload after its 12-byte PES header with
        // the keystream the decoder will derive.
        let material = nonce(VIDEO_ID);
        let fields = TuringHeader::parse(&material).unwrap();
        let mut reference = TuringDecoder::new();
        reference.register_stream(VIDEO_ID, derive_stream_key(MAK, VIDEO_ID, &material));
        reference
            .prepare_frame(fields.stream_id, fields.block_number)
            .unwrap()
            .decrypt_bytes(&mut video[4 + 12..]);

        let data = build_container(&[video, audio, other]);
        let mut output = Vec::new();
        let stats = decode(Cursor::new(data), MAK, &mut output).unwrap();

        assert_eq!(stats.packets_in, 3);
        assert_eq!(stats.packets_out, 3);
        assert_eq!(stats.bytes_out, output.len() as u64);
        assert_eq!(&output[..PACKET_SIZE], &video_clear[..]);
        assert_eq!(&output[PACKET_SIZE..2 * PACKET_SIZE], &audio[..]);
        assert_eq!(&output[2 * PACKET_SIZE..], &other[..]);
    }

    #[test]
    fn test_decode_empty_body() {
        let data = build_container(&[]);
        let mut output = Vec::new();
        let stats = decode(Cursor::new(data), MAK, &mut output).unwrap();
        assert_eq!(stats, DecodeStats::default());
        assert!(output.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut output = Vec::new();
        let result = decode(Cursor::new(vec![0u8; 64]), MAK, &mut output);
        assert!(matches!(result, Err(DvrError::BadMagic(_))));
    }

    #[test]
    fn test_decode_file_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("recording.rec");
        let output_path = dir.path().join("recording.ts");

        let packets = [[0x66u8; PACKET_SIZE]; 3].map(|mut packet| {
            packet[0] = SYNC_BYTE;
            packet[1] = 0x00;
            packet[2] = VIDEO_ID;
            packet[3] = 0x10;
            packet
        });
        std::fs::write(&input_path, build_container(&packets)).unwrap();

        let input = std::fs::File::open(&input_path).unwrap();
        let output = std::fs::File::create(&output_path).unwrap();
        let stats = decode(input, MAK, output).unwrap();

        assert_eq!(stats.packets_out, 3);
        let written = std::fs::read(&output_path).unwrap();
        assert_eq!(written.len(), 3 * PACKET_SIZE);
        assert_eq!(&written[..PACKET_SIZE], &packets[0][..]);
    }
}
