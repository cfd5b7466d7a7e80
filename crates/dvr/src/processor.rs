//! Packet framing and PID routing for a whole recording.

use std::collections::HashMap;
use std::io::Write;

use tracing::{debug, info, warn};

use turing::{derive_stream_key, TuringDecoder};

use crate::container::FileHeader;
use crate::error::{DvrError, Result};
use crate::packet::{TsPacket, PACKET_SIZE};
use crate::reader::CountingReader;
use crate::stream::{StreamDecryptor, StreamType};

/// Counters reported by a completed decode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    /// Packets framed from the input.
    pub packets_in: u64,
    /// Packets written to the sink.
    pub packets_out: u64,
    /// Bytes written to the sink.
    pub bytes_out: u64,
}

/// Drives the decode: frames packets off the reader, routes them to the
/// per-PID decryptors, and writes cleartext frames to the sink.
///
/// Packets on PIDs the container header never announced pass through
/// untouched, which covers recordings that begin mid-stream.
pub struct TsProcessor<W: Write> {
    streams: HashMap<u16, StreamDecryptor>,
    decoder: TuringDecoder,
    sink: W,
    stats: DecodeStats,
}

impl<W: Write> TsProcessor<W> {
    /// Build a processor for the streams announced by `header`.
    pub fn new(header: &FileHeader, mak: &str, sink: W) -> Self {
        let mut decoder = TuringDecoder::new();
        let mut streams = HashMap::new();

        for descriptor in &header.streams {
            let stream_type = StreamType::from_code(descriptor.stream_type);
            let key = derive_stream_key(mak, descriptor.stream_id, &descriptor.initial_nonce);
            decoder.register_stream(descriptor.stream_id, key);
            streams.insert(
                u16::from(descriptor.stream_id),
                StreamDecryptor::new(stream_type, descriptor.initial_nonce),
            );
            debug!(
                stream_id = descriptor.stream_id,
                ?stream_type,
                "registered elementary stream"
            );
        }

        Self {
            streams,
            decoder,
            sink,
            stats: DecodeStats::default(),
        }
    }

    /// Decode every packet until the input ends.
    ///
    /// Any failure aborts the decode; frames already written stay in the
    /// sink. Buffered header-only tails are flushed at end of input so
    /// the output packet count matches the input packet count.
    pub fn process(&mut self, reader: &mut CountingReader) -> Result<DecodeStats> {
        let mut frame = [0u8; PACKET_SIZE];
        loop {
            match reader.read_exact(&mut frame) {
                Ok(()) => {}
                Err(DvrError::UnexpectedEof { available: 0, .. }) => break,
                Err(error @ DvrError::UnexpectedEof { .. }) => {
                    warn!(position = reader.position(), "input ended mid-packet");
                    return Err(error);
                }
                Err(error) => return Err(error),
            }
            self.stats.packets_in += 1;

            let packet = TsPacket::parse(&frame)?;
            match self.streams.get_mut(&packet.pid()) {
                Some(stream) => {
                    let emitted = stream.add_packet(packet, &mut self.decoder, &mut self.sink)?;
                    self.count_emitted(emitted.0);
                }
                None => {
                    self.sink.write_all(packet.bytes())?;
                    self.count_emitted(1);
                }
            }
        }

        for stream in self.streams.values_mut() {
            let emitted = stream.finish(&mut self.decoder, &mut self.sink)?;
            self.stats.packets_out += emitted.0;
            self.stats.bytes_out += emitted.0 * PACKET_SIZE as u64;
        }
        self.sink.flush()?;

        info!(
            packets_in = self.stats.packets_in,
            packets_out = self.stats.packets_out,
            bytes_out = self.stats.bytes_out,
            "decode complete"
        );
        Ok(self.stats)
    }

    fn count_emitted(&mut self, frames: u64) {
        self.stats.packets_out += frames;
        self.stats.bytes_out += frames * PACKET_SIZE as u64;
    }

    /// Consume the processor and hand the sink back.
    pub fn into_sink(self) -> W {
        self.sink
    }
}
