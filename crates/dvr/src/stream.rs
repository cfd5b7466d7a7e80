//! Per-elementary-stream buffering and selective decryption.
//!
//! When a packet starts a PES unit, the end of the plaintext PES headers
//! may lie in a later packet of the same stream, so packets are held in a
//! queue until the header boundary is known. The combined payload of the
//! queue is rescanned on every arrival; once the scanner accounts for
//! strictly fewer bytes than are buffered, the boundary is inside the
//! newest packet, the header bytes are distributed across the queue, and
//! everything is decrypted and flushed in order.

use std::collections::VecDeque;
use std::io::Write;

use bytes::BytesMut;
use tracing::{trace, warn};

use turing::{TuringDecoder, TuringHeader, MATERIAL_SIZE};

use crate::error::Result;
use crate::mpeg;
use crate::packet::TsPacket;

/// Scratch capacity: up to ten packet payloads are combined for scanning.
const SCRATCH_CAPACITY: usize = 188 * 10;

/// Packets per cipher block.
const PACKETS_PER_BLOCK: u32 = 16;

/// Coarse classification of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Audio,
    Video,
    PrivateData,
    Other,
    None,
}

impl StreamType {
    /// Map a container stream-type code onto a classification.
    /// Unknown codes fall back to private data.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 | 0x02 | 0x10 | 0x1B | 0x80 | 0xEA => StreamType::Video,
            0x03 | 0x04 | 0x0F | 0x11 | 0x81 | 0x8A => StreamType::Audio,
            0x05..=0x0E | 0x12..=0x1A | 0x7F => StreamType::Other,
            0x00 => StreamType::None,
            _ => StreamType::PrivateData,
        }
    }
}

/// What became of a packet group handed to [`StreamDecryptor::add_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Emitted(pub u64);

/// Decrypt state machine for one PID.
pub(crate) struct StreamDecryptor {
    stream_type: StreamType,
    key_material: [u8; MATERIAL_SIZE],
    pending: VecDeque<TsPacket>,
    scratch: BytesMut,
    header_lengths: Vec<u32>,
    packet_count: u32,
}

impl StreamDecryptor {
    pub(crate) fn new(stream_type: StreamType, key_material: [u8; MATERIAL_SIZE]) -> Self {
        Self {
            stream_type,
            key_material,
            pending: VecDeque::new(),
            scratch: BytesMut::with_capacity(SCRATCH_CAPACITY),
            header_lengths: Vec::new(),
            packet_count: 0,
        }
    }

    /// Feed one packet through the Idle/Buffering/Flush machine.
    ///
    /// Returns how many frames were written to `sink`. A scanner failure
    /// is an error; a packet group too large for the scratch buffer is
    /// dropped with a warning and processing resumes at the next PES
    /// start.
    pub(crate) fn add_packet<W: Write>(
        &mut self,
        packet: TsPacket,
        decoder: &mut TuringDecoder,
        sink: &mut W,
    ) -> Result<Emitted> {
        if packet.payload_start() || !self.pending.is_empty() {
            self.pending.push_back(packet);

            if !self.combine_payloads() {
                warn!(
                    stream_type = ?self.stream_type,
                    pending = self.pending.len(),
                    "packet group exceeds the scratch buffer, discarding"
                );
                self.pending.clear();
                return Ok(Emitted(0));
            }

            match self.locate_pes_boundary() {
                Ok(true) => self.decrypt_and_flush(decoder, sink),
                Ok(false) => Ok(Emitted(0)),
                Err(error) => {
                    self.pending.clear();
                    Err(error)
                }
            }
        } else {
            // No PES start in flight: single-packet fast path.
            self.pending.push_back(packet);
            self.decrypt_and_flush(decoder, sink)
        }
    }

    /// Flush whatever is still buffered when the input ends.
    ///
    /// A group can only be pending here because every buffered byte is
    /// PES header, so each packet flushes with a full-payload header
    /// offset and an empty decrypt region.
    pub(crate) fn finish<W: Write>(
        &mut self,
        decoder: &mut TuringDecoder,
        sink: &mut W,
    ) -> Result<Emitted> {
        if self.pending.is_empty() {
            return Ok(Emitted(0));
        }
        trace!(
            pending = self.pending.len(),
            "flushing header-only tail at end of input"
        );
        for packet in self.pending.iter_mut() {
            let payload_len = packet.payload_len();
            packet.set_pes_header_offset(payload_len);
        }
        self.decrypt_and_flush(decoder, sink)
    }

    /// Form one contiguous buffer out of all buffered packet payloads.
    fn combine_payloads(&mut self) -> bool {
        let total: usize = self.pending.iter().map(TsPacket::payload_len).sum();
        if total > SCRATCH_CAPACITY {
            return false;
        }
        self.scratch.clear();
        for packet in &self.pending {
            self.scratch.extend_from_slice(packet.payload());
        }
        true
    }

    /// Rescan the combined payload and, if the PES headers end inside it,
    /// spread the header byte count over the queued packets.
    ///
    /// Returns whether the queue is ready to flush.
    fn locate_pes_boundary(&mut self) -> Result<bool> {
        self.header_lengths = mpeg::scan_header_lengths(&self.scratch)?;
        let header_bits: u64 = self.header_lengths.iter().map(|&bits| u64::from(bits)).sum();
        let header_bytes = (header_bits / 8) as usize;

        if header_bytes >= self.scratch.len() {
            // Everything buffered so far is still header.
            return Ok(false);
        }

        let mut remaining = header_bytes;
        for packet in self.pending.iter_mut() {
            if remaining == 0 {
                break;
            }
            let payload_len = packet.payload_len();
            if remaining >= payload_len {
                packet.set_pes_header_offset(payload_len);
                remaining -= payload_len;
            } else {
                packet.set_pes_header_offset(remaining);
                remaining = 0;
            }
        }
        Ok(true)
    }

    /// Drain the queue in order, decrypting scrambled packets.
    fn decrypt_and_flush<W: Write>(
        &mut self,
        decoder: &mut TuringDecoder,
        sink: &mut W,
    ) -> Result<Emitted> {
        let mut emitted = 0u64;
        while let Some(mut packet) = self.pending.pop_front() {
            let sequence = self.packet_count;
            self.packet_count += 1;

            if packet.is_scrambled() {
                packet.clear_scrambled();
                let start = packet.payload_offset() + packet.pes_header_offset();
                let mut cleartext = packet.bytes()[start..].to_vec();
                if !cleartext.is_empty() {
                    self.decrypt(decoder, sequence, &mut cleartext)?;
                }
                sink.write_all(&packet.scrambled_bytes(&cleartext))?;
            } else {
                sink.write_all(packet.bytes())?;
            }
            emitted += 1;
        }
        Ok(Emitted(emitted))
    }

    fn decrypt(
        &self,
        decoder: &mut TuringDecoder,
        sequence: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let header = TuringHeader::parse(&self.key_material)?;
        let block_number = header.block_number + sequence / PACKETS_PER_BLOCK;
        let stream = decoder.prepare_frame(header.stream_id, block_number)?;
        stream.decrypt_bytes(buf);
        Ok(())
    }
}
