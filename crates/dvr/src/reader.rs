//! Position-tracking reader over the shared byte buffer.
//!
//! [`CountingReader`] spawns a fill thread that slurps the input source
//! into a [`ByteRing`] as fast as it can, which lets the decode loop read
//! from pipes with small kernel buffers without ever stalling the writer
//! on the far end. All typed reads are big-endian, matching the container
//! layout.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};

use crate::buffer::{ByteRing, FillOutcome};
use crate::error::Result;

/// Reader façade that tracks the absolute offset of the next byte.
pub struct CountingReader {
    ring: Arc<ByteRing>,
    shutdown: Arc<AtomicBool>,
    fill_thread: Option<JoinHandle<()>>,
    position: u64,
}

impl CountingReader {
    /// Start reading `source` through a freshly allocated buffer.
    pub fn spawn<R: Read + Send + 'static>(source: R) -> Result<Self> {
        Self::with_ring(source, Arc::new(ByteRing::new()))
    }

    /// Start reading `source` through the given buffer.
    pub fn with_ring<R: Read + Send + 'static>(mut source: R, ring: Arc<ByteRing>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let fill_ring = Arc::clone(&ring);
        let fill_shutdown = Arc::clone(&shutdown);
        let fill_thread = std::thread::Builder::new()
            .name("dvr-fill".to_string())
            .spawn(move || {
                while !fill_shutdown.load(Ordering::Relaxed) {
                    match fill_ring.fill_from(&mut source) {
                        Ok(FillOutcome::More) => std::thread::yield_now(),
                        Ok(FillOutcome::Eof) => {
                            debug!("source reached end of input");
                            break;
                        }
                        Err(error) => {
                            // Already recorded in the ring for the reader
                            // side to observe.
                            warn!(%error, "fill thread stopping");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            ring,
            shutdown,
            fill_thread: Some(fill_thread),
            position: 0,
        })
    }

    /// Absolute offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read exactly `dst.len()` bytes, blocking until available.
    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ring.read_exact_into(dst)?;
        self.position += dst.len() as u64;
        Ok(())
    }

    /// Read one unsigned byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read one signed byte.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a big-endian unsigned 16-bit value.
    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    /// Read a big-endian unsigned 32-bit value.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    /// Skip `count` bytes, blocking until they have arrived.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.ring.skip_exact(count)?;
        self.position += count as u64;
        Ok(())
    }

    /// Stop the fill thread and release the source.
    ///
    /// Safe to call more than once; also runs on drop. Closing the ring
    /// unblocks the fill thread within one fill iteration and any blocked
    /// read within one back-off interval.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.ring.close();
        if let Some(handle) = self.fill_thread.take() {
            if handle.join().is_err() {
                warn!("fill thread panicked");
            }
            debug!(position = self.position, "reader closed");
        }
    }
}

impl Drop for CountingReader {
    fn drop(&mut self) {
        self.close();
    }
}
