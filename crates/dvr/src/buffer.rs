//! Shared byte buffer between the fill thread and the decode loop.
//!
//! One thread appends bytes pulled from the input source while the decode
//! loop consumes them; the buffer expands instead of applying
//! backpressure, so a producer that runs ahead of the consumer never
//! blocks and the pair cannot deadlock. Consumed regions are reclaimed by
//! shifting the live bytes back to offset zero once the read position has
//! moved past most of the allocation.

use std::io::Read;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{DvrError, Result};

/// Initial (and minimum) buffer capacity.
pub const INITIAL_CAPACITY: usize = 16 * 1024 * 1024;

/// Upper bound on one pull from the source, to bound lock hold time.
pub const MAX_FILL_SIZE: usize = 64 * 1024;

/// When the read position passes this fraction of the capacity, live
/// bytes are shifted back to offset zero.
const COMPACT_RATIO: f64 = 0.9;

/// Consumer wake-up back-off; bounds cancellation latency even if a
/// wakeup is missed.
const READ_BACKOFF: Duration = Duration::from_millis(5);

/// Outcome of one [`ByteRing::fill_from`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Bytes were appended; the source may have more.
    More,
    /// The source reported end of input; no further fills will succeed.
    Eof,
}

/// A producer-side failure, replayed to the consumer on every read that
/// cannot be satisfied.
#[derive(Debug, Clone)]
enum Failure {
    Exhausted(usize),
    Io(std::io::ErrorKind, String),
}

impl Failure {
    fn to_error(&self) -> DvrError {
        match self {
            Failure::Exhausted(capacity) => DvrError::BufferExhausted(*capacity),
            Failure::Io(kind, message) => {
                DvrError::Io(std::io::Error::new(*kind, message.clone()))
            }
        }
    }
}

#[derive(Debug)]
struct State {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    source_closed: bool,
    failure: Option<Failure>,
}

impl State {
    fn available(&self) -> usize {
        self.write_pos - self.read_pos
    }
}

/// Expanding single-producer/single-consumer byte buffer.
#[derive(Debug)]
pub struct ByteRing {
    state: Mutex<State>,
    data_ready: Condvar,
    min_capacity: usize,
}

impl ByteRing {
    /// Create a ring with the default 16 MiB capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Create a ring with a custom initial capacity, which also acts as
    /// the floor when compaction shrinks the allocation.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                data: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
                source_closed: false,
                failure: None,
            }),
            data_ready: Condvar::new(),
            min_capacity: capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pull up to [`MAX_FILL_SIZE`] bytes from `source` into the buffer.
    ///
    /// Doubles the capacity when the write position has reached the end
    /// of the allocation, and compacts after the read once the read
    /// position has passed the compaction threshold. Source errors and a
    /// failed capacity doubling are recorded so the next consumer read
    /// observes them.
    pub fn fill_from(&self, source: &mut impl Read) -> Result<FillOutcome> {
        let mut state = self.lock();
        if state.source_closed {
            return Ok(FillOutcome::Eof);
        }

        if state.write_pos == state.data.len() {
            let Some(next_capacity) = state.data.len().checked_mul(2) else {
                let capacity = state.data.len();
                state.failure = Some(Failure::Exhausted(capacity));
                state.source_closed = true;
                self.data_ready.notify_all();
                return Err(DvrError::BufferExhausted(capacity));
            };
            debug!(
                from = state.data.len(),
                to = next_capacity,
                read_pos = state.read_pos,
                write_pos = state.write_pos,
                "expanding stream buffer"
            );
            Self::resize(&mut state, next_capacity);
        }

        let limit = (state.data.len() - state.write_pos).min(MAX_FILL_SIZE);
        let write_pos = state.write_pos;
        let read = source.read(&mut state.data[write_pos..write_pos + limit]);
        match read {
            Ok(0) => {
                state.source_closed = true;
                self.data_ready.notify_all();
                Ok(FillOutcome::Eof)
            }
            Ok(count) => {
                trace!(bytes = count, "filled from source");
                state.write_pos += count;
                self.compact_if_needed(&mut state);
                self.data_ready.notify_all();
                Ok(FillOutcome::More)
            }
            Err(error) => {
                warn!(%error, "source read failed");
                state.failure = Some(Failure::Io(error.kind(), error.to_string()));
                state.source_closed = true;
                self.data_ready.notify_all();
                Err(DvrError::Io(error))
            }
        }
    }

    fn compact_if_needed(&self, state: &mut State) {
        if state.read_pos as f64 > state.data.len() as f64 * COMPACT_RATIO {
            let target = (state.available() * 2).max(self.min_capacity);
            debug!(
                read_pos = state.read_pos,
                capacity = target,
                "compacting stream buffer"
            );
            Self::resize(state, target);
        }
    }

    /// Move live bytes to offset zero, rebasing both positions, resizing
    /// the allocation when the target capacity differs.
    fn resize(state: &mut State, capacity: usize) {
        if capacity == state.data.len() {
            let (read_pos, write_pos) = (state.read_pos, state.write_pos);
            state.data.copy_within(read_pos..write_pos, 0);
        } else {
            let mut next = vec![0u8; capacity];
            next[..state.available()].copy_from_slice(&state.data[state.read_pos..state.write_pos]);
            state.data = next;
        }
        state.write_pos -= state.read_pos;
        state.read_pos = 0;
    }

    /// Copy exactly `dst.len()` bytes out of the buffer, blocking until
    /// they are available.
    ///
    /// Fails with [`DvrError::UnexpectedEof`] when the source closes with
    /// fewer bytes buffered, or replays a recorded producer failure.
    pub fn read_exact_into(&self, dst: &mut [u8]) -> Result<()> {
        let mut state = self.lock();
        loop {
            let available = state.available();
            if available >= dst.len() {
                let read_pos = state.read_pos;
                dst.copy_from_slice(&state.data[read_pos..read_pos + dst.len()]);
                state.read_pos += dst.len();
                return Ok(());
            }
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            if state.source_closed {
                return Err(DvrError::UnexpectedEof {
                    needed: dst.len(),
                    available,
                });
            }
            trace!(
                needed = dst.len() - available,
                "waiting for the fill thread"
            );
            state = self
                .data_ready
                .wait_timeout(state, READ_BACKOFF)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Advance the read position by `count` bytes, blocking like
    /// [`read_exact_into`](Self::read_exact_into).
    pub fn skip_exact(&self, count: usize) -> Result<()> {
        let mut state = self.lock();
        loop {
            let available = state.available();
            if available >= count {
                state.read_pos += count;
                return Ok(());
            }
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            if state.source_closed {
                return Err(DvrError::UnexpectedEof {
                    needed: count,
                    available,
                });
            }
            state = self
                .data_ready
                .wait_timeout(state, READ_BACKOFF)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Mark the source as closed and wake any blocked reader.
    ///
    /// Used for consumer-side cancellation; the flag never reverts.
    pub fn close(&self) {
        let mut state = self.lock();
        state.source_closed = true;
        self.data_ready.notify_all();
    }

    /// Whether the source has been closed (end of input, failure, or
    /// cancellation).
    pub fn is_closed(&self) -> bool {
        self.lock().source_closed
    }

    /// Number of buffered bytes not yet consumed.
    pub fn available(&self) -> usize {
        self.lock().available()
    }

    /// Current capacity of the backing allocation.
    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        Self::new()
    }
}
