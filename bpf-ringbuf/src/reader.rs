use crate::common::validate_capacity;
use crate::error::{Result, RingBufError};
use crate::framer::{read_record, Frame, Record};
use crate::memory::Access;
use crate::poller::Poller;
use crate::ringbuf::RingBuf;
use crate::source::{MapType, RingSource};
use crossbeam::utils::Backoff;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;
use tracing::debug;

enum RingState {
    Open { ring: RingBuf, have_data: bool },
    Closed,
}

struct State {
    ring: RingState,
    deadline: Option<Instant>,
}

/// Reads samples submitted by a BPF program (or any producer speaking the
/// same protocol) through a ring buffer.
///
/// The reader is `Sync`: one thread may block in [`read`](Self::read)
/// while another calls [`close`](Self::close) to interrupt it. Reading from
/// several threads at once is memory safe but the threads race for records.
pub struct Reader {
    poller: Poller,
    state: Mutex<State>,
    buffer_size: usize,
}

impl Reader {
    /// Maps the ring of `source` and registers it for wakeups.
    ///
    /// Fails without leaving anything mapped if `source` is not a ring buffer
    /// or its size is not a power-of-two multiple of the page size.
    pub fn new<S: RingSource + ?Sized>(source: &S) -> Result<Self> {
        let map_type = source.map_type();
        if map_type != MapType::RINGBUF {
            return Err(RingBufError::InvalidMapType(map_type));
        }

        let capacity = source.max_entries() as usize;
        validate_capacity(capacity)?;

        let poller = Poller::new(source.wakeup_fd(), source.wakeup_trigger())?;
        let ring = RingBuf::map(source.ring_fd(), capacity, Access::ReadOnly)?;

        debug!(
            capacity,
            consumer_pos = ring.consumer_pos(),
            producer_pos = ring.producer_pos(),
            "ring buffer reader created"
        );

        Ok(Reader {
            poller,
            state: Mutex::new(State {
                ring: RingState::Open {
                    ring,
                    have_data: false,
                },
                deadline: None,
            }),
            buffer_size: capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frees the ring and interrupts a concurrent [`read`](Self::read).
    ///
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.poller.close() {
            Ok(()) | Err(RingBufError::Closed) => {}
            Err(e) => return Err(e),
        }

        // Taking the lock waits for an in-flight read to notice the close.
        let mut state = self.lock();
        if let RingState::Open { .. } = state.ring {
            state.ring = RingState::Closed;
            debug!("ring buffer reader closed");
        }
        Ok(())
    }

    /// Controls how long [`read`](Self::read) and
    /// [`read_into`](Self::read_into) block waiting for samples.
    ///
    /// `None` removes the deadline. A read that is already waiting keeps
    /// the deadline it started with.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.lock().deadline = deadline;
    }

    /// Reads the next record.
    ///
    /// Returns [`RingBufError::Closed`] once the reader is closed and
    /// [`RingBufError::DeadlineExceeded`] if a deadline was set and the ring
    /// stayed empty. A producer that suppresses wakeups can let the deadline
    /// expire while records are present; those are still returned.
    pub fn read(&self) -> Result<Record> {
        let mut record = Record::new();
        self.read_into(&mut record)?;
        Ok(record)
    }

    /// Like [`read`](Self::read), but reuses the buffer of `record`.
    pub fn read_into(&self, record: &mut Record) -> Result<()> {
        let mut guard = self.lock();
        let State { ring, deadline } = &mut *guard;
        let RingState::Open { ring, have_data } = ring else {
            return Err(RingBufError::Closed);
        };

        loop {
            if !*have_data {
                match self.poller.wait(*deadline) {
                    Ok(_) => {}
                    // The producer may have skipped the wakeup.
                    Err(RingBufError::DeadlineExceeded) if !ring.is_empty() => {}
                    Err(e) => return Err(e),
                }
                *have_data = true;
            }

            let backoff = Backoff::new();
            loop {
                match read_record(ring, record)? {
                    Frame::Ready => return Ok(()),
                    Frame::Discarded => continue,
                    Frame::Busy => {
                        // close() is waiting on the lock we hold.
                        if self.poller.is_closed() {
                            return Err(RingBufError::Closed);
                        }
                        backoff.snooze();
                    }
                    Frame::EndOfRing => {
                        *have_data = false;
                        break;
                    }
                }
            }
        }
    }

    /// Size of the ring's data region in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes written by the producer and not yet consumed; zero once closed.
    ///
    /// Never blocks. Returns `None` while another thread is inside
    /// [`read`](Self::read) or [`read_into`](Self::read_into), which own the
    /// ring for the duration of the call.
    pub fn available_bytes(&self) -> Option<usize> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        match &state.ring {
            RingState::Open { ring, .. } => Some(ring.remaining()),
            RingState::Closed => Some(0),
        }
    }

    /// Blocking iterator over records. It ends when the reader is closed;
    /// other errors, including an expired deadline, are yielded.
    pub fn records(&self) -> Records<'_> {
        Records { reader: self }
    }
}

impl<'a> IntoIterator for &'a Reader {
    type Item = Result<Record>;
    type IntoIter = Records<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.records()
    }
}

pub struct Records<'a> {
    reader: &'a Reader,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read() {
            Err(RingBufError::Closed) => None,
            result => Some(result),
        }
    }
}
