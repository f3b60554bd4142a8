use crate::{
    common::{
        round_up_to_8, unlikely, validate_capacity, BUSY_FLAG, DISCARD_FLAG, HEADER_SIZE,
        MAX_RECORD_LEN,
    },
    doorbell::Doorbell,
    error::{Result, RingBufError},
    memory::Access,
    ring_trace,
    ringbuf::RingBuf,
};
use nix::sys::stat::fstat;
use spinning_top::Spinlock;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupStrategy {
    /// Notify the reader after every commit or discard.
    Forced,
    /// Never notify; the reader only finds records when its deadline expires
    /// or another wakeup arrives (`BPF_RB_NO_WAKEUP`).
    NoWakeup,
}

/// User-space producer writing records in the kernel's format.
///
/// Reservations are serialized by a process-local spinlock, so one
/// `Producer` can be shared by many threads.
pub struct Producer {
    ringbuf: RingBuf,
    doorbell: Doorbell,
    wakeup_strategy: WakeupStrategy,
    lock: Spinlock<()>,
}

fn ensure_open(fd: &OwnedFd) -> Result<()> {
    fstat(fd).map_err(|errno| RingBufError::Io(std::io::Error::from(errno)))?;
    Ok(())
}

impl Producer {
    /// Maps a ring from its memfd and the eventfd the reader polls, as handed
    /// out by [`MemfdRing::memory_fd`](crate::MemfdRing::memory_fd) and
    /// [`MemfdRing::notification_fd`](crate::MemfdRing::notification_fd),
    /// possibly after crossing a process boundary.
    pub fn new(
        memory_fd: OwnedFd,
        notification_fd: OwnedFd,
        capacity: usize,
        wakeup_strategy: WakeupStrategy,
    ) -> Result<Producer> {
        ensure_open(&memory_fd)?;
        ensure_open(&notification_fd)?;
        validate_capacity(capacity)?;

        let ringbuf = RingBuf::map(memory_fd.as_fd(), capacity, Access::ReadWrite)?;
        // SAFETY: the descriptor comes from the ring's own eventfd.
        let doorbell = unsafe { Doorbell::adopt(notification_fd) };

        Ok(Producer {
            ringbuf,
            doorbell,
            wakeup_strategy,
            lock: Spinlock::new(()),
        })
    }

    /// Reserves `size` payload bytes. The record stays busy until the
    /// returned [`ReservedRecord`] is dropped or discarded.
    pub fn reserve(&self, size: usize) -> Result<ReservedRecord<'_>> {
        let total_size = (HEADER_SIZE + round_up_to_8(size)) as u64;
        let mask = self.ringbuf.size_mask();
        if unlikely(size > MAX_RECORD_LEN || total_size > mask) {
            return Err(RingBufError::InvalidRecordSize(size));
        }

        let _guard = self.lock.lock();

        let consumer_pos = self.ringbuf.load_consumer_acquire();
        let record_pos = self.ringbuf.producer_pos();
        let end_pos = record_pos + total_size;

        if unlikely(end_pos - consumer_pos > mask) {
            ring_trace!(record_pos, consumer_pos, size, "reserve failed: ring full");
            return Err(RingBufError::InsufficientSpace {
                required: total_size,
                available: mask - (record_pos - consumer_pos),
            });
        }

        // Busy header first, then publish the position: a reader that sees
        // the new position also sees the busy bit.
        let header = self.ringbuf.header_word(record_pos);
        header.store(size as u32 | BUSY_FLAG, Ordering::Relaxed);
        self.ringbuf.store_producer_pos(end_pos);
        ring_trace!(record_pos, end_pos, size, "reserved record");

        Ok(ReservedRecord {
            // SAFETY: [record_pos, end_pos) is owned by this reservation until
            // the header loses its busy bit.
            data: unsafe { self.ringbuf.payload_mut(record_pos, size) },
            header,
            len: size as u32,
            position: record_pos,
            discarded: false,
            producer: self,
        })
    }

    /// Wakes the reader. Useful with [`WakeupStrategy::NoWakeup`] to batch
    /// several commits behind one wakeup.
    pub fn notify(&self) -> Result<()> {
        self.doorbell.ring()
    }

    pub fn capacity(&self) -> usize {
        self.ringbuf.capacity()
    }
}

/// A busy record. Dropping it commits; [`discard`](Self::discard) makes the
/// reader skip it.
pub struct ReservedRecord<'a> {
    data: &'a mut [u8],
    header: &'a AtomicU32,
    len: u32,
    position: u64,
    discarded: bool,
    producer: &'a Producer,
}

impl<'a> ReservedRecord<'a> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Stream position of the record header.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn discard(mut self) {
        self.discarded = true;
    }

    pub fn commit(self) {}
}

impl<'a> Drop for ReservedRecord<'a> {
    fn drop(&mut self) {
        let header = if self.discarded {
            self.len | DISCARD_FLAG
        } else {
            self.len
        };
        // Clearing the busy bit hands the slot to the reader.
        self.header.store(header, Ordering::Release);
        ring_trace!(position = self.position, discarded = self.discarded, "released record");

        if self.producer.wakeup_strategy == WakeupStrategy::Forced {
            let _ = self.producer.notify();
        }
    }
}

impl<'a> Deref for ReservedRecord<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a> DerefMut for ReservedRecord<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::page_size;
    use crate::MemfdRing;
    use rstest::*;

    struct Setup {
        ring: MemfdRing,
        producer: Producer,
    }

    #[fixture]
    fn setup() -> Setup {
        let ring = MemfdRing::new(page_size() * 2).unwrap();
        let producer = ring.producer(WakeupStrategy::Forced).unwrap();
        Setup { ring, producer }
    }

    fn header(producer: &Producer, pos: u64) -> u32 {
        producer.ringbuf.header_word(pos).load(Ordering::Acquire)
    }

    #[rstest]
    fn test_reserve_and_commit(setup: Setup) -> Result<()> {
        let producer = &setup.producer;
        let data = b"hello world!";

        let pos = {
            let mut reserved = producer.reserve(data.len())?;
            reserved.copy_from_slice(data);
            assert_eq!(header(producer, reserved.position()), data.len() as u32 | BUSY_FLAG);
            reserved.position()
        };

        assert_eq!(header(producer, pos), data.len() as u32);
        assert_eq!(producer.ringbuf.producer_pos(), 24);
        assert_eq!(producer.ringbuf.consumer_pos(), 0);
        assert_eq!(setup.ring.capacity(), producer.capacity());
        Ok(())
    }

    #[rstest]
    fn test_explicit_discard(setup: Setup) -> Result<()> {
        let producer = &setup.producer;
        let reserved = producer.reserve(16)?;
        let pos = reserved.position();
        reserved.discard();

        assert_eq!(header(producer, pos), 16 | DISCARD_FLAG);
        assert_eq!(producer.ringbuf.producer_pos(), 24);
        Ok(())
    }

    #[rstest]
    #[case(0)]
    #[case(8)]
    #[case(13)]
    #[case(128)]
    fn test_various_sizes(setup: Setup, #[case] size: usize) -> Result<()> {
        let producer = &setup.producer;
        {
            let mut reserved = producer.reserve(size)?;
            for (i, byte) in reserved.iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
        }

        let total_size = (size + HEADER_SIZE + 7) & !7;
        assert_eq!(producer.ringbuf.producer_pos(), total_size as u64);
        Ok(())
    }

    #[rstest]
    fn test_invalid_size_validation(setup: Setup) {
        let huge_size = setup.producer.capacity() + 1;
        assert!(matches!(
            setup.producer.reserve(huge_size),
            Err(RingBufError::InvalidRecordSize(_))
        ));
    }

    #[rstest]
    fn test_insufficient_space(setup: Setup) -> Result<()> {
        let large_size = setup.producer.capacity() / 2;
        let _reserved = setup.producer.reserve(large_size)?;
        assert!(matches!(
            setup.producer.reserve(large_size),
            Err(RingBufError::InsufficientSpace { .. })
        ));
        Ok(())
    }

    #[rstest]
    fn test_space_reclaimed_after_consume(setup: Setup) -> Result<()> {
        let producer = &setup.producer;
        let large_size = producer.capacity() / 2;
        drop(producer.reserve(large_size)?);

        let consumed = producer.ringbuf.producer_pos();
        producer.ringbuf.store_consumer_pos(consumed);

        drop(producer.reserve(large_size)?);
        assert_eq!(producer.ringbuf.producer_pos(), consumed * 2);
        Ok(())
    }
}
