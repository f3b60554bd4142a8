use crate::common::{RecordHeader, HEADER_SIZE};
use crate::error::Result;
use crate::memory::{Access, RingMemory};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Shared view of a mapped ring: positions plus the aliased data region.
///
/// The producer position is read with acquire ordering and the consumer
/// position is published with release ordering. Those two operations are the
/// only synchronization with the producer; every copy out of the data region
/// happens after the acquire load and before the release store that frees it.
pub(crate) struct RingBuf {
    memory: RingMemory,
    mask: u64,
}

impl RingBuf {
    pub(crate) fn map(fd: BorrowedFd<'_>, capacity: usize, access: Access) -> Result<Self> {
        let memory = RingMemory::map(fd, capacity, access)?;
        Ok(RingBuf {
            memory,
            mask: (capacity - 1) as u64,
        })
    }

    fn consumer(&self) -> &AtomicU64 {
        unsafe { &*(self.memory.consumer_page().as_ptr() as *const AtomicU64) }
    }

    fn producer(&self) -> &AtomicU64 {
        unsafe { &*(self.memory.producer_page().as_ptr() as *const AtomicU64) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.memory.capacity()
    }

    pub(crate) fn size_mask(&self) -> u64 {
        self.mask
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.memory.data_ptr().as_ptr()
    }

    /// Relaxed: the consumer is the only writer of its own position.
    pub(crate) fn consumer_pos(&self) -> u64 {
        self.consumer().load(Ordering::Relaxed)
    }

    pub(crate) fn producer_pos(&self) -> u64 {
        self.producer().load(Ordering::Acquire)
    }

    pub(crate) fn store_consumer_pos(&self, pos: u64) {
        self.consumer().store(pos, Ordering::Release);
    }

    /// Producer side only; requires an `Access::ReadWrite` mapping.
    pub(crate) fn store_producer_pos(&self, pos: u64) {
        self.producer().store(pos, Ordering::Release);
    }

    /// Producer side: acquire so the consumer's copies finish before the
    /// space is reused.
    pub(crate) fn load_consumer_acquire(&self) -> u64 {
        self.consumer().load(Ordering::Acquire)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.producer_pos().saturating_sub(self.consumer_pos()) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Length word of the header at `pos`.
    pub(crate) fn header_word(&self, pos: u64) -> &AtomicU32 {
        let offset = (pos & self.mask) as usize;
        unsafe { &*(self.data_ptr().add(offset) as *const AtomicU32) }
    }

    /// Returns `None` once `pos` has caught up with the producer.
    pub(crate) fn read_header(&self, pos: u64) -> Option<RecordHeader> {
        if pos == self.producer_pos() {
            return None;
        }
        // Acquire pairs with the producer's release when it clears the busy bit.
        Some(RecordHeader::from_raw(
            self.header_word(pos).load(Ordering::Acquire),
        ))
    }

    /// Appends `len` bytes starting at stream position `pos` to `out`.
    ///
    /// `len` must not exceed the capacity; the second mapping of the data
    /// region keeps the source slice contiguous.
    pub(crate) fn copy_into(&self, pos: u64, len: usize, out: &mut Vec<u8>) {
        debug_assert!(len <= self.capacity());
        let offset = (pos & self.mask) as usize;
        let src = unsafe { std::slice::from_raw_parts(self.data_ptr().add(offset), len) };
        out.extend_from_slice(src);
    }

    /// Mutable payload area of the record whose header sits at `pos`.
    ///
    /// # Safety
    ///
    /// Producer side only. The caller must own the reservation at `pos` and
    /// must not create overlapping slices.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, pos: u64, len: usize) -> &mut [u8] {
        let offset = (pos & self.mask) as usize + HEADER_SIZE;
        std::slice::from_raw_parts_mut(self.data_ptr().add(offset), len)
    }
}

unsafe impl Send for RingBuf {}
unsafe impl Sync for RingBuf {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{page_size, BUSY_FLAG};
    use crate::memory::file_size;
    use nix::sys::memfd::{memfd_create, MFdFlags};
    use nix::unistd::ftruncate;
    use rstest::*;
    use std::os::fd::{AsFd, OwnedFd};

    struct Pair {
        _fd: OwnedFd,
        writer: RingBuf,
        reader: RingBuf,
    }

    #[fixture]
    fn pair() -> Pair {
        let capacity = page_size();
        let fd = memfd_create(c"bpf-ringbuf-test", MFdFlags::MFD_CLOEXEC).unwrap();
        ftruncate(&fd, file_size(capacity) as libc::off_t).unwrap();
        let writer = RingBuf::map(fd.as_fd(), capacity, Access::ReadWrite).unwrap();
        let reader = RingBuf::map(fd.as_fd(), capacity, Access::ReadOnly).unwrap();
        Pair {
            _fd: fd,
            writer,
            reader,
        }
    }

    #[rstest]
    fn test_ringbuf_creation(pair: Pair) {
        let capacity = page_size();
        assert_eq!(pair.reader.capacity(), capacity);
        assert_eq!(pair.reader.size_mask(), (capacity - 1) as u64);
        assert_eq!(pair.reader.consumer_pos(), 0);
        assert_eq!(pair.reader.producer_pos(), 0);
        assert!(pair.reader.is_empty());
    }

    #[rstest]
    fn test_position_updates(pair: Pair) {
        pair.writer.store_producer_pos(96);
        assert_eq!(pair.reader.producer_pos(), 96);
        assert_eq!(pair.reader.remaining(), 96);

        pair.reader.store_consumer_pos(40);
        assert_eq!(pair.writer.load_consumer_acquire(), 40);
        assert_eq!(pair.reader.remaining(), 56);
        assert!(!pair.reader.is_empty());
    }

    #[rstest]
    fn test_read_header_end_of_ring(pair: Pair) {
        assert_eq!(pair.reader.read_header(0), None);

        pair.writer
            .header_word(0)
            .store(5 | BUSY_FLAG, Ordering::Relaxed);
        pair.writer.store_producer_pos(16);

        let header = pair.reader.read_header(0).unwrap();
        assert!(header.is_busy());
        assert_eq!(header.data_len(), 5);
        assert_eq!(pair.reader.read_header(16), None);
    }

    #[rstest]
    fn test_copy_across_the_end(pair: Pair) {
        let capacity = pair.reader.capacity() as u64;
        let pos = capacity * 3 - 8;
        unsafe {
            let payload = pair.writer.payload_mut(pos - HEADER_SIZE as u64, 16);
            payload.copy_from_slice(b"0123456789abcdef");
        }

        let mut out = Vec::new();
        pair.reader.copy_into(pos, 16, &mut out);
        assert_eq!(out, b"0123456789abcdef");
    }
}
