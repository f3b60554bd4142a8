use crate::common::{unlikely, HEADER_SIZE};
use crate::error::{Result, RingBufError};
use crate::ring_trace;
use crate::ringbuf::RingBuf;

/// A sample read from the ring.
///
/// The buffer is reused by [`Reader::read_into`](crate::Reader::read_into)
/// when it is large enough.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Record {
    sample: Vec<u8>,
    remaining: usize,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Record {
            sample: Vec::with_capacity(capacity),
            remaining: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.sample
    }

    /// Minimum number of bytes left in the ring right after this record was
    /// consumed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn len(&self) -> usize {
        self.sample.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.sample
    }
}

impl AsRef<[u8]> for Record {
    fn as_ref(&self) -> &[u8] {
        &self.sample
    }
}

/// Outcome of one framing attempt. Only `Ready` fills the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Frame {
    Ready,
    /// Reserved but not committed; retry the same position.
    Busy,
    /// Skipped without copying; the consumer position moved past it.
    Discarded,
    /// Caught up with the producer; wait for more.
    EndOfRing,
}

pub(crate) fn read_record(ring: &RingBuf, record: &mut Record) -> Result<Frame> {
    let pos = ring.consumer_pos();

    let Some(header) = ring.read_header(pos) else {
        return Ok(Frame::EndOfRing);
    };

    if header.is_busy() {
        // Leave the consumer position alone so the same slot is read again.
        return Ok(Frame::Busy);
    }

    let total_len = header.total_len();
    let aligned_len = total_len as usize - HEADER_SIZE;

    if header.is_discarded() {
        ring_trace!(pos, len = header.data_len(), "skipping discarded record");
        ring.store_consumer_pos(pos + total_len);
        return Ok(Frame::Discarded);
    }

    let data_pos = pos + HEADER_SIZE as u64;
    let available = ring.producer_pos().saturating_sub(data_pos) as usize;
    if unlikely(aligned_len > available || aligned_len > ring.capacity()) {
        return Err(RingBufError::ShortRead {
            expected: aligned_len,
            available,
        });
    }

    record.sample.clear();
    ring.copy_into(data_pos, aligned_len, &mut record.sample);
    record.sample.truncate(header.data_len());

    ring.store_consumer_pos(pos + total_len);
    record.remaining = ring.remaining();

    ring_trace!(
        pos,
        len = header.data_len(),
        remaining = record.remaining,
        "read record"
    );

    Ok(Frame::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{page_size, BUSY_FLAG, DISCARD_FLAG};
    use crate::memory::{file_size, Access};
    use nix::sys::memfd::{memfd_create, MFdFlags};
    use nix::unistd::ftruncate;
    use rstest::*;
    use std::os::fd::{AsFd, OwnedFd};
    use std::sync::atomic::Ordering;

    struct Ring {
        _fd: OwnedFd,
        writer: RingBuf,
        reader: RingBuf,
        pos: u64,
    }

    impl Ring {
        fn push(&mut self, flags: u32, payload: &[u8]) -> u64 {
            let start = self.pos;
            unsafe {
                self.writer
                    .payload_mut(start, payload.len())
                    .copy_from_slice(payload);
            }
            self.writer
                .header_word(start)
                .store(payload.len() as u32 | flags, Ordering::Release);
            self.pos += (HEADER_SIZE + crate::common::round_up_to_8(payload.len())) as u64;
            self.writer.store_producer_pos(self.pos);
            start
        }
    }

    #[fixture]
    fn ring() -> Ring {
        let capacity = page_size();
        let fd = memfd_create(c"bpf-ringbuf-test", MFdFlags::MFD_CLOEXEC).unwrap();
        ftruncate(&fd, file_size(capacity) as libc::off_t).unwrap();
        let writer = RingBuf::map(fd.as_fd(), capacity, Access::ReadWrite).unwrap();
        let reader = RingBuf::map(fd.as_fd(), capacity, Access::ReadOnly).unwrap();
        Ring {
            _fd: fd,
            writer,
            reader,
            pos: 0,
        }
    }

    #[rstest]
    fn test_empty_ring(ring: Ring) -> Result<()> {
        let mut record = Record::new();
        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::EndOfRing);
        assert_eq!(ring.reader.consumer_pos(), 0);
        Ok(())
    }

    #[rstest]
    fn test_ready_record(mut ring: Ring) -> Result<()> {
        ring.push(0, b"hello");
        let mut record = Record::new();

        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::Ready);
        assert_eq!(record.as_slice(), b"hello");
        assert_eq!(record.remaining(), 0);
        assert_eq!(ring.reader.consumer_pos(), 16);
        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::EndOfRing);
        Ok(())
    }

    #[rstest]
    fn test_busy_record_keeps_position(mut ring: Ring) -> Result<()> {
        let pos = ring.push(BUSY_FLAG, b"pending");
        let mut record = Record::new();

        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::Busy);
        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::Busy);
        assert_eq!(ring.reader.consumer_pos(), 0);

        ring.writer.header_word(pos).store(7, Ordering::Release);
        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::Ready);
        assert_eq!(record.as_slice(), b"pending");
        Ok(())
    }

    #[rstest]
    #[case::unaligned(13, 24)]
    #[case::aligned(16, 24)]
    #[case::empty(0, 8)]
    fn test_discard_advances_by_aligned_len(
        mut ring: Ring,
        #[case] len: usize,
        #[case] advance: u64,
    ) -> Result<()> {
        ring.push(DISCARD_FLAG, &vec![0xEE; len]);
        let mut record = Record::new();

        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::Discarded);
        assert_eq!(ring.reader.consumer_pos(), advance);
        assert!(record.is_empty());
        Ok(())
    }

    #[rstest]
    fn test_zero_length_record(mut ring: Ring) -> Result<()> {
        ring.push(0, b"");
        let mut record = Record::new();

        assert_eq!(read_record(&ring.reader, &mut record)?, Frame::Ready);
        assert!(record.is_empty());
        assert_eq!(ring.reader.consumer_pos(), 8);
        Ok(())
    }

    #[rstest]
    fn test_buffer_reuse_truncates_padding(mut ring: Ring) -> Result<()> {
        ring.push(0, &[1u8; 40]);
        ring.push(0, &[2u8; 3]);
        let mut record = Record::with_capacity(64);

        read_record(&ring.reader, &mut record)?;
        assert_eq!(record.as_slice(), &[1u8; 40]);
        read_record(&ring.reader, &mut record)?;
        assert_eq!(record.as_slice(), &[2u8; 3]);
        Ok(())
    }

    #[rstest]
    fn test_length_past_producer_is_short_read(mut ring: Ring) {
        ring.push(0, b"abc");
        // Claim more bytes than the producer published.
        ring.writer.header_word(0).store(64, Ordering::Release);
        let mut record = Record::new();

        let err = read_record(&ring.reader, &mut record).unwrap_err();
        assert!(matches!(
            err,
            RingBufError::ShortRead {
                expected: 64,
                available: 8
            }
        ));
        assert_eq!(ring.reader.consumer_pos(), 0);
    }
}
