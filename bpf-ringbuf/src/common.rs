// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Record header layout and size helpers shared by the reader and the producer.

use crate::error::{Result, RingBufError};

#[inline]
#[cold]
fn cold() {}

#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}

/// `BPF_RINGBUF_BUSY_BIT`: the producer has reserved the slot but not committed it.
pub(crate) const BUSY_FLAG: u32 = 1 << 31;
/// `BPF_RINGBUF_DISCARD_BIT`: the producer gave the slot up.
pub(crate) const DISCARD_FLAG: u32 = 1 << 30;
pub(crate) const LEN_MASK: u32 = !(BUSY_FLAG | DISCARD_FLAG);
/// `BPF_RINGBUF_HDR_SZ`
pub(crate) const HEADER_SIZE: usize = 8;
pub(crate) const MAX_RECORD_LEN: usize = LEN_MASK as usize;

/// Decoded copy of `struct bpf_ringbuf_hdr`.
///
/// Only the length word is kept; the second half (`pg_off`) belongs to the
/// kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader(u32);

impl RecordHeader {
    #[inline(always)]
    pub(crate) fn from_raw(len: u32) -> Self {
        RecordHeader(len)
    }

    #[inline(always)]
    pub(crate) fn is_busy(&self) -> bool {
        self.0 & BUSY_FLAG != 0
    }

    #[inline(always)]
    pub(crate) fn is_discarded(&self) -> bool {
        self.0 & DISCARD_FLAG != 0
    }

    #[inline(always)]
    pub(crate) fn data_len(&self) -> usize {
        (self.0 & LEN_MASK) as usize
    }

    /// Bytes the record occupies in the ring, header included.
    #[inline(always)]
    pub(crate) fn total_len(&self) -> u64 {
        (HEADER_SIZE + round_up_to_8(self.data_len())) as u64
    }
}

#[inline(always)]
pub(crate) fn round_up_to_8(len: usize) -> usize {
    (len + 7) & !7
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Checks a data region size against what the kernel accepts for
/// `BPF_MAP_TYPE_RINGBUF`.
pub(crate) fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 || !capacity.is_power_of_two() || capacity > u32::MAX as usize {
        return Err(RingBufError::InvalidCapacity(capacity));
    }
    let page_size = page_size();
    if capacity % page_size != 0 {
        return Err(RingBufError::CapacityNotAligned {
            capacity,
            page_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 8)]
    #[case(8, 8)]
    #[case(10, 16)]
    #[case(20, 24)]
    fn test_round_up_to_8(#[case] len: usize, #[case] expected: usize) {
        assert_eq!(round_up_to_8(len), expected);
    }

    #[test]
    fn test_header_flags() {
        let header = RecordHeader::from_raw(12 | BUSY_FLAG);
        assert!(header.is_busy());
        assert!(!header.is_discarded());
        assert_eq!(header.data_len(), 12);

        let header = RecordHeader::from_raw(12 | DISCARD_FLAG);
        assert!(!header.is_busy());
        assert!(header.is_discarded());
        assert_eq!(header.data_len(), 12);
        assert_eq!(header.total_len(), 24);
    }

    #[test]
    fn test_zero_length_header() {
        let header = RecordHeader::from_raw(0);
        assert_eq!(header.data_len(), 0);
        assert_eq!(header.total_len(), HEADER_SIZE as u64);
    }

    #[rstest]
    #[case(0)]
    #[case(100)]
    #[case(3 * 4096)]
    fn test_invalid_capacity(#[case] capacity: usize) {
        assert!(matches!(
            validate_capacity(capacity),
            Err(RingBufError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_capacity_below_page_size() {
        if page_size() > 8 {
            assert!(matches!(
                validate_capacity(8),
                Err(RingBufError::CapacityNotAligned { .. })
            ));
        }
    }

    #[test]
    fn test_valid_capacity() {
        assert!(validate_capacity(page_size()).is_ok());
        assert!(validate_capacity(page_size() * 16).is_ok());
    }
}
