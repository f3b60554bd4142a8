use crate::common::page_size;
use crate::error::{Result, RingBufError};
use core::ffi::c_void;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    fn prot(self) -> ProtFlags {
        match self {
            Access::ReadOnly => ProtFlags::PROT_READ,
            Access::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

/// One contiguous virtual range, unmapped on drop.
struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

/// The two mappings of a ring buffer file, laid out like the kernel's
/// `BPF_MAP_TYPE_RINGBUF`:
///
/// ```text
/// file:     [ consumer page | producer page | data (C) ]
/// consumer: [ consumer page ]                                  read-write
/// producer: [ producer page | data (C) | data (C) again ]      `Access`
/// ```
///
/// The data region is mapped twice back to back, so a record starting near
/// the end of the ring can be read as one slice.
pub(crate) struct RingMemory {
    consumer: Mapping,
    producer: Mapping,
    capacity: usize,
    page_size: usize,
}

impl RingMemory {
    pub(crate) fn map(fd: BorrowedFd<'_>, capacity: usize, access: Access) -> Result<Self> {
        let page_size = page_size();

        let consumer = unsafe {
            mmap(
                None,
                non_zero(page_size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .map_err(RingBufError::Mmap)?
        };
        let consumer = Mapping {
            ptr: consumer,
            len: page_size,
        };

        let total_size = page_size + 2 * capacity;
        let base = unsafe {
            mmap_anonymous(
                None,
                non_zero(total_size)?,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
            .map_err(RingBufError::Mmap)?
        };
        // From here on the reservation owns every fixed mapping placed inside it.
        let producer = Mapping {
            ptr: base,
            len: total_size,
        };
        let base_addr = base.as_ptr() as usize;

        unsafe {
            mmap(
                Some(non_zero(base_addr)?),
                non_zero(page_size + capacity)?,
                access.prot(),
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                fd,
                page_size as libc::off_t,
            )
            .map_err(RingBufError::Mmap)?;
        }

        unsafe {
            mmap(
                Some(non_zero(base_addr + page_size + capacity)?),
                non_zero(capacity)?,
                access.prot(),
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                fd,
                (2 * page_size) as libc::off_t,
            )
            .map_err(RingBufError::Mmap)?;
        }

        Ok(RingMemory {
            consumer,
            producer,
            capacity,
            page_size,
        })
    }

    pub(crate) fn consumer_page(&self) -> NonNull<u8> {
        self.consumer.ptr.cast()
    }

    pub(crate) fn producer_page(&self) -> NonNull<u8> {
        self.producer.ptr.cast()
    }

    pub(crate) fn data_ptr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.producer.ptr.as_ptr().cast::<u8>().add(self.page_size)) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

unsafe impl Send for RingMemory {}
unsafe impl Sync for RingMemory {}

/// Size of a file backing a ring of `capacity` data bytes.
pub(crate) fn file_size(capacity: usize) -> usize {
    2 * page_size() + capacity
}

fn non_zero(value: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or(RingBufError::Mmap(Errno::EINVAL))
}
