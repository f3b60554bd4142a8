//! Backing objects a [`Reader`](crate::Reader) can be built from.

use crate::common::validate_capacity;
use crate::error::{Result, RingBufError};
use crate::memory::file_size;
use crate::doorbell::Doorbell;
use crate::poller::Trigger;
use crate::producer::{Producer, WakeupStrategy};
use crate::sys;
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::unistd::ftruncate;
use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

/// `enum bpf_map_type` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapType(u32);

impl MapType {
    pub const HASH: MapType = MapType(1);
    pub const ARRAY: MapType = MapType(2);
    pub const PERF_EVENT_ARRAY: MapType = MapType(4);
    pub const RINGBUF: MapType = MapType(27);
    pub const USER_RINGBUF: MapType = MapType(31);

    pub const fn from_raw(raw: u32) -> Self {
        MapType(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        match self {
            MapType::HASH => Some("Hash"),
            MapType::ARRAY => Some("Array"),
            MapType::PERF_EVENT_ARRAY => Some("PerfEventArray"),
            MapType::RINGBUF => Some("RingBuf"),
            MapType::USER_RINGBUF => Some("UserRingBuf"),
            _ => None,
        }
    }
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "MapType({})", self.0),
        }
    }
}

impl fmt::Debug for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A descriptor that can be mapped with the ring buffer layout and polled
/// for new data.
pub trait RingSource {
    fn map_type(&self) -> MapType;

    /// Size of the data region in bytes.
    fn max_entries(&self) -> u32;

    /// Descriptor the consumer and producer pages are mapped from.
    fn ring_fd(&self) -> BorrowedFd<'_>;

    /// Descriptor registered with the poller.
    fn wakeup_fd(&self) -> BorrowedFd<'_> {
        self.ring_fd()
    }

    fn wakeup_trigger(&self) -> Trigger {
        Trigger::Level
    }
}

/// An existing BPF map, typically created by a loader.
#[derive(Debug)]
pub struct MapFd {
    fd: OwnedFd,
    map_type: MapType,
    max_entries: u32,
    id: u32,
    name: String,
}

impl MapFd {
    /// Takes ownership of a map descriptor and asks the kernel what it is.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let info = sys::map_info(fd.as_fd())?;
        let map = MapFd {
            fd,
            map_type: MapType::from_raw(info.map_type),
            max_entries: info.max_entries,
            id: info.id,
            name: info.name(),
        };
        debug!(
            id = map.id,
            name = %map.name,
            map_type = %map.map_type,
            max_entries = map.max_entries,
            "opened bpf map"
        );
        Ok(map)
    }

    /// Opens a map pinned in bpffs, e.g. `/sys/fs/bpf/events`.
    pub fn from_pinned(path: impl AsRef<Path>) -> Result<Self> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| {
            RingBufError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path contains an interior nul byte",
            ))
        })?;
        Self::from_fd(sys::obj_get(&path)?)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsFd for MapFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl RingSource for MapFd {
    fn map_type(&self) -> MapType {
        self.map_type
    }

    fn max_entries(&self) -> u32 {
        self.max_entries
    }

    fn ring_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A ring with the kernel's memory layout backed by a memfd, plus an
/// eventfd standing in for the kernel's wakeups.
///
/// Lets user-space producers, in this or another process, feed a
/// [`Reader`](crate::Reader) without any BPF machinery.
pub struct MemfdRing {
    memfd: OwnedFd,
    doorbell: Doorbell,
    capacity: usize,
}

impl MemfdRing {
    pub fn new(capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;

        let memfd =
            memfd_create(c"bpf-ringbuf", MFdFlags::MFD_CLOEXEC).map_err(RingBufError::Memfd)?;
        ftruncate(&memfd, file_size(capacity) as libc::off_t).map_err(RingBufError::Memfd)?;
        let doorbell = Doorbell::new()?;

        debug!(capacity, "created memfd ring");

        Ok(MemfdRing {
            memfd,
            doorbell,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn memory_fd(&self) -> BorrowedFd<'_> {
        self.memfd.as_fd()
    }

    pub fn notification_fd(&self) -> BorrowedFd<'_> {
        self.doorbell.fd()
    }

    /// Maps a producer onto this ring. Only one producer handle should exist
    /// per ring; share it between threads instead of creating more.
    pub fn producer(&self, wakeup_strategy: WakeupStrategy) -> Result<Producer> {
        Producer::new(
            self.memfd.try_clone()?,
            self.doorbell.fd().try_clone_to_owned()?,
            self.capacity,
            wakeup_strategy,
        )
    }
}

impl RingSource for MemfdRing {
    fn map_type(&self) -> MapType {
        MapType::RINGBUF
    }

    fn max_entries(&self) -> u32 {
        self.capacity as u32
    }

    fn ring_fd(&self) -> BorrowedFd<'_> {
        self.memfd.as_fd()
    }

    fn wakeup_fd(&self) -> BorrowedFd<'_> {
        self.doorbell.fd()
    }

    fn wakeup_trigger(&self) -> Trigger {
        Trigger::Edge
    }
}
