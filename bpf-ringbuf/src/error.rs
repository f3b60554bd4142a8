use crate::source::MapType;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingBufError {
    #[error("invalid map type: {0}")]
    InvalidMapType(MapType),

    #[error("ring buffer size {0} is zero or not a power of two")]
    InvalidCapacity(usize),

    #[error("ring buffer size {capacity} is not a multiple of the page size ({page_size} bytes)")]
    CapacityNotAligned { capacity: usize, page_size: usize },

    #[error("memory mapping failed: {0}")]
    Mmap(Errno),

    #[error("memfd setup failed: {0}")]
    Memfd(Errno),

    #[error("eventfd operation failed: {0}")]
    Eventfd(Errno),

    #[error("epoll setup failed: {0}")]
    Epoll(Errno),

    #[error("bpf syscall failed: {0}")]
    Bpf(Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ring buffer reader closed")]
    Closed,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("waiting for ring buffer failed: {0}")]
    Wait(Errno),

    #[error("read sample: expected {expected} bytes, only {available} available")]
    ShortRead { expected: usize, available: usize },

    #[error("insufficient space in ring buffer: need {required} bytes, {available} free")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("invalid record size: {0}")]
    InvalidRecordSize(usize),
}

pub type Result<T> = std::result::Result<T, RingBufError>;
