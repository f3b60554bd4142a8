//! # bpf-ringbuf - BPF Ring Buffer Consumer
//!
//! Reads variable-length samples from a Linux `BPF_MAP_TYPE_RINGBUF` map
//! without a syscall per record. The consumer and producer positions live in
//! shared memory; the producer (usually the kernel) never waits for the
//! reader.
//!
//! The ring is mapped with the kernel's layout: a writable consumer page,
//! then a read-only producer page followed by the data region mapped twice,
//! so records that wrap around the end read as one slice. The producer
//! position is loaded with acquire ordering, the consumer position stored
//! with release ordering, and those two are the only synchronization with
//! the producer.
//!
//! ## Reading From a Kernel Map
//!
//! ```no_run
//! use bpf_ringbuf::{MapFd, Reader};
//!
//! let map = MapFd::from_pinned("/sys/fs/bpf/events")?;
//! let reader = Reader::new(&map)?;
//!
//! loop {
//!     let record = reader.read()?;
//!     println!("{} bytes, {} left", record.len(), record.remaining());
//! }
//! # Ok::<(), bpf_ringbuf::RingBufError>(())
//! ```
//!
//! Any [`RingSource`] works: [`MapFd`] wraps a descriptor from a loader
//! (`MapFd::from_fd`) or a pinned path.
//!
//! ## Deadlines
//!
//! ```rust
//! # use bpf_ringbuf::{MemfdRing, Reader, RingBufError};
//! # use std::time::{Duration, Instant};
//! # let ring = MemfdRing::new(64 * 1024)?;
//! # let reader = Reader::new(&ring)?;
//! reader.set_deadline(Some(Instant::now() + Duration::from_millis(10)));
//!
//! match reader.read() {
//!     Ok(record) => println!("{:?}", record.as_slice()),
//!     Err(RingBufError::DeadlineExceeded) => println!("nothing yet"),
//!     Err(e) => return Err(e),
//! }
//! # Ok::<(), bpf_ringbuf::RingBufError>(())
//! ```
//!
//! Producers may skip wakeups (`BPF_RB_NO_WAKEUP`). When the deadline passes
//! the reader looks at the ring once more and returns data if there is any,
//! so an expired deadline only means the ring was empty.
//!
//! ## Reusing Buffers
//!
//! ```rust
//! # use bpf_ringbuf::{MemfdRing, Reader, Record, WakeupStrategy};
//! # let ring = MemfdRing::new(64 * 1024)?;
//! # let producer = ring.producer(WakeupStrategy::Forced)?;
//! # producer.reserve(5)?.copy_from_slice(b"hello");
//! # let reader = Reader::new(&ring)?;
//! let mut record = Record::with_capacity(4096);
//! reader.read_into(&mut record)?;
//! assert_eq!(record.as_slice(), b"hello");
//! # Ok::<(), bpf_ringbuf::RingBufError>(())
//! ```
//!
//! ## Closing
//!
//! [`Reader::close`] interrupts a read blocked in another thread, which then
//! returns [`RingBufError::Closed`], as does every later call.
//!
//! ```rust
//! # use bpf_ringbuf::{MemfdRing, Reader, RingBufError};
//! # use std::sync::Arc;
//! # let ring = MemfdRing::new(64 * 1024)?;
//! let reader = Arc::new(Reader::new(&ring)?);
//!
//! let handle = {
//!     let reader = reader.clone();
//!     std::thread::spawn(move || reader.read())
//! };
//!
//! reader.close()?;
//! assert!(matches!(handle.join().unwrap(), Err(RingBufError::Closed)));
//! # Ok::<(), bpf_ringbuf::RingBufError>(())
//! ```
//!
//! ## User-Space Producers
//!
//! [`MemfdRing`] builds a ring with the same layout on a memfd, with an
//! eventfd for wakeups, and [`Producer`] writes kernel-format records into
//! it. The descriptors can be passed to another process.
//!
//! ```rust
//! use bpf_ringbuf::{MemfdRing, Reader, WakeupStrategy};
//!
//! let ring = MemfdRing::new(64 * 1024)?;
//! let producer = ring.producer(WakeupStrategy::Forced)?;
//! let reader = Reader::new(&ring)?;
//!
//! if let Ok(mut reserved) = producer.reserve(13) {
//!     reserved.copy_from_slice(b"Hello, world!");
//!     // Committed when dropped
//! }
//! producer.reserve(100)?.discard(); // skipped by the reader
//!
//! assert_eq!(reader.read()?.as_slice(), b"Hello, world!");
//! # Ok::<(), bpf_ringbuf::RingBufError>(())
//! ```

pub use doorbell::Doorbell;
pub use error::{Result, RingBufError};
pub use framer::Record;
pub use poller::{Poller, Trigger};
pub use producer::{Producer, ReservedRecord, WakeupStrategy};
pub use reader::{Reader, Records};
pub use source::{MapFd, MapType, MemfdRing, RingSource};

pub(crate) mod common;
pub(crate) mod doorbell;
pub mod error;
pub(crate) mod framer;
pub(crate) mod memory;
pub mod poller;
pub(crate) mod producer;
pub(crate) mod reader;
pub(crate) mod ringbuf;
pub mod source;
pub(crate) mod sys;
mod trace_macro;
