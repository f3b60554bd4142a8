use crate::error::{Result, RingBufError};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// An eventfd that is written to and never read.
///
/// Producers ring it to wake the reader; the poller rings its own to break
/// out of a blocked wait. The counter only grows, so a level-triggered
/// registration stays ready forever once rung.
pub struct Doorbell(EventFd);

impl Doorbell {
    pub fn new() -> Result<Self> {
        EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map(Doorbell)
            .map_err(RingBufError::Eventfd)
    }

    /// # Safety
    ///
    /// `fd` must be an eventfd.
    pub unsafe fn adopt(fd: OwnedFd) -> Self {
        Doorbell(EventFd::from_owned_fd(fd))
    }

    pub fn ring(&self) -> Result<()> {
        self.0.write(1).map_err(RingBufError::Eventfd)?;
        Ok(())
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
