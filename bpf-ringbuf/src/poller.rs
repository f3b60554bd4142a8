use crate::doorbell::Doorbell;
use crate::error::{Result, RingBufError};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::debug;

const RING_TOKEN: u64 = 0;
const CLOSE_TOKEN: u64 = 1;

/// How readiness of the registered descriptor is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Ready while data is available, like a kernel ring buffer map fd.
    Level,
    /// Ready once per notification, for doorbells that are never drained.
    Edge,
}

/// Blocks until a ring descriptor becomes readable, a deadline passes, or
/// the poller is closed from another thread.
pub struct Poller {
    epoll: Epoll,
    close: Doorbell,
    closed: AtomicBool,
    // Keeps the registration alive for as long as the poller exists.
    _watched: OwnedFd,
}

impl Poller {
    pub fn new(fd: BorrowedFd<'_>, trigger: Trigger) -> Result<Self> {
        Self::with_close_doorbell(fd, trigger, Doorbell::new()?)
    }

    pub(crate) fn with_close_doorbell(
        fd: BorrowedFd<'_>,
        trigger: Trigger,
        close: Doorbell,
    ) -> Result<Self> {
        let watched = fd.try_clone_to_owned()?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(RingBufError::Epoll)?;

        let mut flags = EpollFlags::EPOLLIN;
        if trigger == Trigger::Edge {
            flags |= EpollFlags::EPOLLET;
        }
        epoll
            .add(&watched, EpollEvent::new(flags, RING_TOKEN))
            .map_err(RingBufError::Epoll)?;

        epoll
            .add(close.fd(), EpollEvent::new(EpollFlags::EPOLLIN, CLOSE_TOKEN))
            .map_err(RingBufError::Epoll)?;

        debug!(?trigger, "poller registered ring descriptor");

        Ok(Poller {
            epoll,
            close,
            closed: AtomicBool::new(false),
            _watched: watched,
        })
    }

    /// Waits for the ring descriptor, returning the number of ready events.
    ///
    /// Fails with [`RingBufError::DeadlineExceeded`] when `deadline` passes
    /// first and with [`RingBufError::Closed`] once [`close`](Self::close)
    /// has been called.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<usize> {
        let mut events = [EpollEvent::empty(); 2];

        loop {
            if self.is_closed() {
                return Err(RingBufError::Closed);
            }

            let timeout = match deadline {
                None => EpollTimeout::NONE,
                Some(deadline) => timeout_until(deadline),
            };

            let ready = match self.epoll.wait(&mut events, timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(RingBufError::Wait(e)),
            };

            if events[..ready].iter().any(|e| e.data() == CLOSE_TOKEN) {
                return Err(RingBufError::Closed);
            }
            if ready > 0 {
                return Ok(ready);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(RingBufError::DeadlineExceeded);
                }
            }
        }
    }

    /// Interrupts current and future waits.
    ///
    /// Safe to call while another thread is blocked in [`wait`](Self::wait).
    /// Returns [`RingBufError::Closed`] if the poller was already closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RingBufError::Closed);
        }
        // Never drained, so the close event stays ready.
        if let Err(e) = self.close.ring() {
            // Waiters were not woken; let a later close try again.
            self.closed.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Rounds up so a wait never returns just short of the deadline. Long waits
/// are split into slices; `wait` loops until the deadline really passed.
fn timeout_until(deadline: Instant) -> EpollTimeout {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    EpollTimeout::from(millis.min(u16::MAX as u128) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn doorbell() -> (Doorbell, Poller) {
        let bell = Doorbell::new().unwrap();
        let poller = Poller::new(bell.fd(), Trigger::Edge).unwrap();
        (bell, poller)
    }

    #[test]
    fn test_deadline_exceeded() {
        let (_bell, poller) = doorbell();
        let start = Instant::now();
        let err = poller
            .wait(Some(start + Duration::from_millis(20)))
            .unwrap_err();

        assert!(matches!(err, RingBufError::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_past_deadline_returns_immediately() {
        let (_bell, poller) = doorbell();
        let err = poller.wait(Some(Instant::now())).unwrap_err();
        assert!(matches!(err, RingBufError::DeadlineExceeded));
    }

    #[test]
    fn test_doorbell_wakes_wait() {
        let (bell, poller) = doorbell();
        bell.ring().unwrap();

        assert_eq!(poller.wait(None).unwrap(), 1);
        // Edge triggered: the same notification is reported once.
        assert!(matches!(
            poller.wait(Some(Instant::now() + Duration::from_millis(10))),
            Err(RingBufError::DeadlineExceeded)
        ));
    }

    #[test]
    fn test_close_interrupts_blocked_wait() {
        let (_bell, poller) = doorbell();
        let poller = Arc::new(poller);

        let waiter = {
            let poller = poller.clone();
            thread::spawn(move || poller.wait(None))
        };

        thread::sleep(Duration::from_millis(50));
        poller.close().unwrap();

        let result = waiter.join().expect("waiter panicked");
        assert!(matches!(result, Err(RingBufError::Closed)));
        assert!(matches!(poller.wait(None), Err(RingBufError::Closed)));
    }

    #[test]
    fn test_failed_close_can_be_retried() {
        let bell = Doorbell::new().unwrap();
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        // Writing to the read end of a pipe fails with EBADF.
        let broken = unsafe { Doorbell::adopt(read_end) };
        let poller = Poller::with_close_doorbell(bell.fd(), Trigger::Edge, broken).unwrap();

        assert!(matches!(poller.close(), Err(RingBufError::Eventfd(_))));
        assert!(!poller.is_closed());
        assert!(matches!(poller.close(), Err(RingBufError::Eventfd(_))));
    }

    #[test]
    fn test_close_twice() {
        let (_bell, poller) = doorbell();
        poller.close().unwrap();
        assert!(matches!(poller.close(), Err(RingBufError::Closed)));
        assert!(poller.is_closed());
    }
}
