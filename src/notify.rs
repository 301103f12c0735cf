//! Cross-thread reactor wakeup over a counter eventfd.
//!
//! The poller registers the handle level-triggered with one count
//! consumed per wakeup (`EFD_SEMAPHORE`), so n pending notifications let
//! up to n parked workers through their poll and every parked worker
//! rescans the run queue while a count is outstanding.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::prelude::AsRawFd;

pub struct Notifier {
    event_fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> io::Result<Notifier> {
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK | libc::EFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Notifier {
            event_fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    /// Posts `n` notifications. At least one pending notification
    /// guarantees the reactor returns from its next poll promptly.
    pub fn notify(&self, n: u64) {
        let one: u64 = 1;
        for _ in 0..n {
            let ret = unsafe {
                libc::write(
                    self.event_fd.as_raw_fd(),
                    &one as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // counter saturation still leaves the fd readable
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("failed to write the wakeup eventfd: {}", err);
                }
                break;
            }
        }
    }

    /// Consumes one pending notification, if any.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.event_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // raced with another worker; nothing left for us
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("failed to read the wakeup eventfd: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, 0) > 0 }
    }

    #[test]
    fn notify_then_drain() {
        let n = Notifier::new().unwrap();
        assert!(!readable(n.as_raw_fd()));
        n.notify(2);
        assert!(readable(n.as_raw_fd()));
        // semaphore mode: one count per drain
        n.drain();
        assert!(readable(n.as_raw_fd()));
        n.drain();
        assert!(!readable(n.as_raw_fd()));
        // draining an empty notifier is a no-op
        n.drain();
    }
}
