//! Process-wide registry of hooked file descriptors.
//!
//! Every socket that passes through the hooked `socket`/`accept` gets an
//! [`FdContext`]. Registration forces the kernel `O_NONBLOCK` flag on
//! for sockets so the hooked I/O path can rely on non-blocking
//! semantics; the user's own non-block preference is tracked separately
//! so the hooked `fcntl(F_GETFL)` keeps program-visible semantics.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::poller::Interest;

const TIMEOUT_NEVER: u64 = u64::MAX;

/// Per-fd bookkeeping for the hook layer.
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    read_timeout_ns: AtomicU64,
    write_timeout_ns: AtomicU64,
}

impl FdContext {
    /// Probes `fd` and builds its context. For sockets the kernel
    /// non-blocking flag is switched on here, once.
    fn probe(fd: RawFd) -> io::Result<FdContext> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            sys_nonblock = flags & libc::O_NONBLOCK != 0;
            if !sys_nonblock {
                if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                sys_nonblock = true;
            }
        }

        Ok(FdContext {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            read_timeout_ns: AtomicU64::new(TIMEOUT_NEVER),
            write_timeout_ns: AtomicU64::new(TIMEOUT_NEVER),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// whether the core switched the kernel flag on behind the program's
    /// back
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// per-direction timeout; `None` means block forever
    pub fn timeout(&self, dir: Interest) -> Option<Duration> {
        let cell = if dir.contains(Interest::WRITE) {
            &self.write_timeout_ns
        } else {
            &self.read_timeout_ns
        };
        match cell.load(Ordering::Relaxed) {
            TIMEOUT_NEVER => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    pub fn set_timeout(&self, dir: Interest, timeout: Option<Duration>) {
        let ns = match timeout {
            // zero duration disables the timeout, the setsockopt way
            Some(d) if !d.is_zero() => d.as_nanos().min(TIMEOUT_NEVER as u128 - 1) as u64,
            _ => TIMEOUT_NEVER,
        };
        let cell = if dir.contains(Interest::WRITE) {
            &self.write_timeout_ns
        } else {
            &self.read_timeout_ns
        };
        cell.store(ns, Ordering::Relaxed);
    }
}

/// fd -> context map behind a reader-writer lock.
#[derive(Default)]
pub struct FdTable {
    map: RwLock<HashMap<RawFd, Arc<FdContext>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        Self::default()
    }

    /// Creates and inserts a context for `fd`, replacing any stale entry
    /// left behind by an unhooked close of the same fd number.
    pub fn register(&self, fd: RawFd) -> io::Result<Arc<FdContext>> {
        let ctx = Arc::new(FdContext::probe(fd)?);
        self.map.write().unwrap().insert(fd, ctx.clone());
        debug!("fd context registered, fd={}, socket={}", fd, ctx.is_socket());
        Ok(ctx)
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.map.read().unwrap().get(&fd).cloned()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.map.read().unwrap().contains_key(&fd)
    }

    pub fn remove(&self, fd: RawFd) {
        self.map.write().unwrap().remove(&fd);
    }
}

/// The process-wide table the hook layer consults.
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}
