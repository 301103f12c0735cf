//! libc-shaped syscall interposition.
//!
//! Every function here keeps the libc signature and `errno` convention
//! of its namesake. With the per-thread hook flag off (or on fds the
//! runtime does not manage) calls forward straight to libc; on a hooked
//! worker thread the blocking variants suspend the calling coroutine
//! instead of the thread: sleeps become timers, socket I/O parks on the
//! reactor until readiness or an `SO_RCVTIMEO`/`SO_SNDTIMEO` deadline.
//!
//! `fcntl` is exposed in its single-argument form since stable Rust has
//! no C varargs; all commands forward, with `F_GETFL`/`F_SETFL`
//! preserving the program-visible non-blocking flag while the kernel
//! flag stays forced on for managed sockets.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libc::{c_int, c_uint, c_void, size_t, socklen_t, ssize_t};

use crate::coroutine::{this_thread, Coroutine};
use crate::fd::fd_table;
use crate::poller::Interest;
use crate::scheduler;
use crate::timer::LivenessToken;

thread_local! {
    static HOOK_ON: Cell<bool> = Cell::new(false);
}

/// Flips syscall hooking for the current thread. Workers switch this on
/// for the lifetime of their dispatch loop.
pub fn enable_hook(on: bool) {
    HOOK_ON.with(|h| h.set(on));
}

pub fn is_hook_enabled() -> bool {
    HOOK_ON.with(|h| h.get())
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

/// Suspends the current coroutine for `dur`; false when the caller is
/// not a hooked worker coroutine and must fall back to libc.
fn sleep_current(dur: Duration) -> bool {
    if !is_hook_enabled() || !this_thread::is_coroutine() {
        return false;
    }
    let sched = match scheduler::current() {
        Some(s) => s,
        None => return false,
    };
    let co = match this_thread::current() {
        Some(c) => c,
        None => return false,
    };
    sched.run_after(dur, move || {
        if let Some(s) = scheduler::current() {
            s.submit_coroutine(co.clone());
        }
    });
    Coroutine::yield_to_hold();
    true
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if sleep_current(Duration::from_secs(u64::from(seconds))) {
        0
    } else {
        unsafe { libc::sleep(seconds) }
    }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    if sleep_current(Duration::from_micros(u64::from(usec))) {
        0
    } else {
        unsafe { libc::usleep(usec) }
    }
}

/// # Safety
/// `req`/`rem` follow the libc contract: `req` valid or null, `rem`
/// null or writable.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if req.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    let ts = &*req;
    if ts.tv_sec < 0 || ts.tv_nsec < 0 || ts.tv_nsec > 999_999_999 {
        set_errno(libc::EINVAL);
        return -1;
    }
    if sleep_current(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)) {
        if !rem.is_null() {
            (*rem).tv_sec = 0;
            (*rem).tv_nsec = 0;
        }
        0
    } else {
        libc::nanosleep(req, rem)
    }
}

/// Creates a socket; on a hooked thread the fd is registered with the
/// process [`FdTable`](crate::fd::FdTable), which forces the kernel
/// non-blocking flag on.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if is_hook_enabled() && fd >= 0 {
        if let Err(e) = fd_table().register(fd) {
            warn!("failed to register context for socket {}: {}", fd, e);
        }
    }
    fd
}

/// Pass-through; a pending connect keeps its native blocking behavior.
///
/// # Safety
/// `addr` must point to `len` readable bytes, as for `libc::connect`.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, len: socklen_t) -> c_int {
    libc::connect(fd, addr, len)
}

/// The non-blocking I/O template: retry `sys` over EINTR, and on EAGAIN
/// park the coroutine on the reactor (bounded by the fd's per-direction
/// timeout) until readiness lets the retry through.
fn blocking_io<F>(fd: c_int, dir: Interest, mut sys: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() || !this_thread::is_coroutine() {
        return sys();
    }
    let ctx = match fd_table().get(fd) {
        Some(c) => c,
        None => return sys(),
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return sys();
    }
    let sched = match scheduler::current() {
        Some(s) => s,
        None => return sys(),
    };
    let timeout = ctx.timeout(dir);

    loop {
        let n = sys();
        if n != -1 {
            return n;
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => {}
            _ => return -1,
        }

        // the call would block: optionally arm a condition timer keyed
        // on this call's timeout flag, then park on the reactor
        let tripped = Arc::new(AtomicBool::new(false));
        let timer_id = match timeout {
            Some(dur) => {
                let flag = Arc::downgrade(&tripped);
                let tripped_any: Arc<dyn std::any::Any + Send + Sync> = tripped.clone();
                let token: LivenessToken = Arc::downgrade(&tripped_any);
                sched.run_after_if(
                    dur,
                    move || {
                        if let Some(flag) = flag.upgrade() {
                            flag.store(true, Ordering::SeqCst);
                        }
                        // push the waiter through its retry; a no-op if
                        // readiness got there first
                        if let Some(s) = scheduler::current() {
                            s.trigger_event(fd, dir);
                        }
                    },
                    token,
                )
            }
            None => 0,
        };

        if let Err(e) = sched.wait_event(fd, dir) {
            if timer_id != 0 {
                sched.cancel_timer(timer_id);
            }
            warn!("cannot park on fd {}: {}", fd, e);
            set_errno(libc::EAGAIN);
            return -1;
        }
        Coroutine::yield_to_hold();

        if tripped.load(Ordering::SeqCst) {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
        if timer_id != 0 {
            sched.cancel_timer(timer_id);
        }
    }
}

/// # Safety
/// `addr`/`len` follow the `libc::accept` contract.
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, len: *mut socklen_t) -> c_int {
    let n = blocking_io(fd, Interest::READ, || unsafe {
        libc::accept(fd, addr, len) as ssize_t
    });
    let client = n as c_int;
    if client >= 0 && is_hook_enabled() {
        if let Err(e) = fd_table().register(client) {
            warn!("failed to register context for accepted fd {}: {}", client, e);
        }
    }
    client
}

/// # Safety
/// `buf` must be writable for `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    blocking_io(fd, Interest::READ, || unsafe { libc::read(fd, buf, count) })
}

/// # Safety
/// `buf` must be readable for `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    blocking_io(fd, Interest::WRITE, || unsafe { libc::write(fd, buf, count) })
}

/// Single-argument `fcntl`. `F_GETFL` masks out the non-blocking bit
/// the runtime forced on unless the program asked for it; `F_SETFL`
/// records the program's preference and keeps the forced bit alive.
///
/// # Safety
/// `arg` must be the right operand for `cmd`, as for `libc::fcntl`.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: libc::c_long) -> c_int {
    match cmd {
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return flags;
            }
            match fd_table().get(fd) {
                Some(ctx) if ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if let Some(ctx) = fd_table().get(fd) {
                if ctx.is_socket() {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    }
                }
            }
            libc::fcntl(fd, libc::F_SETFL, flags)
        }
        _ => libc::fcntl(fd, cmd, arg),
    }
}

/// For managed sockets `SO_RCVTIMEO`/`SO_SNDTIMEO` report the timeout
/// the runtime tracks; everything else forwards.
///
/// # Safety
/// Pointer arguments follow the `libc::getsockopt` contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && !optlen.is_null()
        && *optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd_table().get(fd) {
            let dir = if optname == libc::SO_RCVTIMEO {
                Interest::READ
            } else {
                Interest::WRITE
            };
            let tv = &mut *(optval as *mut libc::timeval);
            match ctx.timeout(dir) {
                Some(d) => {
                    tv.tv_sec = d.as_secs() as libc::time_t;
                    tv.tv_usec = libc::suseconds_t::from(d.subsec_micros());
                }
                None => {
                    tv.tv_sec = 0;
                    tv.tv_usec = 0;
                }
            }
            *optlen = std::mem::size_of::<libc::timeval>() as socklen_t;
            return 0;
        }
    }
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into the fd's context (they
/// drive the hooked I/O timeout) and always forwarded unchanged.
///
/// # Safety
/// Pointer arguments follow the `libc::setsockopt` contract.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd_table().get(fd) {
            let tv = &*(optval as *const libc::timeval);
            if tv.tv_sec >= 0 && tv.tv_usec >= 0 {
                let dur = Duration::new(tv.tv_sec as u64, tv.tv_usec as u32 * 1000);
                let dir = if optname == libc::SO_RCVTIMEO {
                    Interest::READ
                } else {
                    Interest::WRITE
                };
                ctx.set_timeout(dir, Some(dur));
            }
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}
