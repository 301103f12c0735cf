//! Per-scheduler event multiplexer over edge-triggered epoll.
//!
//! The poller owns the fd -> event map, the wakeup [`Notifier`] and the
//! scheduler's [`TimerSet`]; the latter two ride on the same epoll
//! instance through reserved tokens. Worker coroutines register a
//! per-direction continuation and suspend; readiness detaches the
//! continuation under the event's lock and hands it back to the
//! scheduler, so each registration fires at most once per edge.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock, Weak};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use smallvec::SmallVec;

use crate::notify::Notifier;
use crate::scheduler::{Inner as SchedulerInner, Runnable};
use crate::timer::TimerSet;

bitflags::bitflags! {
    /// Direction interest of an I/O registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

// reserved epoll tokens; user registrations carry their fd
const NOTIFY_TOKEN: u64 = u64::MAX;
const TIMER_TOKEN: u64 = u64::MAX - 1;

const MAX_EVENTS: usize = 64;
const POLL_TIMEOUT_MS: u16 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    New,
    Added,
    Deleted,
}

struct EventState {
    interest: Interest,
    read: Option<Runnable>,
    write: Option<Runnable>,
    stage: Stage,
}

/// one registered fd; the state behind its own short lock
struct IoEvent {
    fd: RawFd,
    state: Mutex<EventState>,
}

impl IoEvent {
    fn new(fd: RawFd) -> IoEvent {
        IoEvent {
            fd,
            state: Mutex::new(EventState {
                interest: Interest::empty(),
                read: None,
                write: None,
                stage: Stage::New,
            }),
        }
    }
}

fn interest_to_epoll(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::EPOLLET;
    if interest.contains(Interest::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.contains(Interest::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

pub struct EpollPoller {
    epoll: Epoll,
    notifier: Notifier,
    timers: TimerSet,
    events: RwLock<HashMap<RawFd, Arc<IoEvent>>>,
    owner: Weak<SchedulerInner>,
}

impl EpollPoller {
    pub(crate) fn new(owner: Weak<SchedulerInner>) -> io::Result<EpollPoller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        let notifier = Notifier::new()?;
        let timers = TimerSet::new()?;

        // the notifier is level-triggered on purpose: while a count is
        // pending every parked worker gets through its poll and rescans
        // the run queue, which is what delivers affinity-bound tasks
        epoll
            .add(
                unsafe { BorrowedFd::borrow_raw(notifier.as_raw_fd()) },
                EpollEvent::new(EpollFlags::EPOLLIN, NOTIFY_TOKEN),
            )
            .map_err(io::Error::from)?;
        epoll
            .add(
                unsafe { BorrowedFd::borrow_raw(timers.as_raw_fd()) },
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, TIMER_TOKEN),
            )
            .map_err(io::Error::from)?;

        Ok(EpollPoller {
            epoll,
            notifier,
            timers,
            events: RwLock::new(HashMap::new()),
            owner,
        })
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Adds or widens the registration of `fd`.
    ///
    /// With `runnable` absent the captured continuation is the currently
    /// running coroutine, i.e. the caller suspends right after this
    /// call. At most one continuation may be armed per direction.
    pub(crate) fn update_event(
        &self,
        fd: RawFd,
        interest: Interest,
        runnable: Option<Runnable>,
    ) -> io::Result<()> {
        assert!(!interest.is_empty(), "update_event with empty interest");
        let cont = match runnable {
            Some(r) => r,
            None => Runnable::Co(
                crate::coroutine::this_thread::current()
                    .expect("no current coroutine to capture as continuation"),
            ),
        };

        let event = {
            let mut events = self.events.write().unwrap();
            events
                .entry(fd)
                .or_insert_with(|| Arc::new(IoEvent::new(fd)))
                .clone()
        };

        let mut st = event.state.lock().unwrap();
        debug_assert!(
            !interest.contains(Interest::READ) || st.read.is_none(),
            "read continuation already armed for fd {}",
            fd
        );
        debug_assert!(
            !interest.contains(Interest::WRITE) || st.write.is_none(),
            "write continuation already armed for fd {}",
            fd
        );

        if interest.contains(Interest::READ) && interest.contains(Interest::WRITE) {
            match &cont {
                Runnable::Co(co) => {
                    st.read = Some(Runnable::Co(co.clone()));
                    st.write = Some(cont);
                }
                Runnable::Call(_) => {
                    // a one-shot callback cannot wait on two directions
                    return Err(io::Error::from(io::ErrorKind::InvalidInput));
                }
            }
        } else if interest.contains(Interest::READ) {
            st.read = Some(cont);
        } else {
            st.write = Some(cont);
        }

        st.interest |= interest;
        let mut ep_event = EpollEvent::new(interest_to_epoll(st.interest), fd as u64);
        let res = if st.stage == Stage::Added {
            self.epoll
                .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut ep_event)
        } else {
            self.epoll
                .add(unsafe { BorrowedFd::borrow_raw(fd) }, ep_event)
        };
        match res {
            Ok(()) => {
                st.stage = Stage::Added;
                Ok(())
            }
            Err(e) => {
                error!("epoll registration failed, fd={}, err={}", fd, e);
                // roll the record back so a later attempt starts clean
                if interest.contains(Interest::READ) {
                    st.read = None;
                }
                if interest.contains(Interest::WRITE) {
                    st.write = None;
                }
                st.interest.remove(interest);
                Err(io::Error::from(e))
            }
        }
    }

    /// Clears the masked directions and discards their continuations;
    /// deregisters from the kernel once no interest remains.
    pub(crate) fn cancel_event(&self, fd: RawFd, mask: Interest) {
        let event = match self.events.read().unwrap().get(&fd) {
            Some(e) => e.clone(),
            None => return,
        };
        let mut st = event.state.lock().unwrap();
        let clear = st.interest & mask;
        if clear.is_empty() {
            return;
        }
        if clear.contains(Interest::READ) {
            st.read = None;
        }
        if clear.contains(Interest::WRITE) {
            st.write = None;
        }
        st.interest.remove(clear);
        self.sync_kernel(fd, &mut st);
    }

    /// Like [`cancel_event`](Self::cancel_event) but submits the masked
    /// continuations instead of discarding them. Used by the I/O
    /// timeout path to push a blocked waiter through its retry loop.
    /// Returns true when something was resumed.
    pub(crate) fn trigger_event(&self, fd: RawFd, mask: Interest) -> bool {
        let event = match self.events.read().unwrap().get(&fd) {
            Some(e) => e.clone(),
            None => return false,
        };
        let mut detached: SmallVec<[Runnable; 2]> = SmallVec::new();
        {
            let mut st = event.state.lock().unwrap();
            let hit = st.interest & mask;
            if hit.is_empty() {
                return false;
            }
            if hit.contains(Interest::READ) {
                detached.extend(st.read.take());
            }
            if hit.contains(Interest::WRITE) {
                detached.extend(st.write.take());
            }
            st.interest.remove(hit);
            self.sync_kernel(fd, &mut st);
        }
        let fired = !detached.is_empty();
        self.submit_all(detached);
        fired
    }

    // downgrade or drop the kernel registration to the remaining
    // interest; callers hold the event lock
    fn sync_kernel(&self, fd: RawFd, st: &mut EventState) {
        let res = if st.interest.is_empty() {
            st.stage = Stage::Deleted;
            self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) })
        } else {
            let mut ev = EpollEvent::new(interest_to_epoll(st.interest), fd as u64);
            self.epoll
                .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut ev)
        };
        if let Err(e) = res {
            // the fd may have been closed under us; nothing to salvage
            debug!("epoll downgrade failed, fd={}, err={}", fd, e);
        }
    }

    /// One pass of the reactor: block in the kernel multiplexer up to
    /// ~5 s, then dispatch whatever became ready. Runs on the idle
    /// coroutine of a worker belonging to the owning scheduler.
    pub(crate) fn poll_and_handle(&self) {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let n = loop {
            match self.epoll.wait(&mut events, EpollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("epoll_wait failed: {}", e);
                    return;
                }
            }
        };

        for event in &events[..n] {
            match event.data() {
                NOTIFY_TOKEN => self.notifier.drain(),
                TIMER_TOKEN => self.handle_expired_timers(),
                token => self.dispatch_ready(token as RawFd, event.events()),
            }
        }
    }

    fn handle_expired_timers(&self) {
        let owner = match self.owner.upgrade() {
            Some(o) => o,
            None => return,
        };
        for cb in self.timers.drain_expired() {
            owner.submit_runnable(Runnable::Call(Box::new(move || cb())), 0);
        }
    }

    fn dispatch_ready(&self, fd: RawFd, flags: EpollFlags) {
        let event = match self.events.read().unwrap().get(&fd) {
            Some(e) => e.clone(),
            None => {
                debug!("ready event for unknown fd {}, ignored", fd);
                return;
            }
        };
        debug_assert_eq!(event.fd, fd);

        let mut detached: SmallVec<[Runnable; 2]> = SmallVec::new();
        {
            let mut st = event.state.lock().unwrap();

            let mut ready = Interest::empty();
            if flags
                .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLPRI)
            {
                ready |= Interest::READ;
            }
            // a hangup with no pending input still means EOF for the
            // read waiter
            if flags.contains(EpollFlags::EPOLLHUP) {
                ready |= Interest::READ;
            }
            if flags.contains(EpollFlags::EPOLLOUT) {
                ready |= Interest::WRITE;
            }
            // the retried syscall reports the error to both directions
            if flags.contains(EpollFlags::EPOLLERR) {
                ready |= Interest::READ | Interest::WRITE;
            }

            ready &= st.interest;
            if ready.is_empty() {
                // another worker already took this readiness
                return;
            }

            if ready.contains(Interest::READ) {
                detached.extend(st.read.take());
            }
            if ready.contains(Interest::WRITE) {
                detached.extend(st.write.take());
            }
            st.interest.remove(ready);
            self.sync_kernel(fd, &mut st);
        }
        self.submit_all(detached);
    }

    fn submit_all(&self, detached: SmallVec<[Runnable; 2]>) {
        if detached.is_empty() {
            return;
        }
        match self.owner.upgrade() {
            Some(owner) => {
                for r in detached {
                    owner.submit_runnable(r, 0);
                }
            }
            None => warn!("continuations dropped, owning scheduler is gone"),
        }
    }
}
