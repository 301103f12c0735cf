//! Deadline-ordered timers over one kernel `timerfd`.
//!
//! All timers of a scheduler live in one ordered set; a single
//! `CLOCK_MONOTONIC` timerfd is armed at the earliest deadline and its
//! readability wakes the reactor, which then drains the expired prefix.
//! Repeating timers reinsert themselves at `now + interval`; condition
//! timers fire only while their weak liveness token is still alive.

use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::prelude::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use smallvec::SmallVec;

/// Process-unique timer id. 0 is reserved as invalid.
pub type TimerId = u32;

pub type TimerCallback = std::sync::Arc<dyn Fn() + Send + Sync + 'static>;

/// weak liveness token of a condition timer
pub type LivenessToken = Weak<dyn Any + Send + Sync>;

static NEXT_TIMER_ID: AtomicU32 = AtomicU32::new(1);

struct TimerEntry {
    // zero means one-shot
    interval: Duration,
    cb: TimerCallback,
    token: Option<LivenessToken>,
}

/// Set of timers keyed by absolute deadline, ties broken by id.
pub struct TimerSet {
    timer_fd: TimerFd,
    timers: Mutex<BTreeMap<(Instant, TimerId), TimerEntry>>,
}

impl TimerSet {
    pub fn new() -> io::Result<TimerSet> {
        let timer_fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(io::Error::from)?;
        Ok(TimerSet {
            timer_fd,
            timers: Mutex::new(BTreeMap::new()),
        })
    }

    /// the fd the reactor registers for READ
    pub fn as_raw_fd(&self) -> RawFd {
        self.timer_fd.as_fd().as_raw_fd()
    }

    /// Inserts a timer firing at `deadline`; a non-zero `interval` makes
    /// it repeat.
    pub fn add_timer(
        &self,
        deadline: Instant,
        interval: Duration,
        cb: TimerCallback,
    ) -> TimerId {
        self.insert(deadline, interval, cb, None)
    }

    /// Inserts a timer that is silently dropped at fire time once
    /// `token` has no strong owner left.
    pub fn add_condition_timer(
        &self,
        deadline: Instant,
        interval: Duration,
        cb: TimerCallback,
        token: LivenessToken,
    ) -> TimerId {
        self.insert(deadline, interval, cb, Some(token))
    }

    fn insert(
        &self,
        deadline: Instant,
        interval: Duration,
        cb: TimerCallback,
        token: Option<LivenessToken>,
    ) -> TimerId {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().unwrap();
        let new_min = timers
            .keys()
            .next()
            .map_or(true, |(first, _)| deadline < *first);
        timers.insert((deadline, id), TimerEntry { interval, cb, token });
        if new_min {
            self.rearm(&timers);
        }
        id
    }

    /// Removes a pending timer. Returns false when `id` is not pending
    /// (already fired or never existed).
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.timers.lock().unwrap();
        let key = match timers.keys().find(|(_, tid)| *tid == id) {
            Some(k) => *k,
            None => return false,
        };
        let was_min = timers.keys().next() == Some(&key);
        timers.remove(&key);
        if was_min {
            self.rearm(&timers);
        }
        true
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.lock().unwrap().keys().any(|(_, tid)| *tid == id)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().unwrap().is_empty()
    }

    /// Pops every timer with `deadline <= now` and returns their
    /// callbacks in ascending deadline order. Repeating timers are
    /// reinserted; dead condition timers are skipped.
    pub fn drain_expired(&self) -> SmallVec<[TimerCallback; 8]> {
        // clear the readable state first so a later expiration produces
        // a fresh edge
        let mut buf = [0u8; 8];
        let ret = unsafe {
            libc::read(
                self.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("failed to read the timerfd: {}", err);
            }
        }

        let mut fired = SmallVec::new();
        let now = Instant::now();
        let mut timers = self.timers.lock().unwrap();
        loop {
            let key = match timers.keys().next() {
                Some(k) if k.0 <= now => *k,
                _ => break,
            };
            let entry = timers.remove(&key).unwrap();
            if let Some(token) = &entry.token {
                if token.upgrade().is_none() {
                    trace!("condition timer {} dropped, token is dead", key.1);
                    continue;
                }
            }
            fired.push(entry.cb.clone());
            if !entry.interval.is_zero() {
                timers.insert((now + entry.interval, key.1), entry);
            }
        }
        self.rearm(&timers);
        fired
    }

    // arm the timerfd at the minimum deadline, or disarm when empty;
    // callers hold the timers lock
    fn rearm(&self, timers: &BTreeMap<(Instant, TimerId), TimerEntry>) {
        let result = match timers.keys().next() {
            Some((deadline, _)) => {
                let mut delay = deadline.saturating_duration_since(Instant::now());
                if delay.is_zero() {
                    // already due: the shortest legal arming still fires
                    delay = Duration::from_nanos(1);
                }
                self.timer_fd.set(
                    Expiration::OneShot(TimeSpec::from_duration(delay)),
                    TimerSetTimeFlags::empty(),
                )
            }
            None => self.timer_fd.unset(),
        };
        if let Err(e) = result {
            error!("failed to arm the timerfd: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn timerfd_readable(set: &TimerSet, wait_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: set.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, wait_ms) > 0 }
    }

    #[test]
    fn fires_in_deadline_order() {
        let set = TimerSet::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        for (tag, offset_ms) in [("b", 20u64), ("a", 10), ("c", 30)] {
            let o = order.clone();
            set.add_timer(
                now + Duration::from_millis(offset_ms),
                Duration::ZERO,
                Arc::new(move || o.lock().unwrap().push(tag)),
            );
        }
        std::thread::sleep(Duration::from_millis(50));
        for cb in set.drain_expired() {
            cb();
        }
        assert_eq!(&*order.lock().unwrap(), &["a", "b", "c"]);
        assert!(set.is_empty());
    }

    #[test]
    fn kernel_handle_tracks_minimum() {
        let set = TimerSet::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let far = set.add_timer(
            Instant::now() + Duration::from_secs(600),
            Duration::ZERO,
            counter_cb(&hits),
        );
        // a far-away timer must not make the fd readable
        assert!(!timerfd_readable(&set, 20));

        let near = set.add_timer(
            Instant::now() + Duration::from_millis(10),
            Duration::ZERO,
            counter_cb(&hits),
        );
        // new minimum rearms the handle
        assert!(timerfd_readable(&set, 500));
        assert!(set.has_timer(near));

        for cb in set.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!set.has_timer(near));
        assert!(set.has_timer(far));

        // cancelling the only element disarms the handle
        assert!(set.cancel_timer(far));
        assert!(set.is_empty());
        assert!(!timerfd_readable(&set, 20));
        assert!(!set.cancel_timer(far));
    }

    #[test]
    fn repeating_timer_reinserts() {
        let set = TimerSet::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = set.add_timer(
            Instant::now() + Duration::from_millis(5),
            Duration::from_millis(5),
            counter_cb(&hits),
        );
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            for cb in set.drain_expired() {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(set.has_timer(id));
        assert!(set.cancel_timer(id));
    }

    #[test]
    fn dead_condition_timer_is_skipped() {
        let set = TimerSet::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let live: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        let dead: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        let dead_token: LivenessToken = Arc::downgrade(&dead);
        drop(dead);

        set.add_condition_timer(Instant::now(), Duration::ZERO, counter_cb(&hits), dead_token);
        let live_token: LivenessToken = Arc::downgrade(&live);
        set.add_condition_timer(Instant::now(), Duration::ZERO, counter_cb(&hits), live_token);

        std::thread::sleep(Duration::from_millis(5));
        let fired = set.drain_expired();
        assert_eq!(fired.len(), 1);
        for cb in fired {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}
