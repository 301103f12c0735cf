//! Worker pool, task queue and the per-thread dispatch loop.
//!
//! A [`Scheduler`] owns one reactor and `worker_count` dispatch loops.
//! Tasks are coroutines or bare callbacks (promoted to a coroutine on
//! first dispatch) with optional thread affinity; the queue is a single
//! FIFO and affinity is a filter applied at pop time. A worker with
//! nothing to run swaps into its idle coroutine, which parks inside the
//! reactor poll until a notification, timer or readiness event arrives.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::config;
use crate::coroutine::{self, Coroutine, State};
use crate::hook;
use crate::poller::{EpollPoller, Interest};
use crate::pool;
use crate::thread::OsThread;
use crate::timer::{LivenessToken, TimerCallback, TimerId};

/// a continuation: exactly one of a coroutine or a bare callback
pub(crate) enum Runnable {
    Co(Arc<Coroutine>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// explicit continuation form accepted by the event API
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// queue entry: a runnable plus its affinity (0 = any worker)
pub(crate) struct Task {
    runnable: Runnable,
    target: libc::pthread_t,
}

thread_local! {
    static TL_SCHEDULER: std::cell::RefCell<Weak<Inner>> =
        std::cell::RefCell::new(Weak::new());
}

fn set_thread_scheduler(w: Weak<Inner>) {
    TL_SCHEDULER.with(|s| *s.borrow_mut() = w);
}

// a cancelled coroutine unwinds with the generator crate's Cancel
// payload; keep the default hook from reporting it as a crash
fn filter_cancel_panic() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let old = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(&generator::Error::Cancel) =
                info.payload().downcast_ref::<generator::Error>()
            {
                return;
            }
            old(info);
        }));
    });
}

/// The scheduler whose dispatch loop runs on the current thread, if
/// any. Hooked syscalls use this to find their suspension machinery.
pub fn current() -> Option<Scheduler> {
    TL_SCHEDULER
        .with(|s| s.borrow().upgrade())
        .map(|inner| Scheduler { inner })
}

pub(crate) struct Inner {
    name: String,
    worker_count: usize,
    // starts true; start() flips it once
    stopped: AtomicBool,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    queue: Mutex<VecDeque<Task>>,
    workers: Mutex<Vec<OsThread>>,
    poller: EpollPoller,
    // pthread of the constructing thread when it participates, else 0
    root_pthread: libc::pthread_t,
    dummy_main: Mutex<Option<Arc<Coroutine>>>,
}

/// Handle to a worker pool scheduling coroutines over an epoll reactor.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Builds a scheduler with `worker_count` dispatch threads (0 means
    /// one per CPU). With `include_calling_thread` the constructing
    /// thread becomes one of the workers: it gets a dummy-main
    /// scheduling coroutine that drains the queue when [`stop`] is
    /// called on it.
    ///
    /// [`stop`]: Scheduler::stop
    pub fn new(worker_count: usize, include_calling_thread: bool, name: &str) -> Scheduler {
        filter_cancel_panic();
        let worker_count = if worker_count == 0 {
            num_cpus::get()
        } else {
            worker_count
        };
        assert!(
            !include_calling_thread || worker_count >= 1,
            "the calling thread counts against worker_count"
        );
        let root_pthread = if include_calling_thread {
            unsafe { libc::pthread_self() }
        } else {
            0
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let poller = EpollPoller::new(weak.clone()).unwrap_or_else(|e| {
                error!("failed to create the event poller: {}, aborting", e);
                std::process::abort();
            });
            Inner {
                name: name.to_owned(),
                worker_count,
                stopped: AtomicBool::new(true),
                active_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
                workers: Mutex::new(Vec::new()),
                poller,
                root_pthread,
                dummy_main: Mutex::new(None),
            }
        });

        if include_calling_thread {
            coroutine::this_thread::ensure_main();
            let w = Arc::downgrade(&inner);
            let dummy = Coroutine::new_dummy_main(
                Box::new(move || {
                    if let Some(inner) = w.upgrade() {
                        Inner::scheduling_fn(&inner);
                    }
                }),
                config::stack_size(),
            );
            coroutine::this_thread::set_scheduling(Some(dummy.clone()));
            *inner.dummy_main.lock().unwrap() = Some(dummy);
            set_thread_scheduler(Arc::downgrade(&inner));
        }

        info!("scheduler [{}] constructed, workers={}", name, worker_count);
        Scheduler { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawns the worker threads. Idempotent.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner
            .stopped
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let spawn_n = inner.worker_count - (inner.root_pthread != 0) as usize;
        let mut workers = inner.workers.lock().unwrap();
        for i in 0..spawn_n {
            let worker_inner = inner.clone();
            let name = format!("{}_{}", inner.name, i);
            let t = OsThread::spawn(&name, move || Inner::scheduling_fn(&worker_inner))
                .unwrap_or_else(|e| {
                    error!("failed to spawn worker [{}]: {}, aborting", name, e);
                    std::process::abort();
                });
            workers.push(t);
        }
        info!("scheduler [{}] started", inner.name);
    }

    /// Stops the pool: sets the stop flag, posts one notification per
    /// worker, drains the dummy-main when called on the constructing
    /// thread, then joins every worker. Idempotent; concurrent callers
    /// after the first return immediately.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("scheduler [{}] stopping", inner.name);
        inner.poller.notifier().notify(inner.worker_count as u64);

        let dummy = inner.dummy_main.lock().unwrap().take();
        if let Some(dummy) = dummy {
            if inner.root_pthread == unsafe { libc::pthread_self() } {
                // the constructing thread drains its share of the queue
                dummy.swap_in();
                debug_assert!(matches!(dummy.state(), State::Terminal | State::Except));
            } else {
                warn!(
                    "scheduler [{}] stopped off its constructing thread; \
                     that thread's dispatch loop never ran",
                    inner.name
                );
            }
        }

        let mut workers = inner.workers.lock().unwrap();
        for t in workers.iter_mut() {
            t.join();
        }
        workers.clear();
        debug_assert!(inner.queue.lock().unwrap().is_empty());
        debug_assert_eq!(inner.active_workers.load(Ordering::Acquire), 0);
        info!("scheduler [{}] stopped", inner.name);
    }

    /// Stop has been requested, the queue is drained and no worker is
    /// executing a task.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// workers currently executing a task
    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::Acquire)
    }

    /// workers currently parked in the reactor poll
    pub fn idle_workers(&self) -> usize {
        self.inner.idle_workers.load(Ordering::Acquire)
    }

    /// Appends a callback task for any worker.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_runnable(Runnable::Call(Box::new(f)), 0);
    }

    /// Appends a callback task bound to the worker with the given
    /// pthread id (see [`worker_threads`](Scheduler::worker_threads)).
    pub fn submit_to<F>(&self, target: libc::pthread_t, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_runnable(Runnable::Call(Box::new(f)), target);
    }

    /// Appends a coroutine task; the coroutine must be runnable when a
    /// worker picks it up.
    pub fn submit_coroutine(&self, co: Arc<Coroutine>) {
        self.inner.submit_runnable(Runnable::Co(co), 0);
    }

    pub fn submit_coroutine_to(&self, target: libc::pthread_t, co: Arc<Coroutine>) {
        self.inner.submit_runnable(Runnable::Co(co), target);
    }

    /// pthread ids of every dispatch thread, usable as affinity targets
    pub fn worker_threads(&self) -> Vec<libc::pthread_t> {
        let mut ids: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.pthread_id())
            .collect();
        if self.inner.root_pthread != 0 {
            ids.push(self.inner.root_pthread);
        }
        ids
    }

    /// Registers interest on `fd`; `cb` runs once when the direction
    /// becomes ready. Pass `None` to capture the currently running
    /// coroutine and suspend after this call.
    pub fn update_event(
        &self,
        fd: RawFd,
        interest: Interest,
        cb: Option<EventCallback>,
    ) -> io::Result<()> {
        self.inner
            .poller
            .update_event(fd, interest, cb.map(Runnable::Call))
    }

    /// Drops the masked directions of `fd`, discarding their pending
    /// continuations.
    pub fn cancel_event(&self, fd: RawFd, mask: Interest) {
        self.inner.poller.cancel_event(fd, mask);
    }

    pub(crate) fn trigger_event(&self, fd: RawFd, mask: Interest) -> bool {
        self.inner.poller.trigger_event(fd, mask)
    }

    pub(crate) fn wait_event(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.inner.poller.update_event(fd, interest, None)
    }

    /// Runs `f` as a task at the absolute deadline. Returns the timer
    /// id (never 0).
    pub fn run_at<F>(&self, deadline: Instant, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .poller
            .timers()
            .add_timer(deadline, Duration::ZERO, Arc::new(f))
    }

    /// Runs `f` once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.run_at(Instant::now() + delay, f)
    }

    /// Runs `f` every `interval`, first firing one interval from now.
    pub fn run_every<F>(&self, interval: Duration, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .poller
            .timers()
            .add_timer(Instant::now() + interval, interval, Arc::new(f))
    }

    /// Condition timer: skipped silently at fire time when `token` has
    /// no strong owner left.
    pub fn run_at_if<F>(&self, deadline: Instant, f: F, token: LivenessToken) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cb: TimerCallback = Arc::new(f);
        self.inner
            .poller
            .timers()
            .add_condition_timer(deadline, Duration::ZERO, cb, token)
    }

    pub fn run_after_if<F>(&self, delay: Duration, f: F, token: LivenessToken) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.run_at_if(Instant::now() + delay, f, token)
    }

    /// Removes a pending timer; false when it already fired or never
    /// existed.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.poller.timers().cancel_timer(id)
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.inner.poller.timers().has_timer(id)
    }
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }

    pub(crate) fn submit_runnable(&self, runnable: Runnable, target: libc::pthread_t) {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(Task { runnable, target });
            was_empty
        };
        // affinity tasks always notify: the one notified worker may not
        // be the target, but a pending count lets every parked worker
        // through its poll to rescan
        if was_empty || target != 0 {
            self.poller.notifier().notify(1);
        }
    }

    /// the dispatch loop; runs on every worker thread, and inside the
    /// dummy-main coroutine on the constructing thread
    fn scheduling_fn(self: &Arc<Inner>) {
        let me = unsafe { libc::pthread_self() };
        let on_root = self.root_pthread != 0 && me == self.root_pthread;

        coroutine::this_thread::ensure_main();
        if !on_root {
            // the constructing thread had its scheduling coroutine (the
            // dummy-main we are running inside) installed at build time
            coroutine::this_thread::set_scheduling(Some(coroutine::this_thread::main_coroutine()));
            set_thread_scheduler(Arc::downgrade(self));
        }
        hook::enable_hook(true);
        debug!("scheduler [{}] dispatch loop up on {:?}", self.name, std::thread::current().name());

        let weak = Arc::downgrade(self);
        let idle = Coroutine::new_boxed(
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.idle_fn();
                }
            }),
            config::stack_size(),
        );

        // reusable wrapper for bare callbacks
        let mut temp: Option<Arc<Coroutine>> = None;

        loop {
            let mut picked: Option<Task> = None;
            let mut notify_more = false;
            let mut skipped_affinity = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    let eligible = {
                        let t = &q[i];
                        t.target == 0 || t.target == me
                    };
                    if !eligible {
                        skipped_affinity = true;
                        i += 1;
                        continue;
                    }
                    picked = q.remove(i);
                    notify_more = q
                        .iter()
                        .skip(i)
                        .any(|t| t.target == 0 || t.target == me);
                    break;
                }
            }
            if notify_more {
                // let another worker take the next entry
                self.poller.notifier().notify(1);
            }

            match picked {
                Some(Task {
                    runnable: Runnable::Co(co),
                    target,
                }) => match co.state() {
                    State::Exec => {
                        // the coroutine is still swapping out on another
                        // thread; retry shortly
                        self.submit_runnable(Runnable::Co(co), target);
                    }
                    State::Terminal | State::Except => {
                        debug!("stale task for finished coroutine {}, dropped", co.id());
                    }
                    _ => {
                        self.run_task(&co);
                        match co.state() {
                            State::Ready => self.submit_runnable(Runnable::Co(co), target),
                            State::Terminal | State::Except => pool::put(co),
                            // already marked Hold by its yield; whoever
                            // armed it may own (and resume) it by now,
                            // so no state write from here
                            _ => {}
                        }
                    }
                },
                Some(Task {
                    runnable: Runnable::Call(f),
                    target,
                }) => {
                    let co = match temp.take() {
                        Some(co) => {
                            co.reset_boxed(f);
                            co
                        }
                        None => pool::get(f),
                    };
                    self.run_task(&co);
                    match co.state() {
                        State::Ready => self.submit_runnable(Runnable::Co(co), target),
                        // keep the finished wrapper for the next callback
                        State::Terminal | State::Except => temp = Some(co),
                        // suspended in Hold: the reactor or a timer owns
                        // it now, the wrapper is not reusable
                        _ => {}
                    }
                }
                None => {
                    if skipped_affinity {
                        // the queue still holds work bound to other
                        // threads; rescan instead of parking so a stop
                        // or a freed target is picked up promptly
                        std::thread::yield_now();
                        continue;
                    }
                    if matches!(idle.state(), State::Terminal | State::Except) {
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::AcqRel);
                    idle.swap_in();
                    self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                    debug_assert!(!matches!(idle.state(), State::Init | State::Exec));
                }
            }
        }

        if let Some(co) = temp {
            pool::put(co);
        }
        // wake the next parked worker so it re-checks the stop condition
        // instead of sitting out its full poll timeout
        self.poller.notifier().notify(1);
        hook::enable_hook(false);
        coroutine::this_thread::set_scheduling(None);
        if !on_root {
            set_thread_scheduler(Weak::new());
        }
        debug!("scheduler [{}] dispatch loop down", self.name);
    }

    fn run_task(&self, co: &Arc<Coroutine>) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
        co.swap_in();
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    /// body of the per-worker idle coroutine
    fn idle_fn(&self) {
        debug!("idle coroutine of scheduler [{}] started", self.name);
        while !self.is_stopped() {
            self.poller.poll_and_handle();
            Coroutine::yield_to_hold();
        }
        debug!("idle coroutine of scheduler [{}] finished", self.name);
    }
}
