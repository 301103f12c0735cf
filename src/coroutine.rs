//! Stackful coroutines with explicit suspend/resume.
//!
//! A [`Coroutine`] owns a private stack and a saved machine context built
//! on the [generator] crate. The scheduling coroutine of a thread swaps a
//! runnable coroutine in with [`Coroutine::swap_in`]; the running
//! coroutine gives the CPU back with [`Coroutine::yield_to_hold`] or
//! [`Coroutine::yield_to_ready`]. Every thread that touches coroutines
//! owns a "main" coroutine that borrows the OS thread stack and anchors
//! the per-thread context chain.
//!
//! [generator]: https://docs.rs/generator

use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use generator::{co_yield_with, Generator, Gn};

use crate::config;

/// Process-unique coroutine id. 0 is reserved as invalid.
pub type CoroutineId = u32;

/// the raw stackful context, yields nothing and takes nothing
pub type CoroutineImpl = Generator<'static, (), ()>;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Coroutine lifecycle states.
///
/// `Init -> Exec -> (Hold | Ready | Terminal | Except)`; `Hold` and
/// `Ready` go back to `Exec` on the next swap-in; `Terminal`/`Except`
/// only leave through [`Coroutine::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Exec = 1,
    Hold = 2,
    Ready = 3,
    Terminal = 4,
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Exec,
            2 => State::Hold,
            3 => State::Ready,
            4 => State::Terminal,
            5 => State::Except,
            _ => unreachable!("invalid coroutine state tag"),
        }
    }
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// A stackful execution unit.
///
/// Instances are shared through `Arc` between the task queue, the
/// reactor and the dispatch loop, but the scheduler guarantees at most
/// one thread holds a coroutine in `Exec` at a time. Methods that touch
/// the context are not safe for concurrent calls on one instance; the
/// queue/reactor hand-off provides the required exclusion.
pub struct Coroutine {
    id: CoroutineId,
    stack_size: usize,
    is_dummy_main: bool,
    state: AtomicU8,
    // None for a "main" coroutine that borrows the OS thread stack.
    // UnsafeCell: the cell is read from inside the running generator
    // (yield helpers) while `swap_in` is live on the owning thread, so a
    // RefCell guard cannot span the resume.
    gen: UnsafeCell<Option<CoroutineImpl>>,
}

// The generator inside is only ever touched by the thread that currently
// runs the dispatch loop holding this coroutine; the scheduler moves
// tasks out of the queue before resuming them, so no two threads call
// into the same instance at once. State is atomic for the cross-thread
// reads the scheduler and reactor perform.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Creates a coroutine with a private stack running `f` on first
    /// swap-in.
    ///
    /// The current thread gets a main coroutine on demand, as the context
    /// chain needs an anchor before any worker coroutine can run.
    pub fn new<F>(f: F, stack_size: usize) -> Arc<Coroutine>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack(Box::new(f), stack_size, false)
    }

    pub(crate) fn new_boxed(f: EntryFn, stack_size: usize) -> Arc<Coroutine> {
        Self::with_stack(f, stack_size, false)
    }

    /// Creates the per-thread scheduling coroutine used by a scheduler
    /// whose constructing thread participates in dispatch.
    pub(crate) fn new_dummy_main(f: EntryFn, stack_size: usize) -> Arc<Coroutine> {
        Self::with_stack(f, stack_size, true)
    }

    fn with_stack(f: EntryFn, stack_size: usize, is_dummy_main: bool) -> Arc<Coroutine> {
        this_thread::ensure_main();
        let g: CoroutineImpl = Gn::new_opt(stack_size, Self::trampoline(f));
        let co = Arc::new(Coroutine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            is_dummy_main,
            state: AtomicU8::new(State::Init as u8),
            gen: UnsafeCell::new(Some(g)),
        });
        debug!("coroutine constructed, id={}", co.id);
        co
    }

    // main coroutine for a thread: no own stack, starts out executing
    fn new_main() -> Arc<Coroutine> {
        Arc::new(Coroutine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            is_dummy_main: false,
            state: AtomicU8::new(State::Exec as u8),
            gen: UnsafeCell::new(None),
        })
    }

    /// the entry that every worker coroutine starts in
    ///
    /// Sets the final state from inside so the dispatch loop observes
    /// `Terminal`/`Except` right after `resume` returns. Panics from the
    /// entry are trapped here and never unwind across a swap boundary;
    /// the generator's own cancel payload is passed through untouched.
    fn trampoline(f: EntryFn) -> impl FnOnce() + Send + 'static {
        move || {
            let cur =
                this_thread::current().expect("trampoline entered without a current coroutine");
            debug_assert_eq!(cur.state(), State::Exec);

            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => cur.set_state(State::Terminal),
                Err(cause) => {
                    if let Some(&generator::Error::Cancel) =
                        cause.downcast_ref::<generator::Error>()
                    {
                        panic::resume_unwind(cause);
                    }
                    cur.set_state(State::Except);
                    let msg = cause
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| cause.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                    error!("coroutine {} terminated by panic: {}", cur.id(), msg);
                }
            }
            // returning completes the generator; control goes back to the
            // frame that resumed us
        }
    }

    #[inline]
    fn gen_ref(&self) -> &Option<CoroutineImpl> {
        unsafe { &*self.gen.get() }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn gen_mut(&self) -> &mut Option<CoroutineImpl> {
        unsafe { &mut *self.gen.get() }
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// `Init`, `Hold` and `Ready` coroutines may be swapped in.
    pub fn is_runnable(&self) -> bool {
        matches!(self.state(), State::Init | State::Hold | State::Ready)
    }

    /// Swaps this coroutine onto the CPU of the current thread.
    ///
    /// The caller must be the scheduling coroutine of this thread (the
    /// thread's main coroutine when a dummy-main is swapped in). Returns
    /// once the coroutine yields or finishes; inspect [`state`] to find
    /// out which.
    ///
    /// [`state`]: Coroutine::state
    pub fn swap_in(self: &Arc<Self>) {
        assert!(self.is_runnable(), "swap_in on a non-runnable coroutine");
        let caller = this_thread::current().expect("swap_in without a main coroutine");
        if self.is_dummy_main {
            debug_assert!(
                caller.gen_ref().is_none(),
                "dummy-main must be entered from the thread's own stack"
            );
        } else {
            debug_assert!(
                this_thread::scheduling().map_or(true, |s| Arc::ptr_eq(&s, &caller)),
                "swap_in from a non-scheduling coroutine"
            );
        }

        this_thread::set_current(self.clone());
        self.set_state(State::Exec);
        self.gen_mut()
            .as_mut()
            .expect("swap_in on a stackless main coroutine")
            .resume();
        // the coroutine yielded or finished; the thread is back on the
        // caller's context
        this_thread::set_current(caller);
    }

    /// Suspends the current coroutine without requeueing it; something
    /// else (reactor, timer, user code) re-submits it later.
    pub fn yield_to_hold() {
        Self::yield_current(State::Hold);
    }

    /// Suspends the current coroutine and asks the dispatch loop to put
    /// it back on the run queue.
    pub fn yield_to_ready() {
        Self::yield_current(State::Ready);
    }

    fn yield_current(s: State) {
        let cur = this_thread::current().expect("yield outside of any coroutine");
        assert_eq!(cur.state(), State::Exec, "yield from a non-executing coroutine");
        assert!(cur.gen_ref().is_some(), "cannot yield the main coroutine");
        cur.set_state(s);
        drop(cur);
        co_yield_with(());
    }

    /// Rebuilds the context on the existing stack with a fresh entry.
    ///
    /// Legal only in `Init`, `Terminal` or `Except`; keeps the id and the
    /// stack region and transitions back to `Init`.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, f: EntryFn) {
        assert!(
            matches!(self.state(), State::Init | State::Terminal | State::Except),
            "reset on a live coroutine"
        );
        self.gen_mut()
            .as_mut()
            .expect("reset on a stackless main coroutine")
            .init_code(Self::trampoline(f));
        self.set_state(State::Init);
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // a main coroutine dies with its thread in Exec; everything else
        // must be off-CPU
        if self.gen.get_mut().is_some() {
            debug_assert_ne!(self.state(), State::Exec, "dropping an executing coroutine");
        }
        trace!("coroutine dropped, id={}", self.id);
    }
}

/// Spawns a coroutine with the configured default stack size.
pub fn spawn<F>(f: F) -> Arc<Coroutine>
where
    F: FnOnce() + Send + 'static,
{
    Coroutine::new(f, config::stack_size())
}

/// Per-thread coroutine context: the main coroutine anchoring the OS
/// stack, the coroutine currently holding the CPU, and the scheduling
/// coroutine that runs the dispatch loop.
pub mod this_thread {
    use super::*;

    thread_local! {
        static MAIN: RefCell<Option<Arc<Coroutine>>> = RefCell::new(None);
        static CURRENT: RefCell<Option<Arc<Coroutine>>> = RefCell::new(None);
        static SCHEDULING: RefCell<Option<Arc<Coroutine>>> = RefCell::new(None);
    }

    /// Returns the thread's main coroutine, creating it on first use.
    ///
    /// The main coroutine borrows the OS thread stack and starts out as
    /// the current coroutine.
    pub fn main_coroutine() -> Arc<Coroutine> {
        ensure_main();
        MAIN.with(|m| m.borrow().clone().unwrap())
    }

    pub(crate) fn ensure_main() {
        MAIN.with(|m| {
            let mut m = m.borrow_mut();
            if m.is_none() {
                let main = Coroutine::new_main();
                debug!("main coroutine constructed, id={}", main.id());
                CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
                *m = Some(main);
            }
        });
    }

    /// The coroutine currently holding the CPU on this thread, if the
    /// thread has entered coroutine context at all.
    pub fn current() -> Option<Arc<Coroutine>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Id of the current coroutine, 0 when the thread has none.
    pub fn current_id() -> CoroutineId {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |co| co.id()))
    }

    /// true when called from inside a worker coroutine (not the thread's
    /// borrowed-stack main)
    pub fn is_coroutine() -> bool {
        CURRENT.with(|c| c.borrow().as_ref().map_or(false, |co| co.gen_ref().is_some()))
    }

    pub(crate) fn set_current(co: Arc<Coroutine>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(co));
    }

    /// The coroutine running the dispatch loop on this thread.
    pub fn scheduling() -> Option<Arc<Coroutine>> {
        SCHEDULING.with(|s| s.borrow().clone())
    }

    pub(crate) fn set_scheduling(co: Option<Arc<Coroutine>>) {
        SCHEDULING.with(|s| {
            let mut s = s.borrow_mut();
            if co.is_some() {
                assert!(s.is_none(), "thread already has a scheduling coroutine");
            }
            *s = co;
        });
    }
}
