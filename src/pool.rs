//! Reuse of finished coroutine stacks.
//!
//! Promoting a bare callback to a coroutine happens on every dispatch of
//! a callback task; recycling the stack and register context through a
//! lock-free pool keeps that path allocation-free in the steady state.
//! Only default-sized, finished, unshared coroutines are retained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::queue::SegQueue;

use crate::config;
use crate::coroutine::{Coroutine, State};

struct CoroutinePool {
    pool: SegQueue<Arc<Coroutine>>,
    size: AtomicUsize,
}

fn pool() -> &'static CoroutinePool {
    static POOL: OnceLock<CoroutinePool> = OnceLock::new();
    POOL.get_or_init(|| CoroutinePool {
        pool: SegQueue::new(),
        size: AtomicUsize::new(0),
    })
}

/// Takes a pooled coroutine reset to run `f`, or builds a fresh one
/// with the default stack size.
pub(crate) fn get(f: Box<dyn FnOnce() + Send + 'static>) -> Arc<Coroutine> {
    let p = pool();
    match p.pool.pop() {
        Some(co) => {
            p.size.fetch_sub(1, Ordering::AcqRel);
            co.reset_boxed(f);
            co
        }
        None => Coroutine::new_boxed(f, config::stack_size()),
    }
}

/// Returns a finished coroutine to the pool when it is still poolable:
/// default stack, no other owners, not mid-flight.
pub(crate) fn put(co: Arc<Coroutine>) {
    if co.stack_size() != config::stack_size()
        || !matches!(co.state(), State::Terminal | State::Except | State::Init)
        || Arc::strong_count(&co) != 1
    {
        return;
    }
    let p = pool();
    let n = p.size.fetch_add(1, Ordering::AcqRel);
    if n >= config::pool_capacity() {
        p.size.fetch_sub(1, Ordering::AcqRel);
        return;
    }
    p.pool.push(co);
}
