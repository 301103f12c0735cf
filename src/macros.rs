/// macro used to submit a closure to a scheduler
///
/// this is just a convenient wrapper for [`Scheduler::submit`] and
/// [`Scheduler::submit_to`] that checks the closure bounds up front.
///
/// [`Scheduler::submit`]: crate::scheduler::Scheduler::submit
/// [`Scheduler::submit_to`]: crate::scheduler::Scheduler::submit_to
#[macro_export]
macro_rules! co {
    // submit to any worker
    ($sched:expr, $func:expr) => {{
        fn _co_check<F>(f: F) -> F
        where
            F: FnOnce() + Send + 'static,
        {
            f
        }
        $sched.submit(_co_check($func))
    }};

    // submit with thread affinity
    ($sched:expr, $target:expr, $func:expr) => {{
        fn _co_check<F>(f: F) -> F
        where
            F: FnOnce() + Send + 'static,
        {
            f
        }
        $sched.submit_to($target, _co_check($func))
    }};
}
