//! # A library for M:N scheduling of stackful coroutines.
//!
//! `strand` multiplexes stackful coroutines over a pool of worker threads.
//! Each worker runs a dispatch loop that swaps tasks in and out over
//! machine-level contexts (built on [generator][generator]), and parks in
//! an edge-triggered epoll reactor when there is nothing to run. Timers
//! fire through a single `timerfd` folded into the same reactor, and a
//! transparent hook layer turns blocking libc calls (`sleep`, `read`,
//! `write`, `accept`, ...) into suspension points so ordinary
//! straight-line code runs cooperatively.
//!
//! ## Features
//! * Stackful coroutines with explicit swap-in/swap-out and stack reuse;
//! * A configurable worker pool with optional per-task thread affinity;
//! * Asynchronous socket I/O driven by an edge-triggered epoll reactor;
//! * One-shot, repeating and condition timers with `timerfd` precision;
//! * libc-shaped hooks with identical `errno` conventions, including
//!   `SO_RCVTIMEO`/`SO_SNDTIMEO` timeout semantics;
//! * Named hierarchical loggers behind the `log` facade and a typed
//!   YAML-backed configuration registry.
//!
//! [generator]: https://docs.rs/generator

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

mod notify;
mod pool;

pub mod config;
pub mod coroutine;
pub mod fd;
pub mod hook;
pub mod logging;
pub mod poller;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use crate::coroutine::Coroutine;
pub use crate::poller::Interest;
pub use crate::scheduler::Scheduler;
pub use crate::timer::TimerId;
