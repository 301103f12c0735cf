//! End-to-end scenarios for the scheduler, reactor, timers and hooks.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libc::c_void;

use strand::co;
use strand::config::ConfigRegistry;
use strand::coroutine::{self, Coroutine, State};
use strand::fd::fd_table;
use strand::hook;
use strand::logging::Formatter;
use strand::{Interest, Scheduler};

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

#[test]
fn submissions_run_in_fifo_order() {
    let sched = Scheduler::new(1, false, "fifo");
    sched.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20 {
        let o = order.clone();
        sched.submit(move || o.lock().unwrap().push(i));
    }
    assert!(wait_until(|| order.lock().unwrap().len() == 20, Duration::from_secs(5)));
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    sched.stop();
}

#[test]
fn yield_to_ready_requeues_the_task() {
    let sched = Scheduler::new(1, false, "ready");
    sched.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    sched.submit(move || {
        o.lock().unwrap().push("first-leg");
        Coroutine::yield_to_ready();
        o.lock().unwrap().push("second-leg");
    });
    let o = order.clone();
    sched.submit(move || o.lock().unwrap().push("interleaved"));

    assert!(wait_until(|| order.lock().unwrap().len() == 3, Duration::from_secs(5)));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first-leg", "interleaved", "second-leg"]
    );
    sched.stop();
}

#[test]
fn suspended_coroutine_resumes_on_resubmission() {
    let sched = Scheduler::new(1, false, "resume");
    sched.start();

    let out = Arc::new(Mutex::new(String::new()));
    let o = out.clone();
    let co = coroutine::spawn(move || {
        o.lock().unwrap().push('A');
        Coroutine::yield_to_hold();
        o.lock().unwrap().push('B');
        Coroutine::yield_to_hold();
        o.lock().unwrap().push('C');
    });

    sched.submit_coroutine(co.clone());
    assert!(wait_until(
        || co.state() == State::Hold && *out.lock().unwrap() == "A",
        Duration::from_secs(5)
    ));
    sched.submit_coroutine(co.clone());
    assert!(wait_until(
        || co.state() == State::Hold && *out.lock().unwrap() == "AB",
        Duration::from_secs(5)
    ));
    sched.submit_coroutine(co.clone());
    assert!(wait_until(|| co.state() == State::Terminal, Duration::from_secs(5)));
    assert_eq!(&*out.lock().unwrap(), "ABC");
    sched.stop();
}

#[test]
fn affinity_pins_tasks_to_one_worker() {
    let sched = Scheduler::new(3, false, "affinity");
    sched.start();

    let workers = sched.worker_threads();
    assert_eq!(workers.len(), 3);
    let target = workers[0];

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..5 {
        let s = seen.clone();
        sched.submit_to(target, move || {
            s.lock().unwrap().push(unsafe { libc::pthread_self() });
        });
    }

    assert!(wait_until(|| seen.lock().unwrap().len() == 5, Duration::from_secs(10)));
    for id in seen.lock().unwrap().iter() {
        assert_eq!(*id, target);
    }
    sched.stop();
}

#[test]
fn hooked_sleep_frees_the_worker() {
    let sched = Scheduler::new(1, false, "sleep");
    sched.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    let slept = Arc::new(Mutex::new(None));

    let o = order.clone();
    let s = slept.clone();
    sched.submit(move || {
        o.lock().unwrap().push("sleep-start");
        let start = Instant::now();
        let ret = hook::sleep(1);
        assert_eq!(ret, 0);
        *s.lock().unwrap() = Some(start.elapsed());
        o.lock().unwrap().push("sleep-end");
    });

    // let the sleeper park first, then hand the lone worker other work
    std::thread::sleep(Duration::from_millis(100));
    let o = order.clone();
    sched.submit(move || o.lock().unwrap().push("other"));

    assert!(wait_until(|| slept.lock().unwrap().is_some(), Duration::from_secs(5)));
    let elapsed = slept.lock().unwrap().unwrap();
    assert!(elapsed >= Duration::from_secs(1), "slept only {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1300), "slept {:?}", elapsed);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["sleep-start", "other", "sleep-end"]
    );
    sched.stop();
}

#[test]
fn read_timeout_surfaces_etimedout() {
    let sched = Scheduler::new(1, false, "timeout");
    sched.start();

    let (a, b) = socketpair();
    fd_table().register(a).unwrap();
    let tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 100_000,
    };
    let ret = unsafe {
        hook::setsockopt(
            a,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0);

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    sched.submit(move || {
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let n = unsafe { hook::read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        *o.lock().unwrap() = Some((n, err, start.elapsed()));
    });

    assert!(wait_until(|| outcome.lock().unwrap().is_some(), Duration::from_secs(5)));
    let (n, err, elapsed) = outcome.lock().unwrap().unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(90), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(200), "returned after {:?}", elapsed);

    sched.stop();
    fd_table().remove(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn hooked_read_completes_when_data_arrives() {
    let sched = Scheduler::new(1, false, "io");
    sched.start();

    let (a, b) = socketpair();
    fd_table().register(a).unwrap();

    let got = Arc::new(Mutex::new(None));
    let g = got.clone();
    sched.submit(move || {
        let mut buf = [0u8; 16];
        let n = unsafe { hook::read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        *g.lock().unwrap() = Some((n, buf));
    });

    // no data yet: the reader must be parked, not spinning on EAGAIN
    std::thread::sleep(Duration::from_millis(100));
    assert!(got.lock().unwrap().is_none());

    let n = unsafe { libc::write(b, b"pong".as_ptr() as *const c_void, 4) };
    assert_eq!(n, 4);

    assert!(wait_until(|| got.lock().unwrap().is_some(), Duration::from_secs(5)));
    let (n, buf) = got.lock().unwrap().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"pong");

    sched.stop();
    fd_table().remove(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn repeating_timer_fires_until_cancelled() {
    let sched = Scheduler::new(1, false, "repeat");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = sched.run_every(Duration::from_millis(50), move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_ne!(id, 0);

    std::thread::sleep(Duration::from_millis(280));
    let fired = hits.load(Ordering::SeqCst);
    assert!((3..=6).contains(&fired), "fired {} times", fired);
    assert!(sched.has_timer(id));
    assert!(sched.cancel_timer(id));
    assert!(!sched.has_timer(id));

    // allow an already-queued expiration to land, then demand silence
    std::thread::sleep(Duration::from_millis(30));
    let settled = hits.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), settled);
    sched.stop();
}

#[test]
fn condition_timer_skips_dead_token() {
    let sched = Scheduler::new(1, false, "cond");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    let token: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());

    let h = hits.clone();
    sched.run_after_if(
        Duration::from_millis(50),
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&token),
    );
    drop(token);

    let live: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
    let h = hits.clone();
    sched.run_after_if(
        Duration::from_millis(50),
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&live),
    );

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    sched.stop();
}

// two writable sockets: each registered write continuation fires exactly
// once per readiness edge
#[test]
fn edge_triggered_continuations_fire_once() {
    let sched = Scheduler::new(2, false, "et");
    sched.start();

    let (a1, b1) = socketpair();
    let (a2, b2) = socketpair();
    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));

    let c = c1.clone();
    sched
        .update_event(
            a1,
            Interest::WRITE,
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    let c = c2.clone();
    sched
        .update_event(
            a2,
            Interest::WRITE,
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    assert!(wait_until(
        || c1.load(Ordering::SeqCst) == 1 && c2.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(c1.load(Ordering::SeqCst), 1);
    assert_eq!(c2.load(Ordering::SeqCst), 1);

    sched.stop();
    unsafe {
        libc::close(a1);
        libc::close(b1);
        libc::close(a2);
        libc::close(b2);
    }
}

#[test]
fn stop_is_idempotent_and_drains() {
    let sched = Scheduler::new(2, false, "stop");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let h = hits.clone();
        sched.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(
        || hits.load(Ordering::SeqCst) == 50,
        Duration::from_secs(5)
    ));

    sched.stop();
    sched.stop();
    assert!(sched.is_stopped());
    assert!(sched.worker_threads().is_empty());
}

#[test]
fn calling_thread_drains_through_its_dummy_main() {
    let sched = Scheduler::new(1, true, "dummy");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let h = hits.clone();
        sched.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    // the only dispatch loop is this thread's dummy-main, which only
    // runs inside stop
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert!(sched.is_stopped());
}

// parsing a formatter pattern and re-emitting it reproduces the input
#[test]
fn formatter_pattern_round_trips() {
    for pattern in [
        strand::logging::DEFAULT_PATTERN,
        "%d{%Y-%m-%d %H:%M:%S} [%L] %c %f:%l %m%n",
        "plain text, no items",
        "%m",
        "ratio 100%% [%T/%R]%t%m",
    ] {
        let formatter = Formatter::new(pattern).unwrap();
        assert_eq!(formatter.emit_pattern(), pattern, "pattern {:?}", pattern);
    }
}

// a dumped config document reloads into identical values
#[test]
fn config_yaml_round_trips() {
    use std::collections::HashMap;

    fn registry() -> (
        ConfigRegistry,
        std::sync::Arc<strand::config::ConfigVar<u16>>,
        std::sync::Arc<strand::config::ConfigVar<Vec<String>>>,
        std::sync::Arc<strand::config::ConfigVar<HashMap<String, u32>>>,
    ) {
        let reg = ConfigRegistry::new();
        let port = reg.lookup::<u16>("server.port", 0, "").unwrap();
        let hosts = reg
            .lookup::<Vec<String>>("server.hosts", Vec::new(), "")
            .unwrap();
        let weights = reg
            .lookup::<HashMap<String, u32>>("server.weights", HashMap::new(), "")
            .unwrap();
        (reg, port, hosts, weights)
    }

    let (reg, port, hosts, weights) = registry();
    reg.load_yaml_str(
        "server:\n  port: 8080\n  hosts:\n    - a.example\n    - b.example\n  weights:\n    a: 1\n    b: 2\n",
    )
    .unwrap();

    // dump, then load the dump into a fresh registry
    let dumped = reg.dump_yaml_str().unwrap();
    let (reg2, port2, hosts2, weights2) = registry();
    reg2.load_yaml_str(&dumped).unwrap();

    assert_eq!(port2.get(), port.get());
    assert_eq!(hosts2.get(), hosts.get());
    assert_eq!(weights2.get(), weights.get());
    // and dumping again is a fixed point
    assert_eq!(reg2.dump_yaml_str().unwrap(), dumped);
}

#[test]
fn co_macro_submits() {
    let sched = Scheduler::new(1, false, "macro");
    sched.start();

    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    co!(sched, move || {
        d.store(true, Ordering::SeqCst);
    });
    assert!(wait_until(|| done.load(Ordering::SeqCst), Duration::from_secs(5)));

    let on_target = Arc::new(AtomicBool::new(false));
    let target = sched.worker_threads()[0];
    let t = on_target.clone();
    co!(sched, target, move || {
        t.store(unsafe { libc::pthread_self() } == target, Ordering::SeqCst);
    });
    assert!(wait_until(|| on_target.load(Ordering::SeqCst), Duration::from_secs(5)));
    sched.stop();
}
