//! Named OS thread handle with cached kernel ids.
//!
//! [`OsThread::spawn`] returns only after the child has published its
//! kernel tid and pthread id through a ready handshake, so affinity
//! targets are valid the moment the constructor returns.

use std::io;
use std::sync::mpsc;
use std::thread::JoinHandle;

pub struct OsThread {
    name: String,
    tid: libc::pid_t,
    pthread_id: libc::pthread_t,
    handle: Option<JoinHandle<()>>,
}

impl OsThread {
    /// Spawns a named thread running `f`; blocks until the child has
    /// cached its ids.
    pub fn spawn<F>(name: &str, f: F) -> io::Result<OsThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let ids = unsafe { (libc::gettid(), libc::pthread_self()) };
                // the parent may already be gone when it only wanted a
                // detached thread
                ready_tx.send(ids).ok();
                f();
            })?;

        let (tid, pthread_id) = ready_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "thread exited before handshake"))?;

        debug!("thread [{}] constructed, tid={}", name, tid);
        Ok(OsThread {
            name: name.to_owned(),
            tid,
            pthread_id,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// kernel thread id (`gettid`)
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// POSIX thread id, usable as a scheduler affinity target
    pub fn pthread_id(&self) -> libc::pthread_t {
        self.pthread_id
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread [{}] terminated by panic", self.name);
            }
        }
    }

    pub fn detach(mut self) {
        // dropping the JoinHandle detaches
        self.handle.take();
    }
}

impl Drop for OsThread {
    fn drop(&mut self) {
        // an owned, unjoined thread keeps running; detach silently like
        // std does
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn handshake_publishes_ids() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let mut t = OsThread::spawn("ids", move || {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(t.name(), "ids");
        assert!(t.tid() > 0);
        assert_ne!(t.pthread_id(), 0);
        t.join();
        assert!(ran.load(Ordering::SeqCst));
    }
}
