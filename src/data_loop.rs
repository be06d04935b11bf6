use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use error::{Error, Result};

pub type SourceId = usize;

/// What a source callback wants done with its registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceAction {
    Keep,
    Remove,
}

pub type SourceCallback = Box<FnMut(Ready) -> SourceAction + Send>;

const OPS_TOKEN: Token = Token(0);

enum Op {
    AddSource {
        id: SourceId,
        fd: RawFd,
        interest: Ready,
        callback: SourceCallback,
    },
    UpdateSource {
        id: SourceId,
        interest: Ready,
    },
    RemoveSource {
        id: SourceId,
        done: Option<Sender<i32>>,
    },
    Invoke {
        func: Box<FnMut() -> i32 + Send>,
        done: Option<Sender<i32>>,
    },
    Shutdown,
}

/// The data loop: a dedicated thread polling registered fds and
/// running their callbacks. Everything else in the crate talks to it
/// through the op queue; `invoke` is the marshalling primitive for
/// work that must run (and optionally complete) on the loop thread.
pub struct DataLoop {
    ops: Mutex<Sender<Op>>,
    readiness: SetReadiness,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    loop_thread: thread::ThreadId,
    next_id: AtomicUsize,
    interests: Arc<Mutex<HashMap<SourceId, Ready>>>,
}

impl DataLoop {
    pub fn new() -> Result<DataLoop> {
        let poll = Poll::new()?;
        let (registration, readiness) = Registration::new2();
        poll.register(&registration, OPS_TOKEN, Ready::readable(), PollOpt::level())?;

        let (tx, rx) = channel();
        let interests = Arc::new(Mutex::new(HashMap::new()));
        let thread_interests = interests.clone();
        let thread_readiness = readiness.clone();

        let handle = thread::Builder::new()
            .name("remote-node-data".to_owned())
            .spawn(move || run(poll, registration, thread_readiness, rx, thread_interests))
            .map_err(Error::from)?;
        let loop_thread = handle.thread().id();

        Ok(DataLoop {
            ops: Mutex::new(tx),
            readiness,
            thread: Mutex::new(Some(handle)),
            loop_thread,
            next_id: AtomicUsize::new(1),
            interests,
        })
    }

    fn send(&self, op: Op) -> Result<()> {
        self.ops
            .lock()
            .unwrap()
            .send(op)
            .map_err(|_| Error::io_str("data loop stopped"))?;
        if let Err(e) = self.readiness.set_readiness(Ready::readable()) {
            warn!("failed to wake data loop: {}", e);
        }
        Ok(())
    }

    /// Register an fd with the loop. The callback runs on the loop
    /// thread for every poll hit and decides whether to stay installed.
    pub fn add_source(
        &self,
        fd: RawFd,
        interest: Ready,
        callback: SourceCallback,
    ) -> Result<SourceId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.interests.lock().unwrap().insert(id, interest);
        self.send(Op::AddSource {
            id,
            fd,
            interest,
            callback,
        })?;
        debug!("added source {} for fd {} ({:?})", id, fd, interest);
        Ok(id)
    }

    pub fn update_source(&self, id: SourceId, interest: Ready) -> Result<()> {
        self.interests.lock().unwrap().insert(id, interest);
        self.send(Op::UpdateSource { id, interest })
    }

    /// Remove a source, waiting until the loop has let go of the fd.
    /// From the loop thread itself the removal is only queued.
    pub fn remove_source(&self, id: SourceId) {
        self.interests.lock().unwrap().remove(&id);
        if thread::current().id() == self.loop_thread {
            let _ = self.send(Op::RemoveSource { id, done: None });
            return;
        }
        let (tx, rx) = channel();
        if self.send(Op::RemoveSource { id, done: Some(tx) }).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Queue `func` onto the loop thread; with `block` the caller waits
    /// for its result. Calls from the loop thread run inline.
    pub fn invoke(&self, mut func: Box<FnMut() -> i32 + Send>, block: bool) -> Option<i32> {
        if thread::current().id() == self.loop_thread {
            return Some(func());
        }
        if block {
            let (tx, rx) = channel();
            self.send(Op::Invoke {
                func,
                done: Some(tx),
            })
            .ok()?;
            rx.recv().ok()
        } else {
            let _ = self.send(Op::Invoke { func, done: None });
            None
        }
    }

    /// The interest mask a source is currently registered with.
    pub fn interest(&self, id: SourceId) -> Option<Ready> {
        self.interests.lock().unwrap().get(&id).cloned()
    }
}

impl Drop for DataLoop {
    fn drop(&mut self) {
        let _ = self.send(Op::Shutdown);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("data loop thread panicked");
            }
        }
    }
}

struct SourceEntry {
    fd: RawFd,
    callback: SourceCallback,
}

fn run(
    poll: Poll,
    _registration: Registration,
    readiness: SetReadiness,
    rx: Receiver<Op>,
    interests: Arc<Mutex<HashMap<SourceId, Ready>>>,
) {
    let mut events = Events::with_capacity(64);
    let mut sources: HashMap<usize, SourceEntry> = HashMap::new();

    debug!("data loop running");
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ::std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("poll failed: {}", e);
            return;
        }

        for event in &events {
            if event.token() == OPS_TOKEN {
                // clear before draining so a racing enqueue re-arms us
                let _ = readiness.set_readiness(Ready::empty());
                while let Ok(op) = rx.try_recv() {
                    match op {
                        Op::AddSource {
                            id,
                            fd,
                            interest,
                            callback,
                        } => {
                            if let Err(e) =
                                poll.register(&EventedFd(&fd), Token(id), interest, PollOpt::level())
                            {
                                warn!("failed to register fd {}: {}", fd, e);
                                continue;
                            }
                            sources.insert(id, SourceEntry { fd, callback });
                        }
                        Op::UpdateSource { id, interest } => {
                            if let Some(entry) = sources.get(&id) {
                                if let Err(e) = poll.reregister(
                                    &EventedFd(&entry.fd),
                                    Token(id),
                                    interest,
                                    PollOpt::level(),
                                ) {
                                    warn!("failed to reregister source {}: {}", id, e);
                                }
                            }
                        }
                        Op::RemoveSource { id, done } => {
                            if let Some(entry) = sources.remove(&id) {
                                let _ = poll.deregister(&EventedFd(&entry.fd));
                                debug!("removed source {}", id);
                            }
                            if let Some(done) = done {
                                let _ = done.send(0);
                            }
                        }
                        Op::Invoke { mut func, done } => {
                            let res = func();
                            if let Some(done) = done {
                                let _ = done.send(res);
                            }
                        }
                        Op::Shutdown => {
                            debug!("data loop shutting down");
                            return;
                        }
                    }
                }
            } else {
                let id = event.token().0;
                // take the entry out so the callback cannot observe a
                // half-borrowed table
                if let Some(mut entry) = sources.remove(&id) {
                    match (entry.callback)(event.readiness()) {
                        SourceAction::Keep => {
                            sources.insert(id, entry);
                        }
                        SourceAction::Remove => {
                            let _ = poll.deregister(&EventedFd(&entry.fd));
                            interests.lock().unwrap().remove(&id);
                            debug!("source {} removed itself", id);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    use libc;
    use mio::unix::UnixReady;
    use mio::Ready;

    use super::*;
    use transport::wakeup;
    use testutil::eventfd;

    #[test]
    fn blocking_invoke_runs_on_loop_thread() {
        let dl = DataLoop::new().unwrap();
        let (tx, rx) = channel();
        let res = dl.invoke(
            Box::new(move || {
                tx.send(thread::current().name().map(|n| n.to_owned())).unwrap();
                7
            }),
            true,
        );
        assert_eq!(res, Some(7));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().as_ref().map(|s| s.as_str()),
            Some("remote-node-data")
        );
    }

    #[test]
    fn source_fires_and_survives() {
        let dl = DataLoop::new().unwrap();
        let efd = eventfd();
        let fd = efd.as_raw_fd();
        let (tx, rx) = channel();

        let id = dl
            .add_source(
                fd,
                Ready::from(UnixReady::from(Ready::readable()) | UnixReady::error() | UnixReady::hup()),
                Box::new(move |ready: Ready| {
                    let _ = ::transport::read_wakeup(fd);
                    tx.send(ready.is_readable()).unwrap();
                    SourceAction::Keep
                }),
            )
            .unwrap();

        wakeup(fd);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), true);
        wakeup(fd);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), true);

        dl.remove_source(id);
        assert_eq!(dl.interest(id), None);

        // no callback after a blocking removal
        wakeup(fd);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn interest_updates_are_visible() {
        let dl = DataLoop::new().unwrap();
        let efd = eventfd();
        let id = dl
            .add_source(
                efd.as_raw_fd(),
                Ready::from(UnixReady::error() | UnixReady::hup()),
                Box::new(|_| SourceAction::Keep),
            )
            .unwrap();

        assert_eq!(
            dl.interest(id),
            Some(Ready::from(UnixReady::error() | UnixReady::hup()))
        );

        let with_in =
            Ready::from(UnixReady::from(Ready::readable()) | UnixReady::error() | UnixReady::hup());
        dl.update_source(id, with_in).unwrap();
        assert_eq!(dl.interest(id), Some(with_in));
        dl.remove_source(id);
    }

    #[test]
    fn hup_removes_the_source_when_asked() {
        let dl = DataLoop::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        // NOTE(unsafe) plain pipe(2), checked
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rfd, wfd) = (fds[0], fds[1]);

        let (tx, rx) = channel();
        let id = dl
            .add_source(
                rfd,
                Ready::from(UnixReady::error() | UnixReady::hup()),
                Box::new(move |ready: Ready| {
                    if UnixReady::from(ready).is_hup() {
                        tx.send(()).unwrap();
                        return SourceAction::Remove;
                    }
                    SourceAction::Keep
                }),
            )
            .unwrap();

        // closing the write end hangs up the read end
        unsafe { libc::close(wfd) };
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // the loop drops its mirror entry with the registration
        for _ in 0..100 {
            if dl.interest(id).is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dl.interest(id), None);
        unsafe { libc::close(rfd) };
    }
}
