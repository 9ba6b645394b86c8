//! The single dedicated I/O thread (spec.md §4.1).
//!
//! `Broker` owns the only `mio::Poll` in the process and the two
//! readiness sets (`readers`, `writers`) of [`Side`]s currently eligible
//! for read/write events. Every mutation of those sets happens on the
//! broker thread itself; other threads reach it only through
//! [`BrokerHandle::on_thread`], woken by a self-pipe so the blocking
//! `poll` call never has to spin.

use crate::side::Side;
use mio::unix::{pipe, SourceFd};
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Anything the broker can hold a readiness registration for: streams,
/// the log-draining pipe, and (indirectly, via its own registration) the
/// waker itself.
pub trait BrokerSource: Send + Sync {
    fn on_receive(&self, broker: &BrokerHandle);
    fn on_transmit(&self, _broker: &BrokerHandle) {}
    fn on_disconnect(&self, broker: &BrokerHandle);
    fn on_shutdown(&self, _broker: &BrokerHandle) {}
}

type Task = Box<dyn FnOnce(&BrokerHandle) + Send>;

thread_local! {
    static ON_BROKER_THREAD: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

struct Inner {
    alive: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    readers: Mutex<HashMap<RawFd, Arc<Side>>>,
    writers: Mutex<HashMap<RawFd, Arc<Side>>>,
    registered: Mutex<HashSet<RawFd>>,
    registry: mio::Registry,
    waker_tx: Mutex<pipe::Sender>,
    shutdown_timeout: Duration,
}

/// A cheap, cloneable reference to the broker, handed to every callback
/// and safe to hold from any thread.
#[derive(Clone)]
pub struct BrokerHandle(Arc<Inner>);

impl BrokerHandle {
    pub(crate) fn is_broker_thread() -> bool {
        ON_BROKER_THREAD.with(|c| c.get())
    }

    /// Runs `f` inline if already on the broker thread, otherwise queues
    /// it and wakes the loop. This is the only legal path for mutating
    /// the readiness sets or a `Context`'s handler table from outside the
    /// broker thread.
    pub fn on_thread<F>(&self, f: F)
    where
        F: FnOnce(&BrokerHandle) + Send + 'static,
    {
        if Self::is_broker_thread() {
            f(self);
            return;
        }
        self.0.tasks.lock().unwrap().push(Box::new(f));
        self.wake();
    }

    fn wake(&self) {
        if Self::is_broker_thread() {
            return;
        }
        use std::io::Write;
        let mut tx = self.0.waker_tx.lock().unwrap();
        let _ = tx.write(&[0u8]);
    }

    pub fn start_receive(&self, side: Arc<Side>) {
        let handle = self.clone();
        self.on_thread(move |_| {
            if let Ok(fd) = side.raw_fd() {
                handle.0.readers.lock().unwrap().insert(fd, side);
                handle.sync_registration(fd);
            }
        });
    }

    pub fn stop_receive(&self, side: &Arc<Side>) {
        let handle = self.clone();
        let fd = match side.raw_fd() {
            Ok(fd) => fd,
            Err(_) => return,
        };
        self.on_thread(move |_| {
            handle.0.readers.lock().unwrap().remove(&fd);
            handle.sync_registration(fd);
        });
    }

    pub fn start_transmit(&self, side: Arc<Side>) {
        let handle = self.clone();
        self.on_thread(move |_| {
            if let Ok(fd) = side.raw_fd() {
                handle.0.writers.lock().unwrap().insert(fd, side);
                handle.sync_registration(fd);
            }
        });
    }

    pub fn stop_transmit(&self, side: &Arc<Side>) {
        let handle = self.clone();
        let fd = match side.raw_fd() {
            Ok(fd) => fd,
            Err(_) => return,
        };
        self.on_thread(move |_| {
            handle.0.writers.lock().unwrap().remove(&fd);
            handle.sync_registration(fd);
        });
    }

    /// Recomputes and applies the mio registration for `fd` from the
    /// current union of interest across `readers` and `writers`. Must
    /// only run on the broker thread.
    fn sync_registration(&self, fd: RawFd) {
        let wants_read = self.0.readers.lock().unwrap().contains_key(&fd);
        let wants_write = self.0.writers.lock().unwrap().contains_key(&fd);
        let mut registered = self.0.registered.lock().unwrap();
        let token = Token(fd as usize);

        if !wants_read && !wants_write {
            if registered.remove(&fd) {
                let _ = self.0.registry.deregister(&mut SourceFd(&fd));
            }
            return;
        }

        let interest = match (wants_read, wants_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => unreachable!(),
        };

        if registered.contains(&fd) {
            let _ = self.0.registry.reregister(&mut SourceFd(&fd), token, interest);
        } else if self.0.registry.register(&mut SourceFd(&fd), token, interest).is_ok() {
            registered.insert(fd);
        }
    }

    /// Requests shutdown. Safe from any thread; idempotent.
    pub fn shutdown(&self) {
        self.0.alive.store(false, Ordering::SeqCst);
        self.wake();
    }

    fn drain_tasks(&self) {
        let tasks = std::mem::take(&mut *self.0.tasks.lock().unwrap());
        for task in tasks {
            task(self);
        }
    }

    fn unique_sources(&self) -> Vec<Arc<dyn BrokerSource>> {
        let readers = self.0.readers.lock().unwrap();
        let writers = self.0.writers.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for side in readers.values().chain(writers.values()) {
            if let Some(owner) = side.owner() {
                let ptr = Arc::as_ptr(&owner) as *const () as usize;
                if seen.insert(ptr) {
                    out.push(owner);
                }
            }
        }
        out
    }

    fn dispatch(&self, fd: RawFd, readable: bool, writable: bool) {
        if readable {
            let side = self.0.readers.lock().unwrap().get(&fd).cloned();
            if let Some(side) = side {
                if let Some(owner) = side.owner() {
                    self.invoke(owner, |owner, handle| owner.on_receive(handle));
                }
            }
        }
        if writable {
            let side = self.0.writers.lock().unwrap().get(&fd).cloned();
            if let Some(side) = side {
                if let Some(owner) = side.owner() {
                    self.invoke(owner, |owner, handle| owner.on_transmit(handle));
                }
            }
        }
    }

    fn invoke(
        &self,
        owner: Arc<dyn BrokerSource>,
        call: impl FnOnce(&dyn BrokerSource, &BrokerHandle),
    ) {
        let handle = self.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| call(owner.as_ref(), &handle)));
        if result.is_err() {
            tracing::error!("broker callback panicked; disconnecting stream");
            owner.on_disconnect(&handle);
        }
    }
}

/// The broker thread handle: spawn it once per process, hand out cloned
/// [`BrokerHandle`]s to everything that needs to talk to it, and `join`
/// it at process exit.
pub struct Broker {
    handle: BrokerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Broker {
    pub fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_shutdown_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn spawn_with_shutdown_timeout(shutdown_timeout: Duration) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let (waker_tx, waker_rx) = pipe::new()?;

        let inner = Arc::new(Inner {
            alive: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            readers: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashSet::new()),
            registry,
            waker_tx: Mutex::new(waker_tx),
            shutdown_timeout,
        });
        let handle = BrokerHandle(inner);

        let thread_handle = handle.clone();
        let thread = thread::Builder::new()
            .name("nestmesh-broker".into())
            .spawn(move || run_loop(thread_handle, poll, waker_rx))?;

        Ok(Self { handle, thread: Some(thread) })
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    pub fn join(mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(handle: BrokerHandle, mut poll: Poll, mut waker_rx: pipe::Receiver) {
    ON_BROKER_THREAD.with(|c| c.set(true));

    let wake_fd = waker_rx.as_raw_fd();
    if poll
        .registry()
        .register(&mut SourceFd(&wake_fd), WAKE_TOKEN, Interest::READABLE)
        .is_err()
    {
        tracing::error!("failed to register broker waker; aborting broker thread");
        return;
    }

    let mut events = Events::with_capacity(256);
    while handle.0.alive.load(Ordering::SeqCst) {
        handle.drain_tasks();
        if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!("broker poll failed: {err}");
            continue;
        }
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                let mut buf = [0u8; 64];
                while matches!(waker_rx.read(&mut buf), Ok(n) if n > 0) {}
                continue;
            }
            let fd = event.token().0 as RawFd;
            handle.dispatch(fd, event.is_readable(), event.is_writable());
        }
    }

    handle.drain_tasks();
    shutdown_sequence(&handle, &mut poll);
}

/// Broker shutdown sequence (spec.md §4.1): notify every live source,
/// drain keep-alive sides for up to `shutdown_timeout`, then force
/// disconnect whatever remains.
fn shutdown_sequence(handle: &BrokerHandle, poll: &mut Poll) {
    for source in handle.unique_sources() {
        source.on_shutdown(handle);
    }

    let deadline = Instant::now() + handle.0.shutdown_timeout;
    let mut events = Events::with_capacity(64);
    loop {
        let any_keep_alive = handle
            .0
            .readers
            .lock()
            .unwrap()
            .values()
            .any(|side| side.keep_alive() && side.is_open());
        if !any_keep_alive {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        let wait = remaining.min(POLL_TIMEOUT);
        if poll.poll(&mut events, Some(wait)).is_err() {
            break;
        }
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            handle.dispatch(fd, event.is_readable(), event.is_writable());
        }
    }

    for source in handle.unique_sources() {
        source.on_disconnect(handle);
    }
}
