use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, warn};

use crate::command::{Command, CommandQueue, Completion, Request};
use crate::error::{Error, Result};
use crate::event::{Sink, SinkAdapter};
use crate::watcher::{self, Wake};

// Bounded wait for a submitted command. Deliberately pathological: hitting it
// means the loop is stuck, not slow.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-backend knobs. Each backend reads only the fields it cares about.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Completion buffer handed to `ReadDirectoryChangesW`, in bytes.
    pub buffer_size: usize,

    /// Latency of FSEvents streams.
    pub latency: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            buffer_size: 64 * 1024,
            latency: Duration::ZERO,
        }
    }
}

/// State shared between the host-facing server handle and the loop thread.
/// Everything else lives on the loop thread and is reached through commands.
pub(crate) struct Shared {
    pub queue: CommandQueue,
    pub wake: Wake,
}

/// Releases the constructing thread once the loop reported in.
#[derive(Default)]
pub(crate) struct StartupGate {
    result: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

impl StartupGate {
    pub fn notify(&self, result: Result<()>) {
        let mut slot = self.result.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let slot = self.result.lock().unwrap();
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap();
        match slot.take() {
            Some(result) => result,
            None => Err(Error::StartTimeout),
        }
    }
}

/// One watcher engine instance: a dedicated loop thread owning the watch
/// points, driven from the outside through commands.
pub struct Server {
    shared: Arc<Shared>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Server {
    /// Starts the loop thread and blocks until it is ready to accept
    /// commands, or until its initialization failed.
    ///
    /// The sink is moved to the loop thread and only ever invoked there.
    pub fn new(sink: Box<dyn Sink>, config: WatcherConfig) -> Result<Server> {
        let shared = Arc::new(Shared {
            queue: CommandQueue::default(),
            wake: Wake::new()?,
        });
        let gate = Arc::new(StartupGate::default());

        let loop_thread = {
            let shared = Arc::clone(&shared);
            let gate = Arc::clone(&gate);
            thread::Builder::new()
                .name("file watcher server".to_string())
                .spawn(move || watcher::run_loop(shared, SinkAdapter::new(sink), config, gate))
                .map_err(|source| Error::Init { source })?
        };

        match gate.wait(START_TIMEOUT) {
            Ok(()) => Ok(Server {
                shared,
                loop_thread: Mutex::new(Some(loop_thread)),
                closed: AtomicBool::new(false),
            }),
            Err(err) => {
                if loop_thread.is_finished() {
                    let _ = loop_thread.join();
                } else {
                    warn!("watcher loop thread is still starting after timeout, leaving it detached");
                }
                Err(err)
            }
        }
    }

    /// Starts watching every path in `paths`, non-recursively. Registering a
    /// path twice fails and leaves paths earlier in the batch watched.
    pub fn register_paths(&self, paths: &[PathBuf]) -> Result<()> {
        self.ensure_open()?;
        self.submit(Request::Register(paths.to_vec())).map(|_| ())
    }

    /// Stops watching the given paths. Returns `true` iff every path was
    /// actually watched; unknown paths are logged, flip the result to
    /// `false` and do not keep the rest of the batch from being
    /// unregistered.
    pub fn unregister_paths(&self, paths: &[PathBuf]) -> Result<bool> {
        self.ensure_open()?;
        self.submit(Request::Unregister(paths.to_vec()))
    }

    /// Tears the engine down. Every watch point has released its OS handle
    /// and the loop thread has been joined by the time this returns.
    ///
    /// A second close fails with [`Error::ClosedAlready`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::ClosedAlready);
        }
        self.shut_down()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ClosedAlready)
        } else {
            Ok(())
        }
    }

    fn shut_down(&self) -> Result<()> {
        let result = self.submit(Request::Terminate).map(|_| ());
        if let Some(thread) = self.loop_thread.lock().unwrap().take() {
            if thread.join().is_err() {
                error!("watcher loop thread panicked during shutdown");
            }
        }
        result
    }

    fn submit(&self, request: Request) -> Result<bool> {
        let completion = Arc::new(Completion::default());
        self.shared.queue.push(Command {
            request,
            completion: Arc::clone(&completion),
        });
        self.shared.wake.wake();
        completion.wait(COMMAND_TIMEOUT)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.shut_down() {
                warn!("couldn't shut down file watcher cleanly: {err}");
            }
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
