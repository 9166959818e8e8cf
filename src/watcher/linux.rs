use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::command::{Command, Request};
use crate::error::{Error, Result};
use crate::event::{ChangeKind, SinkAdapter};
use crate::server::{Shared, StartupGate, WatcherConfig};

const EVENT_BUFFER_SIZE: usize = 16 * 1024;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
        | WatchMask::DONT_FOLLOW
        | WatchMask::EXCL_UNLINK
}

/// Unblocks the loop's `poll` so queued commands get picked up.
#[derive(Debug)]
pub(crate) struct Wake {
    event: EventFd,
}

impl Wake {
    pub fn new() -> Result<Self> {
        let event = EventFd::from_flags(EfdFlags::EFD_CLOEXEC)
            .map_err(|err| Error::Init { source: err.into() })?;
        Ok(Wake { event })
    }

    pub fn wake(&self) {
        if let Err(err) = self.event.arm() {
            warn!("couldn't signal command eventfd: {err}");
        }
    }

    /// Reads the counter away so the next poll blocks again. The value itself
    /// does not matter, only the notification does.
    fn clear(&self) -> io::Result<u64> {
        let mut value = 0u64;
        // SAFETY: the descriptor is valid and eventfd reads are exactly 8 bytes
        let read = unsafe {
            nix::libc::read(
                self.event.as_fd().as_raw_fd(),
                &mut value as *mut u64 as *mut nix::libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if read == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(value)
        }
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.event.as_fd()
    }
}

/// One inotify watch. Presence in the table means the watch is active; there
/// is no further state to track on Linux.
#[derive(Debug)]
struct WatchPoint {
    descriptor: WatchDescriptor,
}

struct LoopState {
    inotify: Inotify,
    watch_points: HashMap<PathBuf, WatchPoint>,
    // reverse index, kept in lockstep with watch_points
    watch_roots: HashMap<WatchDescriptor, PathBuf>,
    terminated: bool,
    sink: SinkAdapter,
}

pub(crate) fn run_loop(
    shared: Arc<Shared>,
    sink: SinkAdapter,
    _config: WatcherConfig,
    gate: Arc<StartupGate>,
) {
    let inotify = match Inotify::init() {
        Ok(inotify) => inotify,
        Err(source) => {
            gate.notify(Err(Error::Init { source }));
            return;
        }
    };
    let mut state = LoopState {
        inotify,
        watch_points: HashMap::new(),
        watch_roots: HashMap::new(),
        terminated: false,
        sink,
    };
    gate.notify(Ok(()));
    debug!("started watcher loop");

    let mut buffer = [0u8; EVENT_BUFFER_SIZE];
    while !state.terminated {
        let (commands_ready, events_ready) = {
            let mut fds = [
                PollFd::new(shared.wake.fd(), PollFlags::POLLIN),
                // SAFETY: the inotify descriptor stays open for the whole loop
                PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(state.inotify.as_raw_fd()) },
                    PollFlags::POLLIN,
                ),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    state.sink.report_error(&format!("couldn't poll for events: {err}"));
                    state.terminated = true;
                    continue;
                }
            }
            (readable(&fds[0]), readable(&fds[1]))
        };

        if commands_ready {
            if let Err(err) = shared.wake.clear() {
                state
                    .sink
                    .report_error(&format!("couldn't read from command eventfd: {err}"));
                state.terminated = true;
                continue;
            }
            process_commands(&shared, &mut state);
        }

        if events_ready && !state.terminated {
            read_events(&mut state, &mut buffer);
        }
    }

    // normally the terminate command has already emptied the table; anything
    // left here is from an abnormal loop exit
    release_all(&mut state);
    for command in shared.queue.drain() {
        command.completion.finish(Err(Error::Terminated));
    }
    debug!("stopped watcher loop");
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|revents| revents.contains(PollFlags::POLLIN))
}

fn process_commands(shared: &Shared, state: &mut LoopState) {
    for command in shared.queue.drain() {
        let Command {
            request,
            completion,
        } = command;
        completion.finish(execute(state, request));
    }
}

fn execute(state: &mut LoopState, request: Request) -> Result<bool> {
    match request {
        Request::Register(paths) => {
            if state.terminated {
                return Err(Error::Terminated);
            }
            for path in &paths {
                register_path(state, path)?;
            }
            Ok(true)
        }
        Request::Unregister(paths) => {
            let mut all_watched = true;
            for path in &paths {
                all_watched &= unregister_path(state, path);
            }
            Ok(all_watched)
        }
        Request::Terminate => {
            release_all(state);
            state.terminated = true;
            Ok(true)
        }
    }
}

fn register_path(state: &mut LoopState, path: &Path) -> Result<()> {
    if state.watch_points.contains_key(path) {
        return Err(Error::AlreadyWatching {
            path: path.to_path_buf(),
        });
    }
    let descriptor = state
        .inotify
        .add_watch(path, watch_mask())
        .map_err(|source| Error::Register {
            path: path.to_path_buf(),
            source,
        })?;
    state.watch_roots.insert(descriptor.clone(), path.to_path_buf());
    state.watch_points.insert(path.to_path_buf(), WatchPoint { descriptor });
    Ok(())
}

fn unregister_path(state: &mut LoopState, path: &Path) -> bool {
    match state.watch_points.remove(path) {
        Some(point) => {
            state.watch_roots.remove(&point.descriptor);
            if let Err(err) = state.inotify.rm_watch(point.descriptor) {
                warn!("couldn't stop watching {}: {err}", path.display());
            }
            true
        }
        None => {
            info!("path is not watched: {}", path.display());
            false
        }
    }
}

fn release_all(state: &mut LoopState) {
    let paths: Vec<PathBuf> = state.watch_points.keys().cloned().collect();
    for path in paths {
        unregister_path(state, &path);
    }
}

fn read_events(state: &mut LoopState, buffer: &mut [u8]) {
    let events = match state.inotify.read_events(buffer) {
        Ok(events) => events,
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            return;
        }
        Err(err) => {
            state
                .sink
                .report_error(&format!("couldn't read from inotify: {err}"));
            state.terminated = true;
            return;
        }
    };

    let mut seen_any = false;
    for event in events {
        seen_any = true;
        handle_event(state, event);
    }
    if !seen_any {
        // a zero-length read means the descriptor is gone
        state.terminated = true;
    }
}

fn handle_event(state: &mut LoopState, event: inotify::Event<&OsStr>) {
    let mask = event.mask;
    debug!("event mask {mask:?} (wd = {:?}, name = {:?})", event.wd, event.name);

    if mask.contains(EventMask::Q_OVERFLOW) {
        // the kernel queue overflowed for the whole instance; every watched
        // directory may have missed events and has to be rescanned
        let roots: Vec<PathBuf> = state.watch_points.keys().cloned().collect();
        for root in roots {
            state.sink.path_changed(ChangeKind::Invalidated, &root);
        }
        return;
    }
    if mask.contains(EventMask::UNMOUNT) {
        return;
    }

    let root = match state.watch_roots.get(&event.wd) {
        Some(root) => root.clone(),
        // unregistered concurrently, nothing to report against
        None => return,
    };

    if mask.contains(EventMask::IGNORED) {
        // the kernel is finished with this watch, the descriptor is dead
        debug!("finished watching {}", root.display());
        state.watch_points.remove(&root);
        state.watch_roots.remove(&event.wd);
        return;
    }

    let kind = classify(mask);
    let path = match event.name {
        Some(name) if !name.is_empty() => root.join(name),
        _ => root,
    };
    state.sink.path_changed(kind, &path);
}

fn classify(mask: EventMask) -> ChangeKind {
    if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        ChangeKind::Created
    } else if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM) {
        ChangeKind::Removed
    } else if mask.contains(EventMask::MODIFY) {
        ChangeKind::Modified
    } else {
        ChangeKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_map_to_kinds() {
        assert_eq!(classify(EventMask::CREATE), ChangeKind::Created);
        assert_eq!(classify(EventMask::MOVED_TO), ChangeKind::Created);
        assert_eq!(classify(EventMask::CREATE | EventMask::ISDIR), ChangeKind::Created);
        assert_eq!(classify(EventMask::DELETE), ChangeKind::Removed);
        assert_eq!(classify(EventMask::DELETE_SELF), ChangeKind::Removed);
        assert_eq!(classify(EventMask::MOVED_FROM), ChangeKind::Removed);
        assert_eq!(classify(EventMask::MODIFY), ChangeKind::Modified);
        assert_eq!(classify(EventMask::MOVE_SELF), ChangeKind::Unknown);
        assert_eq!(classify(EventMask::ATTRIB), ChangeKind::Unknown);
    }
}
