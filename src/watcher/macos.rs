use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use core_foundation_sys::base::CFRelease;
use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, CFRunLoopAddSource, CFRunLoopGetCurrent, CFRunLoopRef, CFRunLoopRun,
    CFRunLoopSourceContext, CFRunLoopSourceCreate, CFRunLoopSourceInvalidate, CFRunLoopSourceRef,
    CFRunLoopSourceSignal, CFRunLoopStop, CFRunLoopWakeUp,
};
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use log::{debug, info};

use crate::command::{Command, Request};
use crate::error::{Error, Result};
use crate::event::{ChangeKind, SinkAdapter};
use crate::server::{Shared, StartupGate, WatcherConfig};

/// One FSEvents stream per registered path, scheduled on the loop's run loop.
struct WatchPoint {
    stream: fs::FSEventStreamRef,
}

impl WatchPoint {
    fn new(state: *mut LoopState, path: &Path, latency: f64) -> Result<WatchPoint> {
        let Some(utf8) = path.to_str() else {
            return Err(Error::Register {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path is not valid unicode"),
            });
        };

        // SAFETY: documented CoreServices contract; the context struct is
        // copied by FSEventStreamCreate before it returns
        unsafe {
            let mut cf_error: cf::CFErrorRef = std::ptr::null_mut();
            let cf_path = cf::str_path_to_cfstring_ref(utf8, &mut cf_error);
            if cf_path.is_null() {
                if !cf_error.is_null() {
                    cf::CFRelease(cf_error as cf::CFRef);
                }
                return Err(Error::Register {
                    path: path.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, "couldn't convert path"),
                });
            }
            let cf_paths =
                cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
            cf::CFArrayAppendValue(cf_paths, cf_path);
            cf::CFRelease(cf_path);

            let context = fs::FSEventStreamContext {
                version: 0,
                info: state as *mut c_void,
                retain: None,
                release: None,
                copy_description: None,
            };
            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                handle_stream_events,
                &context,
                cf_paths,
                fs::kFSEventStreamEventIdSinceNow,
                latency,
                fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagFileEvents
                    | fs::kFSEventStreamCreateFlagWatchRoot,
            );
            cf::CFRelease(cf_paths);
            if stream.is_null() {
                return Err(Error::Register {
                    path: path.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::Other, "couldn't create event stream"),
                });
            }

            fs::FSEventStreamScheduleWithRunLoop(
                stream,
                (*state).run_loop as cf::CFRef,
                cf::kCFRunLoopDefaultMode,
            );
            if fs::FSEventStreamStart(stream) == 0 {
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
                return Err(Error::Register {
                    path: path.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::Other, "couldn't start event stream"),
                });
            }
            Ok(WatchPoint { stream })
        }
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        // SAFETY: the stream was scheduled on the loop thread's run loop and
        // this drop runs on that same thread
        unsafe {
            fs::FSEventStreamStop(self.stream);
            fs::FSEventStreamInvalidate(self.stream);
            fs::FSEventStreamRelease(self.stream);
        }
    }
}

struct LoopState {
    shared: Arc<Shared>,
    watch_points: HashMap<PathBuf, WatchPoint>,
    run_loop: CFRunLoopRef,
    latency: f64,
    terminated: bool,
    sink: SinkAdapter,
}

/// Commands arrive through a run loop source that doubles as the keep-alive
/// which stops `CFRunLoopRun` from returning while the table is empty.
pub(crate) struct Wake {
    target: OnceLock<WakeTarget>,
}

#[derive(Clone, Copy)]
struct WakeTarget {
    source: CFRunLoopSourceRef,
    run_loop: CFRunLoopRef,
}

// SAFETY: signalling a source and waking a run loop are documented as thread
// safe; the refs stay valid until the loop thread is joined after close
unsafe impl Send for WakeTarget {}
unsafe impl Sync for WakeTarget {}

impl Wake {
    pub fn new() -> Result<Self> {
        Ok(Wake {
            target: OnceLock::new(),
        })
    }

    fn arm(&self, source: CFRunLoopSourceRef, run_loop: CFRunLoopRef) {
        let _ = self.target.set(WakeTarget { source, run_loop });
    }

    pub fn wake(&self) {
        let Some(target) = self.target.get() else {
            return;
        };
        // SAFETY: see WakeTarget
        unsafe {
            CFRunLoopSourceSignal(target.source);
            CFRunLoopWakeUp(target.run_loop);
        }
    }
}

impl fmt::Debug for Wake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wake").finish_non_exhaustive()
    }
}

pub(crate) fn run_loop(
    shared: Arc<Shared>,
    sink: SinkAdapter,
    config: WatcherConfig,
    gate: Arc<StartupGate>,
) {
    // SAFETY: all run loop objects are created and used on this thread; the
    // state box is reclaimed after CFRunLoopRun returns
    unsafe {
        let run_loop = CFRunLoopGetCurrent();
        let state = Box::into_raw(Box::new(LoopState {
            shared: Arc::clone(&shared),
            watch_points: HashMap::new(),
            run_loop,
            latency: config.latency.as_secs_f64(),
            terminated: false,
            sink,
        }));

        let mut context = CFRunLoopSourceContext {
            version: 0,
            info: state as *mut c_void,
            retain: None,
            release: None,
            copyDescription: None,
            equal: None,
            hash: None,
            schedule: None,
            cancel: None,
            perform: process_commands_callback,
        };
        let source = CFRunLoopSourceCreate(std::ptr::null(), 0, &mut context);
        if source.is_null() {
            gate.notify(Err(Error::Init {
                source: io::Error::new(io::ErrorKind::Other, "couldn't create run loop source"),
            }));
            drop(Box::from_raw(state));
            return;
        }
        CFRunLoopAddSource(run_loop, source, kCFRunLoopDefaultMode);
        shared.wake.arm(source, run_loop);
        gate.notify(Ok(()));
        debug!("started watcher loop");

        CFRunLoopRun();

        CFRunLoopSourceInvalidate(source);
        CFRelease(source as *const c_void);
        drop(Box::from_raw(state));
    }

    for command in shared.queue.drain() {
        command.completion.finish(Err(Error::Terminated));
    }
    debug!("stopped watcher loop");
}

extern "C" fn process_commands_callback(info: *const c_void) {
    let state = info as *mut LoopState;
    // SAFETY: the source only fires on the loop thread while state is alive
    unsafe {
        let commands = (*state).shared.queue.drain();
        for command in commands {
            let Command {
                request,
                completion,
            } = command;
            completion.finish(execute(state, request));
        }
    }
}

unsafe fn execute(state: *mut LoopState, request: Request) -> Result<bool> {
    match request {
        Request::Register(paths) => {
            if (*state).terminated {
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
            // dropping the table stops and invalidates every stream
            (*state).watch_points.clear();
            (*state).terminated = true;
            CFRunLoopStop((*state).run_loop);
            Ok(true)
        }
    }
}

unsafe fn register_path(state: *mut LoopState, path: &Path) -> Result<()> {
    if (*state).watch_points.contains_key(path) {
        return Err(Error::AlreadyWatching {
            path: path.to_path_buf(),
        });
    }
    let point = WatchPoint::new(state, path, (*state).latency)?;
    (*state).watch_points.insert(path.to_path_buf(), point);
    Ok(())
}

unsafe fn unregister_path(state: *mut LoopState, path: &Path) -> bool {
    match (*state).watch_points.remove(path) {
        Some(_point) => true,
        None => {
            info!("path is not watched: {}", path.display());
            false
        }
    }
}

extern "C" fn handle_stream_events(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    let state = info as *mut LoopState;
    // SAFETY: FSEvents hands over parallel arrays of num_events entries; the
    // callback only ever runs on the loop thread while state is alive
    unsafe {
        let paths = event_paths as *const *const c_char;
        for index in 0..num_events {
            let path = CStr::from_ptr(*paths.add(index));
            let flags = *event_flags.add(index);
            handle_event(state, path, flags);
        }
    }
}

unsafe fn handle_event(state: *mut LoopState, path: &CStr, flags: fs::FSEventStreamEventFlags) {
    let path = PathBuf::from(path.to_string_lossy().as_ref());
    debug!("event flags 0x{flags:x} for {}", path.display());

    if flags
        & (fs::kFSEventStreamEventFlagMustScanSubDirs
            | fs::kFSEventStreamEventFlagUserDropped
            | fs::kFSEventStreamEventFlagKernelDropped)
        != 0
    {
        (*state).sink.path_changed(ChangeKind::Invalidated, &path);
        return;
    }
    if flags & fs::kFSEventStreamEventFlagRootChanged != 0 {
        // the watched root was renamed or removed from under us; the stream
        // cannot recover, so the watch point goes with it
        (*state).sink.path_changed(ChangeKind::Removed, &path);
        if (*state).watch_points.remove(&path).is_some() {
            debug!("finished watching {}", path.display());
        }
        return;
    }

    let kind = classify(flags);
    (*state).sink.path_changed(kind, &path);
}

fn classify(flags: fs::FSEventStreamEventFlags) -> ChangeKind {
    if flags & fs::kFSEventStreamEventFlagItemRenamed != 0 {
        // FSEvents keeps historical flags on the item; a rename still
        // carrying the created flag is the departure half of the pair
        if flags & fs::kFSEventStreamEventFlagItemCreated != 0 {
            ChangeKind::Removed
        } else {
            ChangeKind::Created
        }
    } else if flags & fs::kFSEventStreamEventFlagItemModified != 0 {
        ChangeKind::Modified
    } else if flags & fs::kFSEventStreamEventFlagItemRemoved != 0 {
        ChangeKind::Removed
    } else if flags & fs::kFSEventStreamEventFlagItemCreated != 0 {
        ChangeKind::Created
    } else {
        ChangeKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_kinds() {
        assert_eq!(
            classify(fs::kFSEventStreamEventFlagItemCreated),
            ChangeKind::Created
        );
        assert_eq!(
            classify(fs::kFSEventStreamEventFlagItemRemoved),
            ChangeKind::Removed
        );
        assert_eq!(
            classify(fs::kFSEventStreamEventFlagItemModified),
            ChangeKind::Modified
        );
        assert_eq!(
            classify(fs::kFSEventStreamEventFlagItemRenamed),
            ChangeKind::Created
        );
        assert_eq!(
            classify(
                fs::kFSEventStreamEventFlagItemRenamed | fs::kFSEventStreamEventFlagItemCreated
            ),
            ChangeKind::Removed
        );
        assert_eq!(classify(fs::kFSEventStreamEventFlagNone), ChangeKind::Unknown);
    }
}
