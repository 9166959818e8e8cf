use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::{debug, error, info, warn};
use widestring::{U16CString, U16Str, U16String};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED,
    ERROR_SUCCESS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ACTION_ADDED,
    FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME,
    FILE_ACTION_RENAMED_OLD_NAME, FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS,
    FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
    FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, OpenThread, QueueUserAPC, SleepEx, INFINITE, THREAD_ALL_ACCESS,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

use crate::command::{Command, Request};
use crate::error::{Error, Result};
use crate::event::{ChangeKind, SinkAdapter};
use crate::path::{strip_long_path, to_long_path, utf16_to_utf8};
use crate::server::{Shared, StartupGate, WatcherConfig};

const EVENT_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    NotListening,
    Listening,
    Cancelled,
    Finished,
}

enum ListenOutcome {
    Success,
    Deleted,
}

/// One watched directory driving one overlapped `ReadDirectoryChangesW` at a
/// time. Boxed so the address stays stable while a read is in flight; the
/// completion routine finds it again through `overlapped.hEvent`.
struct WatchPoint {
    overlapped: OVERLAPPED,
    // long-path form, also the table key
    path: U16String,
    handle: HANDLE,
    status: Status,
    buffer: Vec<u32>,
    state: *mut LoopState,
}

impl WatchPoint {
    fn new(state: *mut LoopState, buffer_size: usize, path: U16String) -> Result<Box<WatchPoint>> {
        let wide = U16CString::from_ustr(&path).map_err(|_| Error::Register {
            path: path_to_buf(&path),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul character"),
        })?;
        // SAFETY: wide is a valid null terminated string
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::Register {
                path: path_to_buf(&path),
                source: io::Error::last_os_error(),
            });
        }

        let mut point = Box::new(WatchPoint {
            // SAFETY: OVERLAPPED is a plain C struct, all zeros is its reset state
            overlapped: unsafe { std::mem::zeroed() },
            path,
            handle,
            status: Status::NotListening,
            // dword sized so the kernel gets an aligned buffer
            buffer: vec![0u32; buffer_size.div_ceil(4)],
            state,
        });
        point.overlapped.hEvent = &mut *point as *mut WatchPoint as HANDLE;

        match point.listen()? {
            ListenOutcome::Success => Ok(point),
            ListenOutcome::Deleted => Err(Error::NotADirectory {
                path: path_to_buf(&point.path),
            }),
        }
    }

    /// Arms one overlapped read. Each completion delivers at most one batch,
    /// so this runs again after every callback.
    fn listen(&mut self) -> Result<ListenOutcome> {
        // SAFETY: handle, buffer and overlapped live as long as this watch
        // point; the completion routine only runs on the loop thread
        let queued = unsafe {
            ReadDirectoryChangesW(
                self.handle,
                self.buffer.as_mut_ptr() as *mut c_void,
                (self.buffer.len() * 4) as u32,
                0, // recursion is the host's business
                EVENT_FILTER,
                std::ptr::null_mut(),
                &mut self.overlapped,
                Some(handle_event_callback),
            )
        };
        if queued != 0 {
            self.status = Status::Listening;
            return Ok(ListenOutcome::Success);
        }

        // SAFETY: always safe to call
        let listen_error = unsafe { GetLastError() };
        self.close_handle();
        if listen_error == ERROR_ACCESS_DENIED && !self.is_valid_directory() {
            Ok(ListenOutcome::Deleted)
        } else {
            Err(Error::Register {
                path: path_to_buf(&self.path),
                source: io::Error::from_raw_os_error(listen_error as i32),
            })
        }
    }

    /// Requests an async cancel. Returns `true` when a completion with
    /// ERROR_OPERATION_ABORTED is still on its way.
    fn cancel(&mut self) -> bool {
        if self.status != Status::Listening {
            return false;
        }
        debug!("cancelling {}", self.display_path());
        self.status = Status::Cancelled;
        // SAFETY: handle is still open, close_handle runs after this
        let cancelled = unsafe { CancelIoEx(self.handle, &self.overlapped) };
        if cancelled == 0 {
            // SAFETY: always safe to call
            let cancel_error = unsafe { GetLastError() };
            self.close_handle();
            if cancel_error == ERROR_NOT_FOUND {
                // nothing in flight, the completion was already delivered
                debug!("watch point already finished {}", self.display_path());
            } else {
                warn!(
                    "couldn't cancel watch point {}: {}",
                    self.display_path(),
                    io::Error::from_raw_os_error(cancel_error as i32)
                );
            }
            return false;
        }
        true
    }

    fn close_handle(&mut self) {
        if self.status != Status::Finished {
            // SAFETY: handle came from CreateFileW and is closed exactly once
            if unsafe { CloseHandle(self.handle) } == 0 {
                error!(
                    "couldn't close handle for {}: {}",
                    self.display_path(),
                    io::Error::last_os_error()
                );
            }
            self.status = Status::Finished;
        }
    }

    fn is_valid_directory(&self) -> bool {
        let Ok(wide) = U16CString::from_ustr(&self.path) else {
            return false;
        };
        // SAFETY: wide is a valid null terminated string
        let attributes = unsafe { GetFileAttributesW(wide.as_ptr()) };
        attributes != INVALID_FILE_ATTRIBUTES && (attributes & FILE_ATTRIBUTE_DIRECTORY) != 0
    }

    fn display_path(&self) -> String {
        utf16_to_utf8(&self.path)
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        if self.cancel() {
            // the aborted completion has to drain before the buffer goes away
            // SAFETY: a zero alertable wait only runs already queued routines
            unsafe { SleepEx(0, 1) };
        }
        // an unfinished point here means the cancel never completed; closing
        // anyway keeps the all-handles-released guarantee
        if self.status != Status::NotListening && self.status != Status::Finished {
            warn!(
                "watch point {} did not finish, closing its handle (status = {:?})",
                self.display_path(),
                self.status
            );
        }
        self.close_handle();
    }
}

struct LoopState {
    shared: Arc<Shared>,
    watch_points: HashMap<U16String, Box<WatchPoint>>,
    buffer_size: usize,
    terminated: bool,
    sink: SinkAdapter,
}

/// Commands ride user-mode APCs onto the loop thread, which parks in
/// alertable waits between them.
pub(crate) struct Wake {
    target: OnceLock<WakeTarget>,
}

#[derive(Clone, Copy)]
struct WakeTarget {
    thread: HANDLE,
    state: *mut LoopState,
}

// SAFETY: the thread handle may be used from any thread; the state pointer is
// only ever dereferenced by APCs running on the loop thread itself
unsafe impl Send for WakeTarget {}
unsafe impl Sync for WakeTarget {}

impl Wake {
    pub fn new() -> Result<Self> {
        Ok(Wake {
            target: OnceLock::new(),
        })
    }

    fn arm(&self, thread: HANDLE, state: *mut LoopState) {
        let _ = self.target.set(WakeTarget { thread, state });
    }

    pub fn wake(&self) {
        let Some(target) = self.target.get() else {
            return;
        };
        // SAFETY: the loop thread is joined only after close, and commands
        // are not submitted past that point
        let queued =
            unsafe { QueueUserAPC(Some(process_commands_apc), target.thread, target.state as usize) };
        if queued == 0 {
            warn!("couldn't queue command callback: {}", io::Error::last_os_error());
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
    // GetCurrentThread returns a pseudo handle that does not accept APCs, so
    // open a real one
    // SAFETY: always safe to call
    let thread = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, GetCurrentThreadId()) };
    if thread == 0 {
        gate.notify(Err(Error::Init {
            source: io::Error::last_os_error(),
        }));
        return;
    }

    let state = Box::into_raw(Box::new(LoopState {
        shared: Arc::clone(&shared),
        watch_points: HashMap::new(),
        buffer_size: config.buffer_size,
        terminated: false,
        sink,
    }));
    shared.wake.arm(thread, state);
    gate.notify(Ok(()));
    debug!("started watcher loop");

    // SAFETY: state stays valid until the box is reclaimed below; APCs and
    // completion routines only run inside these alertable waits, on this
    // thread
    unsafe {
        while !(*state).terminated {
            SleepEx(INFINITE, 1);
        }

        debug!("finished with run loop, now cancelling remaining watch points");
        let mut pending = 0;
        for point in (*state).watch_points.values_mut() {
            match point.status {
                Status::Listening => {
                    if point.cancel() {
                        pending += 1;
                    }
                }
                Status::Cancelled => pending += 1,
                _ => {}
            }
        }
        if pending > 0 {
            debug!("waiting for {pending} pending watch points to finish");
            SleepEx(0, 1);
        }

        // dropping the table closes whatever is still open
        drop(Box::from_raw(state));
        CloseHandle(thread);
    }

    for command in shared.queue.drain() {
        command.completion.finish(Err(Error::Terminated));
    }
    debug!("stopped watcher loop");
}

unsafe extern "system" fn process_commands_apc(parameter: usize) {
    let state = parameter as *mut LoopState;
    let commands = (*state).shared.queue.drain();
    for command in commands {
        let Command {
            request,
            completion,
        } = command;
        completion.finish(execute(state, request));
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
            // cancelling and closing happens after the loop drops out of its
            // alertable wait
            (*state).terminated = true;
            Ok(true)
        }
    }
}

unsafe fn register_path(state: *mut LoopState, path: &Path) -> Result<()> {
    let long_path = to_long_path(&U16String::from_os_str(path));
    if let Some(existing) = (*state).watch_points.get(&long_path) {
        if existing.status != Status::Finished {
            return Err(Error::AlreadyWatching {
                path: path.to_path_buf(),
            });
        }
        // the old watch point already shut itself down, replace it
        (*state).watch_points.remove(&long_path);
    }
    let point = WatchPoint::new(state, (*state).buffer_size, long_path.clone())?;
    (*state).watch_points.insert(long_path, point);
    Ok(())
}

unsafe fn unregister_path(state: *mut LoopState, path: &Path) -> bool {
    let long_path = to_long_path(&U16String::from_os_str(path));
    match (*state).watch_points.remove(&long_path) {
        // dropping cancels the outstanding read and closes the handle
        Some(point) => {
            drop(point);
            true
        }
        None => {
            info!("path is not watched: {}", path.display());
            false
        }
    }
}

unsafe extern "system" fn handle_event_callback(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let point = (*overlapped).hEvent as *mut WatchPoint;
    if error_code == ERROR_OPERATION_ABORTED {
        debug!("finished watching {}", (*point).display_path());
        (*point).close_handle();
        return;
    }
    if (*point).status != Status::Listening {
        debug!(
            "ignoring incoming events for {} as watch point is not listening (status = {:?})",
            (*point).display_path(),
            (*point).status
        );
        return;
    }
    (*point).status = Status::NotListening;
    handle_events(point, error_code, bytes_transferred);
}

unsafe fn handle_events(point: *mut WatchPoint, error_code: u32, bytes_transferred: u32) {
    let state = (*point).state;
    let root = (*point).path.clone();

    if error_code != ERROR_SUCCESS {
        if error_code == ERROR_ACCESS_DENIED && !(*point).is_valid_directory() {
            // the watched directory itself is gone
            report(state, ChangeKind::Removed, &root);
        } else {
            (*state).sink.report_error(&format!(
                "error received when handling events for {}: {}",
                utf16_to_utf8(&root),
                io::Error::from_raw_os_error(error_code as i32)
            ));
        }
        (*point).close_handle();
        return;
    }

    if (*state).terminated {
        debug!(
            "ignoring incoming events for {} because server is terminating",
            utf16_to_utf8(&root)
        );
        return;
    }

    if bytes_transferred == 0 {
        // the kernel could not fit the change set into the buffer and
        // truncated it to nothing; the host has to rescan
        info!("detected overflow for {}", utf16_to_utf8(&root));
        report(state, ChangeKind::Invalidated, &root);
    } else {
        decode_events(
            state,
            &root,
            (*point).buffer.as_ptr() as *const u8,
            bytes_transferred as usize,
        );
    }

    match (*point).listen() {
        Ok(ListenOutcome::Success) => {}
        Ok(ListenOutcome::Deleted) => {
            debug!("watched directory removed for {}", utf16_to_utf8(&root));
            report(state, ChangeKind::Removed, &root);
        }
        Err(err) => (*state).sink.report_error(&err.to_string()),
    }
}

/// Walks the `FILE_NOTIFY_INFORMATION` chain in the completion buffer.
unsafe fn decode_events(state: *mut LoopState, root: &U16Str, buffer: *const u8, len: usize) {
    let mut offset = 0usize;
    loop {
        let info = &*(buffer.add(offset) as *const FILE_NOTIFY_INFORMATION);
        handle_event(state, root, info);
        if info.NextEntryOffset == 0 {
            break;
        }
        offset += info.NextEntryOffset as usize;
        if offset >= len {
            break;
        }
    }
}

unsafe fn handle_event(state: *mut LoopState, root: &U16Str, info: &FILE_NOTIFY_INFORMATION) {
    // FileNameLength is in bytes and the name is not null terminated
    let name = std::slice::from_raw_parts(info.FileName.as_ptr(), (info.FileNameLength / 2) as usize);
    let mut changed = root.to_ustring();
    if !name.is_empty() {
        changed.push_slice([u16::from(b'\\')]);
        changed.push_slice(name);
    }
    debug!("change 0x{:x} for {}", info.Action, utf16_to_utf8(&changed));

    let kind = classify(info.Action);
    if kind == ChangeKind::Unknown {
        warn!("unknown action 0x{:x} for {}", info.Action, utf16_to_utf8(&changed));
    }
    report(state, kind, &changed);
}

fn classify(action: u32) -> ChangeKind {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeKind::Created,
        FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeKind::Removed,
        FILE_ACTION_MODIFIED => ChangeKind::Modified,
        _ => ChangeKind::Unknown,
    }
}

unsafe fn report(state: *mut LoopState, kind: ChangeKind, path: &U16Str) {
    let stripped = strip_long_path(path);
    (*state)
        .sink
        .path_changed(kind, &PathBuf::from(stripped.to_os_string()));
}

fn path_to_buf(path: &U16Str) -> PathBuf {
    PathBuf::from(path.to_os_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_map_to_kinds() {
        assert_eq!(classify(FILE_ACTION_ADDED), ChangeKind::Created);
        assert_eq!(classify(FILE_ACTION_RENAMED_NEW_NAME), ChangeKind::Created);
        assert_eq!(classify(FILE_ACTION_REMOVED), ChangeKind::Removed);
        assert_eq!(classify(FILE_ACTION_RENAMED_OLD_NAME), ChangeKind::Removed);
        assert_eq!(classify(FILE_ACTION_MODIFIED), ChangeKind::Modified);
        assert_eq!(classify(0xdead), ChangeKind::Unknown);
    }
}
