use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use log::error;

/// Normalized change taxonomy reported to the sink.
///
/// The numeric values are part of the host contract and must not change.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChangeKind {
    Created = 0,
    Removed = 1,
    Modified = 2,
    /// Events were dropped by the OS; the host has to rescan the directory.
    Invalidated = 3,
    Unknown = 4,
}

impl ChangeKind {
    /// Wire code for host bindings that speak integers.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Host-supplied callback surface.
///
/// Both methods run on the loop thread only, so implementations do not need
/// to be thread safe. They should return quickly; the loop reads no further
/// events while a callback is running.
pub trait Sink: Send {
    fn path_changed(&mut self, kind: ChangeKind, path: &Path);

    fn report_error(&mut self, message: &str);
}

/// Shields the loop from misbehaving sinks: panics from `path_changed` are
/// forwarded to `report_error`, panics from `report_error` are logged.
pub(crate) struct SinkAdapter {
    inner: Box<dyn Sink>,
}

impl SinkAdapter {
    pub fn new(inner: Box<dyn Sink>) -> Self {
        SinkAdapter { inner }
    }

    pub fn path_changed(&mut self, kind: ChangeKind, path: &Path) {
        let inner = &mut self.inner;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| inner.path_changed(kind, path))) {
            self.report_error(&format!("change callback failed: {}", panic_message(payload.as_ref())));
        }
    }

    pub fn report_error(&mut self, message: &str) {
        let inner = &mut self.inner;
        if panic::catch_unwind(AssertUnwindSafe(|| inner.report_error(message))).is_err() {
            error!("error callback failed while reporting: {message}");
        }
    }
}

impl fmt::Debug for SinkAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkAdapter").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
