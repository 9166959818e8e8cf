use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the embedding host.
///
/// Teardown failures never show up here; they are logged on the loop thread
/// so that closing the engine always runs to completion.
#[derive(Debug, Error)]
pub enum Error {
    /// The path is already present in the watch-point table.
    #[error("already watching path: {}", path.display())]
    AlreadyWatching { path: PathBuf },

    /// The OS rejected the watch registration.
    #[error("couldn't add watch for {}: {source}", path.display())]
    Register { path: PathBuf, source: io::Error },

    /// The path disappeared, or never was a directory, while registration ran.
    #[error("couldn't start watching {} because it is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    /// The loop thread failed to set up its OS resources.
    #[error("couldn't initialize watcher: {source}")]
    Init { source: io::Error },

    /// The loop did not finish a submitted command in time. The command may
    /// still run later; the engine state is indeterminate.
    #[error("command execution timed out")]
    CommandTimeout,

    /// The loop thread did not signal readiness in time.
    #[error("starting thread timed out")]
    StartTimeout,

    /// The server was closed twice, or used after close.
    #[error("closed already")]
    ClosedAlready,

    /// The loop tore down before the command could run.
    #[error("server already terminated")]
    Terminated,
}
