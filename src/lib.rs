#![warn(rust_2018_idioms, missing_debug_implementations)]

pub use error::{Error, Result};
pub use event::{ChangeKind, Sink};
pub use server::{Server, WatcherConfig};

mod command;
mod error;
mod event;
pub mod path;
mod server;
mod watcher;
