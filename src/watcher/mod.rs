#[cfg(target_os = "linux")]
pub(crate) use linux::{run_loop, Wake};
#[cfg(target_os = "macos")]
pub(crate) use macos::{run_loop, Wake};
#[cfg(windows)]
pub(crate) use windows::{run_loop, Wake};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;
