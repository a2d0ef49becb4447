//! Cross-thread process-launcher proxy.
//!
//! Caller threads spawn, feed, observe and stop child processes through one
//! long-lived helper binary, over a single local-socket connection:
//!
//! - The [`Launcher`] owns the connection and its I/O threads (the launcher
//!   context) and hands out per-process [`ProcessHandle`]s.
//! - Each handle pairs with a launcher-side endpoint that turns inbound
//!   packets into queued signal records; bursts of output coalesce in the
//!   queue.
//! - The caller drains its queue on its own thread, via the blocking
//!   [`ProcessHandle::wait_for_finished`] family or [`ProcessHandle::poll_events`],
//!   and observes `started → readyRead* → errorOccurred? → finished` in
//!   queue order.
//!
//! Losing the socket is terminal for every in-flight process: each one gets
//! a synthetic `FailedToStart` error and the launcher reports the failure
//! once.
//!
//! ```no_run
//! use std::time::Duration;
//! use procmux::{Launcher, ProcessMode};
//!
//! # fn main() -> Result<(), procmux::LaunchError> {
//! let launcher = Launcher::listen("/run/user/1000/procmux.sock")?;
//! let process = launcher.register(1, ProcessMode::Reader).expect("fresh token");
//! process.start("echo", vec!["hello".into()], Vec::new());
//! if process.wait_for_finished(Duration::from_secs(5)) {
//!     print!("{}", String::from_utf8_lossy(&process.read_all_standard_output()));
//! }
//! # Ok(())
//! # }
//! ```

mod endpoint;
mod error;
mod handle;
mod launcher;
mod mux;
mod signal;
mod state;

pub use error::{LaunchError, Result};
pub use handle::{ProcessEvents, ProcessHandle};
pub use launcher::Launcher;
pub use signal::SignalKind;
pub use state::ProcessState;

pub use procmux_packets::{ChannelMode, ExitStatus, ProcessError, ProcessMode};
pub use procmux_transport::LocalStream;
