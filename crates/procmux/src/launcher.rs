use std::sync::Arc;
use std::time::Duration;

use procmux_packets::ProcessMode;
use procmux_transport::{LocalListener, LocalStream, TransportError};
use tracing::{info, warn};

use crate::endpoint::{LauncherEndpoint, PairShared};
use crate::error::{LaunchError, Result};
use crate::handle::ProcessHandle;
use crate::mux::{run_connection, MuxShared};

/// How often the accept loop rechecks for shutdown while no helper has
/// connected yet.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The launcher connection to the helper process.
///
/// One `Launcher` owns the launcher context: the thread that accepts the
/// helper, parses its packets and routes them to per-process endpoints, plus
/// the writer thread that feeds the wire. Construct it once, pass it to
/// whoever needs to [`register`](Self::register) processes, and call
/// [`shutdown`](Self::shutdown) (or drop it) at host teardown.
pub struct Launcher {
    mux: Arc<MuxShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Launcher {
    /// Bind `path` and wait in the background for the helper to connect.
    ///
    /// The helper is expected to connect exactly once; peers running under a
    /// different uid are rejected and the wait continues.
    pub fn listen(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let listener = LocalListener::bind(path)?;
        let mux = MuxShared::new();
        let thread = {
            let mux = Arc::clone(&mux);
            std::thread::Builder::new()
                .name("procmux-launcher".into())
                .spawn(move || accept_then_run(&mux, listener))
                .map_err(LaunchError::Spawn)?
        };
        Ok(Self {
            mux,
            thread: Some(thread),
        })
    }

    /// Drive an already-connected helper stream.
    ///
    /// For hosts that manage helper startup themselves, and for tests that
    /// stand in for the helper over a socketpair.
    pub fn attach(stream: LocalStream) -> Result<Self> {
        let mux = MuxShared::new();
        let thread = {
            let mux = Arc::clone(&mux);
            std::thread::Builder::new()
                .name("procmux-launcher".into())
                .spawn(move || run_connection(&mux, stream))
                .map_err(LaunchError::Spawn)?
        };
        Ok(Self {
            mux,
            thread: Some(thread),
        })
    }

    /// Create the endpoint pair for `token`.
    ///
    /// Returns `None` when the token is already registered. The returned
    /// handle owns the caller side; dropping it unregisters the pair.
    pub fn register(&self, token: u32, mode: ProcessMode) -> Option<ProcessHandle> {
        let pair = Arc::new(PairShared::new(token));
        let endpoint = Arc::new(LauncherEndpoint::new(Arc::clone(&pair)));
        if !self.mux.insert_endpoint(token, endpoint) {
            warn!(token, "token already registered");
            return None;
        }
        Some(ProcessHandle::new(token, mode, Arc::clone(&self.mux), pair))
    }

    /// Remove a registration without going through the handle.
    ///
    /// Severs the pair; a surviving handle keeps working as a record of the
    /// last observed state but receives nothing further.
    pub fn unregister(&self, token: u32) {
        if let Some(endpoint) = self.mux.remove_endpoint(token) {
            endpoint.detach_caller();
        }
    }

    /// Whether the helper connection is up.
    pub fn is_ready(&self) -> bool {
        self.mux.is_ready()
    }

    /// The terminal socket error, if one occurred.
    pub fn last_error(&self) -> Option<String> {
        self.mux.last_error()
    }

    /// Send the helper a shutdown request and tear the connection down.
    ///
    /// Waits up to one second for the final packet to reach the wire, then
    /// proceeds unconditionally.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!("shutting down launcher");
        self.mux.begin_shutdown();
        let _ = thread.join();
        self.mux.warn_leftover_processes();
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn accept_then_run(mux: &Arc<MuxShared>, listener: LocalListener) {
    let stream = loop {
        if mux.is_shutting_down() {
            return;
        }
        match listener.poll_helper() {
            Ok(Some(stream)) => break stream,
            Ok(None) => std::thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(TransportError::PeerMismatch { peer_uid, host_uid }) => {
                warn!(peer_uid, host_uid, "rejected launcher peer");
            }
            Err(err) => {
                mux.fail(&format!("socket error: {err}"));
                return;
            }
        }
    };
    drop(listener);
    run_connection(mux, stream);
}
