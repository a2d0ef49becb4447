use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use procmux_packets::{Packet, PacketError, PacketReader};
use procmux_transport::LocalStream;
use tracing::{debug, error, warn};

use crate::endpoint::LauncherEndpoint;

/// How long `shutdown` waits for the final packet to reach the wire.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(1);

/// The socket multiplexer.
///
/// Exclusive owner of the helper connection and the token → endpoint map.
/// Lives in the launcher context: all socket reads happen on the launcher
/// thread and all writes on the writer thread it owns. Callers only ever
/// enqueue outbound frames and read the `ready`/`failed` flags.
pub(crate) struct MuxShared {
    ready: AtomicBool,
    failed: AtomicBool,
    shutting_down: AtomicBool,
    lock: Mutex<MuxState>,
    cond: Condvar,
}

#[derive(Default)]
struct MuxState {
    endpoints: HashMap<u32, Arc<LauncherEndpoint>>,
    pending: VecDeque<Bytes>,
    /// A frame is between the pending queue and the wire.
    in_flight: bool,
    last_error: Option<String>,
    /// Clone used to shut the socket down from outside the I/O threads.
    control: Option<LocalStream>,
}

impl MuxShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            lock: Mutex::new(MuxState::default()),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.lock.lock().unwrap().last_error.clone()
    }

    /// Insert an endpoint; fails when the token is already registered.
    pub(crate) fn insert_endpoint(&self, token: u32, endpoint: Arc<LauncherEndpoint>) -> bool {
        use std::collections::hash_map::Entry;
        match self.lock.lock().unwrap().endpoints.entry(token) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                true
            }
        }
    }

    pub(crate) fn remove_endpoint(&self, token: u32) -> Option<Arc<LauncherEndpoint>> {
        self.lock.lock().unwrap().endpoints.remove(&token)
    }

    /// Enqueue a frame for the writer thread.
    ///
    /// Drops silently until the socket is ready and after it failed, like
    /// every other operation on a dead connection.
    pub(crate) fn send_data(&self, frame: Bytes) {
        if !self.is_ready() || self.is_failed() {
            return;
        }
        self.lock.lock().unwrap().pending.push_back(frame);
        self.cond.notify_all();
    }

    /// Mark the connection dead, flush the error to every endpoint, and
    /// unblock both I/O threads. Only the first failure is reported.
    pub(crate) fn fail(&self, message: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        error!(%message, "launcher socket failed");
        let endpoints: Vec<_> = {
            let mut st = self.lock.lock().unwrap();
            st.last_error = Some(message.to_string());
            st.pending.clear();
            st.in_flight = false;
            if let Some(control) = st.control.take() {
                let _ = control.shutdown();
            }
            st.endpoints.values().cloned().collect()
        };
        self.cond.notify_all();
        for endpoint in endpoints {
            endpoint.handle_socket_error(message);
        }
    }

    /// Flush one `Shutdown` packet within the drain budget, then close the
    /// socket so the I/O threads wind down.
    pub(crate) fn begin_shutdown(&self) {
        if self.is_ready() && !self.is_failed() {
            self.send_data(Packet::Shutdown.encode(0));
            let deadline = Instant::now() + SHUTDOWN_DRAIN_BUDGET;
            let mut st = self.lock.lock().unwrap();
            while !st.pending.is_empty() || st.in_flight {
                let now = Instant::now();
                if now >= deadline || self.is_failed() {
                    break;
                }
                let (guard, _timeout) = self.cond.wait_timeout(st, deadline - now).unwrap();
                st = guard;
            }
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        if let Some(control) = self.lock.lock().unwrap().control.take() {
            let _ = control.shutdown();
        }
        self.cond.notify_all();
    }

    /// Log processes still registered at teardown.
    pub(crate) fn warn_leftover_processes(&self) {
        let endpoints: Vec<_> = {
            let st = self.lock.lock().unwrap();
            st.endpoints.values().cloned().collect()
        };
        for endpoint in endpoints {
            if let Some((program, arguments)) = endpoint.describe_if_active() {
                warn!(
                    %program,
                    ?arguments,
                    "destroying launcher while process is still alive"
                );
            }
        }
    }
}

/// Drive a fresh helper connection: split off the writer, raise the ready
/// edge (flushing deferred starts), then run the read loop until the
/// connection dies or shutdown begins. Runs on the launcher thread.
pub(crate) fn run_connection(mux: &Arc<MuxShared>, stream: LocalStream) {
    let writer_stream = match stream.try_clone() {
        Ok(writer_stream) => writer_stream,
        Err(err) => {
            mux.fail(&format!("socket error: {err}"));
            return;
        }
    };
    match stream.try_clone() {
        Ok(control) => mux.lock.lock().unwrap().control = Some(control),
        Err(err) => {
            mux.fail(&format!("socket error: {err}"));
            return;
        }
    }

    // A shutdown may have raced the helper's connect: it set the flag before
    // this thread stored the control clone, so one of the two sides is
    // guaranteed to observe the other and close the socket.
    if mux.is_shutting_down() {
        if let Some(control) = mux.lock.lock().unwrap().control.take() {
            let _ = control.shutdown();
        }
        return;
    }

    mux.ready.store(true, Ordering::SeqCst);
    debug!("launcher socket ready");

    let writer = {
        let mux = Arc::clone(mux);
        std::thread::spawn(move || write_loop(&mux, writer_stream))
    };

    // Ready edge: flush every start that was requested before the helper
    // connected.
    let endpoints: Vec<_> = {
        let st = mux.lock.lock().unwrap();
        st.endpoints.values().cloned().collect()
    };
    for endpoint in endpoints {
        if let Some(frame) = endpoint.take_pending_start() {
            mux.send_data(frame);
        }
    }

    read_loop(mux, stream);
    let _ = writer.join();
}

fn read_loop(mux: &Arc<MuxShared>, stream: LocalStream) {
    let mut reader = PacketReader::new(stream);
    loop {
        match reader.read_packet() {
            Ok((token, packet)) => {
                if !packet.packet_type().is_helper_report() {
                    mux.fail(&format!(
                        "internal protocol error: unexpected {:?} packet from helper",
                        packet.packet_type()
                    ));
                    return;
                }
                let endpoint = {
                    let st = mux.lock.lock().unwrap();
                    st.endpoints.get(&token).cloned()
                };
                match endpoint {
                    Some(endpoint) => endpoint.handle_packet(packet),
                    // The process was cancelled and unregistered already.
                    None => debug!(token, "dropping packet for unknown token"),
                }
            }
            Err(PacketError::ConnectionClosed) => {
                if !mux.is_shutting_down() {
                    mux.fail("launcher socket closed unexpectedly");
                }
                return;
            }
            Err(err) => {
                if !mux.is_shutting_down() {
                    mux.fail(&format!("internal protocol error: {err}"));
                }
                return;
            }
        }
    }
}

fn write_loop(mux: &Arc<MuxShared>, mut stream: LocalStream) {
    loop {
        let frame = {
            let mut st = mux.lock.lock().unwrap();
            loop {
                if mux.is_failed() {
                    return;
                }
                if let Some(frame) = st.pending.pop_front() {
                    st.in_flight = true;
                    break frame;
                }
                if mux.is_shutting_down() {
                    return;
                }
                st = mux.cond.wait(st).unwrap();
            }
        };

        let result = stream.write_all(&frame).and_then(|_| stream.flush());
        mux.lock.lock().unwrap().in_flight = false;
        mux.cond.notify_all();

        if let Err(err) = result {
            if !mux.is_shutting_down() {
                mux.fail(&format!("socket write error: {err}"));
            }
            return;
        }
    }
}
