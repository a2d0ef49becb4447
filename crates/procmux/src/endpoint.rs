use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use procmux_packets::{Packet, ProcessError};
use tracing::warn;

use crate::signal::{ProcessSignal, SignalKind, SignalQueue};
use crate::state::AtomicProcessState;

/// State shared between the two halves of one endpoint pair.
///
/// The mutex covers the signal queue, the wait bookkeeping and the deferred
/// start packet; the process state sits outside it so any thread can read it
/// without blocking.
pub(crate) struct PairShared {
    pub(crate) token: u32,
    pub(crate) state: AtomicProcessState,
    pub(crate) lock: Mutex<PairState>,
    pub(crate) cond: Condvar,
}

#[derive(Default)]
pub(crate) struct PairState {
    pub(crate) queue: SignalQueue,
    /// Which signal the caller is currently blocked on, if any.
    pub(crate) waiting_for: Option<SignalKind>,
    /// Set by the launcher side when the blocked caller should drain.
    pub(crate) wake: bool,
    /// Set by `cancel` while a wait is armed; the waiter returns `true`.
    pub(crate) wait_cancelled: bool,
    /// Cleared by `cancel` while the caller is mid-flush.
    pub(crate) awaiting_should_continue: bool,
    /// The caller cancelled; no further records may be delivered.
    pub(crate) cancelled: bool,
    /// The pair was severed by unregistration.
    pub(crate) caller_detached: bool,
    /// A serialized `StartProcess` waiting for the socket to become ready.
    pub(crate) pending_start: Option<Bytes>,
    /// Config snapshot the launcher context may read for diagnostics.
    pub(crate) program: String,
    pub(crate) arguments: Vec<String>,
}

impl PairShared {
    pub(crate) fn new(token: u32) -> Self {
        Self {
            token,
            state: AtomicProcessState::default(),
            lock: Mutex::new(PairState::default()),
            cond: Condvar::new(),
        }
    }
}

/// The launcher-context half of an endpoint pair.
///
/// Translates inbound packets into queued signal records, wakes a blocked
/// caller per the wakeup policy, and hands deferred starts back to the
/// multiplexer when the socket becomes ready.
pub(crate) struct LauncherEndpoint {
    pair: Arc<PairShared>,
}

impl LauncherEndpoint {
    pub(crate) fn new(pair: Arc<PairShared>) -> Self {
        Self { pair }
    }

    pub(crate) fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::ProcessError { error, message } => {
                self.deliver(
                    SignalKind::Error,
                    Some(ProcessSignal::Error { error, message }),
                );
            }
            Packet::ProcessStarted { process_id } => {
                self.deliver(
                    SignalKind::Started,
                    Some(ProcessSignal::Started { process_id }),
                );
            }
            Packet::StandardOutput { data } => {
                // Wake even for an empty chunk; only non-empty ones queue.
                let signal =
                    (!data.is_empty()).then(|| ProcessSignal::ready_read(&data, b""));
                self.deliver(SignalKind::ReadyRead, signal);
            }
            Packet::StandardError { data } => {
                let signal =
                    (!data.is_empty()).then(|| ProcessSignal::ready_read(b"", &data));
                self.deliver(SignalKind::ReadyRead, signal);
            }
            Packet::ProcessFinished(report) => {
                let mut st = self.pair.lock.lock().unwrap();
                self.wake_up_if_waiting_for(&mut st, SignalKind::Finished);
                if st.cancelled || st.caller_detached {
                    return;
                }
                // Unknown means the helper had nothing to report.
                if report.error != ProcessError::Unknown {
                    st.queue.push(ProcessSignal::Error {
                        error: report.error,
                        message: report.message,
                    });
                }
                if !report.stdout.is_empty() || !report.stderr.is_empty() {
                    st.queue
                        .push(ProcessSignal::ready_read(&report.stdout, &report.stderr));
                }
                st.queue.push(ProcessSignal::Finished {
                    exit_status: report.exit_status,
                    exit_code: report.exit_code,
                });
            }
            other => {
                warn!(
                    token = self.pair.token,
                    packet = ?other.packet_type(),
                    "dropping caller-bound packet routed to an endpoint"
                );
            }
        }
    }

    /// The socket became ready; return the deferred start packet, if any,
    /// for the multiplexer to put on the wire.
    pub(crate) fn take_pending_start(&self) -> Option<Bytes> {
        self.pair.lock.lock().unwrap().pending_start.take()
    }

    /// The socket failed; synthesize a start failure for the caller.
    pub(crate) fn handle_socket_error(&self, message: &str) {
        let mut st = self.pair.lock.lock().unwrap();
        self.wake_up_if_waiting_for(&mut st, SignalKind::Error);
        if st.cancelled || st.caller_detached {
            return;
        }
        st.queue.push(ProcessSignal::Error {
            error: ProcessError::FailedToStart,
            message: format!("internal socket error: {message}"),
        });
    }

    /// Sever the pair: no further records reach the (gone) caller.
    pub(crate) fn detach_caller(&self) {
        let mut st = self.pair.lock.lock().unwrap();
        st.caller_detached = true;
        st.queue.clear();
        st.pending_start = None;
    }

    /// Program and arguments of a process that is still live, for teardown
    /// diagnostics.
    pub(crate) fn describe_if_active(&self) -> Option<(String, Vec<String>)> {
        use crate::state::ProcessState;
        if self.pair.state.load() == ProcessState::NotRunning {
            return None;
        }
        let st = self.pair.lock.lock().unwrap();
        Some((st.program.clone(), st.arguments.clone()))
    }

    fn deliver(&self, kind: SignalKind, signal: Option<ProcessSignal>) {
        let mut st = self.pair.lock.lock().unwrap();
        self.wake_up_if_waiting_for(&mut st, kind);
        if st.cancelled || st.caller_detached {
            return;
        }
        if let Some(signal) = signal {
            st.queue.push(signal);
        }
    }

    /// Decide whether an inbound signal should wake a blocked caller:
    /// - the signal it waits for arrived;
    /// - a terminal `Finished`/`Error` arrived while it waits for anything;
    /// - it waits for `Finished` and anything else arrived, or waits for
    ///   `ReadyRead` and `Started` arrived (it will flush and re-enter).
    fn wake_up_if_waiting_for(&self, st: &mut PairState, new_signal: SignalKind) {
        let Some(waiting_for) = st.waiting_for else {
            return;
        };
        let matched = waiting_for == new_signal;
        let terminal_while_waiting =
            matches!(new_signal, SignalKind::Finished | SignalKind::Error);
        let flush_and_continue = (waiting_for == SignalKind::Finished
            && new_signal != SignalKind::Finished)
            || (waiting_for == SignalKind::ReadyRead && new_signal == SignalKind::Started);
        if matched || terminal_while_waiting || flush_and_continue {
            st.wake = true;
            self.pair.cond.notify_all();
        }
    }
}
