use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use procmux_packets::{
    ChannelMode, ExitStatus, Packet, ProcessError, ProcessMode, StartProcessPayload,
};
use tracing::warn;

use crate::endpoint::PairShared;
use crate::mux::MuxShared;
use crate::signal::{ProcessSignal, SignalKind};
use crate::state::ProcessState;

const CANCELED_BEFORE_START: &str = "process was canceled before it was started.";

/// Exit code reported when a process never started.
const FAILED_TO_START_EXIT_CODE: i32 = 255;

/// Notification callbacks, invoked on the caller's thread during a drain.
///
/// Callbacks must not block on `wait_for_*` of the same handle.
#[derive(Default, Clone)]
pub struct ProcessEvents {
    pub on_error_occurred: Option<Arc<dyn Fn(ProcessError) + Send + Sync>>,
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_ready_read_stdout: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_ready_read_stderr: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_finished: Option<Arc<dyn Fn(i32, ExitStatus) + Send + Sync>>,
}

#[derive(Default)]
struct ProcessConfig {
    working_dir: String,
    environment: Vec<String>,
    channel_mode: ChannelMode,
    stdin_file_path: String,
    below_normal_priority: bool,
    native_arguments: String,
    low_priority: bool,
    unix_terminal_disabled: bool,
}

#[derive(Default)]
struct CallerState {
    config: ProcessConfig,
    process_id: u32,
    exit_code: i32,
    exit_status: ExitStatus,
    error: ProcessError,
    error_string: String,
    stdout: BytesMut,
    stderr: BytesMut,
}

enum WaitOutcome {
    /// Something drainable is (or just became) queued.
    Eligible,
    /// The wait was cancelled from outside; the caller stops waiting.
    Cancelled,
    TimedOut,
}

/// The caller-side endpoint for one proxied process.
///
/// A handle belongs to the thread that drives it: configuration, reads and
/// notifications all happen there. The process state and `cancel` are safe
/// from any thread. Dropping the handle unregisters the process from the
/// multiplexer.
pub struct ProcessHandle {
    token: u32,
    process_mode: ProcessMode,
    mux: Arc<MuxShared>,
    pair: Arc<PairShared>,
    caller: Mutex<CallerState>,
    handlers: Mutex<ProcessEvents>,
}

impl ProcessHandle {
    pub(crate) fn new(
        token: u32,
        process_mode: ProcessMode,
        mux: Arc<MuxShared>,
        pair: Arc<PairShared>,
    ) -> Self {
        Self {
            token,
            process_mode,
            mux,
            pair,
            caller: Mutex::new(CallerState::default()),
            handlers: Mutex::new(ProcessEvents::default()),
        }
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn process_mode(&self) -> ProcessMode {
        self.process_mode
    }

    /// Install notification callbacks. Replaces any previous set.
    pub fn set_event_handlers(&self, events: ProcessEvents) {
        *self.handlers.lock().unwrap() = events;
    }

    pub fn set_working_directory(&self, dir: impl Into<String>) {
        self.caller.lock().unwrap().config.working_dir = dir.into();
    }

    /// Environment for the child as `KEY=VALUE` entries.
    pub fn set_environment(&self, environment: Vec<String>) {
        self.caller.lock().unwrap().config.environment = environment;
    }

    pub fn set_channel_mode(&self, mode: ChannelMode) {
        self.caller.lock().unwrap().config.channel_mode = mode;
    }

    pub fn set_stdin_file_path(&self, path: impl Into<String>) {
        self.caller.lock().unwrap().config.stdin_file_path = path.into();
    }

    pub fn set_below_normal_priority(&self) {
        self.caller.lock().unwrap().config.below_normal_priority = true;
    }

    pub fn set_native_arguments(&self, arguments: impl Into<String>) {
        self.caller.lock().unwrap().config.native_arguments = arguments.into();
    }

    pub fn set_low_priority(&self) {
        self.caller.lock().unwrap().config.low_priority = true;
    }

    pub fn set_unix_terminal_disabled(&self) {
        self.caller.lock().unwrap().config.unix_terminal_disabled = true;
    }

    /// Ask the helper to spawn the process.
    ///
    /// Sends the full configuration snapshot in one `StartProcess` packet;
    /// if the helper has not connected yet, the packet is parked and goes
    /// out on the ready edge. At most one start packet is ever sent per
    /// process lifetime: a start while a process is active is ignored.
    pub fn start(
        &self,
        program: impl Into<String>,
        arguments: Vec<String>,
        write_data: impl Into<Bytes>,
    ) {
        let program = program.into();
        if self.mux.is_failed() {
            {
                let mut caller = self.caller.lock().unwrap();
                caller.error = ProcessError::FailedToStart;
                caller.exit_code = FAILED_TO_START_EXIT_CODE;
            }
            self.emit_error(ProcessError::FailedToStart);
            return;
        }
        if self.pair.state.load() != ProcessState::NotRunning {
            warn!(
                token = self.token,
                %program,
                "start requested while a process is still active; ignoring"
            );
            return;
        }

        let payload = {
            let caller = self.caller.lock().unwrap();
            StartProcessPayload {
                program: program.clone(),
                arguments: arguments.clone(),
                working_dir: caller.config.working_dir.clone(),
                environment: caller.config.environment.clone(),
                process_mode: self.process_mode,
                write_data: write_data.into(),
                channel_mode: caller.config.channel_mode,
                stdin_file_path: caller.config.stdin_file_path.clone(),
                below_normal_priority: caller.config.below_normal_priority,
                native_arguments: caller.config.native_arguments.clone(),
                low_priority: caller.config.low_priority,
                unix_terminal_disabled: caller.config.unix_terminal_disabled,
            }
        };
        let frame = Packet::StartProcess(payload).encode(self.token);

        // The ready check happens under the pair mutex: the ready edge takes
        // the parked packet under the same mutex, so the start is either sent
        // here or picked up there, never lost.
        let send_now = {
            let mut st = self.pair.lock.lock().unwrap();
            st.program = program;
            st.arguments = arguments;
            self.pair.state.store(ProcessState::Starting);
            if self.mux.is_ready() {
                true
            } else {
                st.pending_start = Some(frame.clone());
                false
            }
        };
        if send_now {
            self.mux.send_data(frame);
        }
    }

    /// Feed bytes to the child's stdin.
    ///
    /// Returns `None` unless the process is running; nothing is sent then.
    pub fn write(&self, data: &[u8]) -> Option<usize> {
        if self.pair.state.load() != ProcessState::Running {
            return None;
        }
        self.mux.send_data(
            Packet::WriteProcess {
                data: Bytes::copy_from_slice(data),
            }
            .encode(self.token),
        );
        Some(data.len())
    }

    /// Stop the process and drop every not-yet-delivered notification.
    ///
    /// Safe from any state and idempotent. A cancel before the helper
    /// connected discards the parked start packet and reports the failure
    /// directly; later helper reports for this token are dropped.
    pub fn cancel(&self) {
        let mut emit_failed_to_start = false;
        match self.pair.state.swap(ProcessState::NotRunning) {
            ProcessState::NotRunning => {}
            ProcessState::Starting => {
                {
                    let mut caller = self.caller.lock().unwrap();
                    caller.error = ProcessError::FailedToStart;
                    caller.error_string = CANCELED_BEFORE_START.into();
                    caller.exit_code = FAILED_TO_START_EXIT_CODE;
                }
                if self.mux.is_ready() {
                    self.mux.send_data(Packet::StopProcess.encode(self.token));
                } else {
                    emit_failed_to_start = true;
                }
            }
            ProcessState::Running => {
                self.mux.send_data(Packet::StopProcess.encode(self.token));
            }
        }

        {
            let mut st = self.pair.lock.lock().unwrap();
            st.cancelled = true;
            st.queue.clear();
            st.pending_start = None;
            st.awaiting_should_continue = false;
            if st.waiting_for.is_some() {
                st.wait_cancelled = true;
            }
            self.pair.cond.notify_all();
        }

        if emit_failed_to_start {
            self.emit_error(ProcessError::FailedToStart);
        }
    }

    /// Take and clear the buffered stdout.
    pub fn read_all_standard_output(&self) -> Bytes {
        let mut caller = self.caller.lock().unwrap();
        std::mem::take(&mut caller.stdout).freeze()
    }

    /// Take and clear the buffered stderr.
    pub fn read_all_standard_error(&self) -> Bytes {
        let mut caller = self.caller.lock().unwrap();
        std::mem::take(&mut caller.stderr).freeze()
    }

    pub fn state(&self) -> ProcessState {
        self.pair.state.load()
    }

    pub fn process_id(&self) -> u32 {
        self.caller.lock().unwrap().process_id
    }

    pub fn exit_code(&self) -> i32 {
        self.caller.lock().unwrap().exit_code
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.caller.lock().unwrap().exit_status
    }

    pub fn error(&self) -> ProcessError {
        self.caller.lock().unwrap().error
    }

    pub fn error_string(&self) -> String {
        self.caller.lock().unwrap().error_string.clone()
    }

    pub fn program(&self) -> String {
        self.pair.lock.lock().unwrap().program.clone()
    }

    pub fn arguments(&self) -> Vec<String> {
        self.pair.lock.lock().unwrap().arguments.clone()
    }

    /// Drain every queued notification now, on this thread.
    ///
    /// Returns the kinds that were delivered, in queue order.
    pub fn poll_events(&self) -> Vec<SignalKind> {
        self.flush_for(None)
    }

    /// Block until the process reports started.
    ///
    /// `false` on timeout, on any error, or when the process finishes while
    /// waiting. A zero timeout polls the queue without blocking.
    pub fn wait_for_started(&self, timeout: Duration) -> bool {
        if self.pair.state.load() != ProcessState::Starting {
            return false;
        }
        self.wait_for_signal(timeout, SignalKind::Started)
    }

    /// Block until output or a state change arrives.
    pub fn wait_for_ready_read(&self, timeout: Duration) -> bool {
        if self.pair.state.load() == ProcessState::NotRunning {
            return false;
        }
        self.wait_for_signal(timeout, SignalKind::ReadyRead)
    }

    /// Block until the process reports finished.
    pub fn wait_for_finished(&self, timeout: Duration) -> bool {
        if self.pair.state.load() == ProcessState::NotRunning {
            return false;
        }
        self.wait_for_signal(timeout, SignalKind::Finished)
    }

    fn wait_for_signal(&self, timeout: Duration, target: SignalKind) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.block_until_eligible(deadline, target) {
                WaitOutcome::TimedOut => return false,
                WaitOutcome::Cancelled => return true,
                WaitOutcome::Eligible => {}
            }

            self.pair.lock.lock().unwrap().awaiting_should_continue = true;
            let flushed = self.flush_for(Some(target));
            let cancelled_mid_flush = {
                let mut st = self.pair.lock.lock().unwrap();
                let cancelled = !st.awaiting_should_continue;
                st.awaiting_should_continue = false;
                cancelled
            };

            if flushed.contains(&SignalKind::Error) {
                return false;
            }
            if flushed.contains(&target) {
                return true;
            }
            if cancelled_mid_flush {
                return true;
            }
            if flushed.contains(&SignalKind::Finished) {
                // Finished appeared while waiting for something else.
                return false;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Park on the pair's condvar until a drain for `target` makes sense.
    ///
    /// Absolute deadlines tolerate spurious wakeups: only an explicit wake
    /// from the launcher side or a cancel ends the wait early.
    fn block_until_eligible(&self, deadline: Instant, target: SignalKind) -> WaitOutcome {
        let mut st = self.pair.lock.lock().unwrap();
        if st.cancelled {
            return WaitOutcome::Cancelled;
        }
        if st.queue.should_flush_for(target) {
            return WaitOutcome::Eligible;
        }

        debug_assert!(st.waiting_for.is_none(), "nested wait on one handle");
        st.waiting_for = Some(target);
        st.wake = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                st.waiting_for = None;
                return WaitOutcome::TimedOut;
            }
            let (guard, _timeout) = self.pair.cond.wait_timeout(st, deadline - now).unwrap();
            st = guard;
            if st.wait_cancelled || st.cancelled {
                st.wait_cancelled = false;
                st.waiting_for = None;
                return WaitOutcome::Cancelled;
            }
            if st.wake {
                st.wake = false;
                st.waiting_for = None;
                return WaitOutcome::Eligible;
            }
        }
    }

    /// Drain the queue per the split rules and deliver each record, in
    /// order, on this thread.
    fn flush_for(&self, target: Option<SignalKind>) -> Vec<SignalKind> {
        let taken = self.pair.lock.lock().unwrap().queue.take_for(target);
        let mut flushed = Vec::with_capacity(taken.len());
        for signal in taken {
            flushed.push(signal.kind());
            match signal {
                ProcessSignal::Error { error, message } => self.apply_error(error, message),
                ProcessSignal::Started { process_id } => self.apply_started(process_id),
                ProcessSignal::ReadyRead { stdout, stderr } => {
                    self.apply_ready_read(stdout, stderr)
                }
                ProcessSignal::Finished {
                    exit_status,
                    exit_code,
                } => self.apply_finished(exit_status, exit_code),
            }
        }
        flushed
    }

    fn apply_error(&self, error: ProcessError, message: String) {
        self.pair.state.store(ProcessState::NotRunning);
        {
            let mut caller = self.caller.lock().unwrap();
            caller.error = error;
            caller.error_string = message;
            if error == ProcessError::FailedToStart {
                caller.exit_code = FAILED_TO_START_EXIT_CODE;
            }
        }
        self.emit_error(error);
    }

    fn apply_started(&self, process_id: u32) {
        self.pair.state.store(ProcessState::Running);
        self.caller.lock().unwrap().process_id = process_id;
        let callback = self.handlers.lock().unwrap().on_started.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn apply_ready_read(&self, stdout: BytesMut, stderr: BytesMut) {
        let channel_mode = self.caller.lock().unwrap().config.channel_mode;
        if !stdout.is_empty() {
            if channel_mode.forwards_stdout() {
                let mut out = std::io::stdout();
                let _ = out.write_all(&stdout);
                let _ = out.flush();
            } else {
                self.caller.lock().unwrap().stdout.extend_from_slice(&stdout);
                let callback = self.handlers.lock().unwrap().on_ready_read_stdout.clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
        }
        if !stderr.is_empty() {
            if channel_mode.forwards_stderr() {
                let mut err = std::io::stderr();
                let _ = err.write_all(&stderr);
                let _ = err.flush();
            } else {
                self.caller.lock().unwrap().stderr.extend_from_slice(&stderr);
                let callback = self.handlers.lock().unwrap().on_ready_read_stderr.clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
        }
    }

    fn apply_finished(&self, exit_status: ExitStatus, exit_code: i32) {
        self.pair.state.store(ProcessState::NotRunning);
        {
            let mut caller = self.caller.lock().unwrap();
            caller.exit_status = exit_status;
            caller.exit_code = exit_code;
        }
        let callback = self.handlers.lock().unwrap().on_finished.clone();
        if let Some(callback) = callback {
            callback(exit_code, exit_status);
        }
    }

    fn emit_error(&self, error: ProcessError) {
        let callback = self.handlers.lock().unwrap().on_error_occurred.clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.mux.remove_endpoint(self.token);
        let mut st = self.pair.lock.lock().unwrap();
        st.caller_detached = true;
        st.queue.clear();
        st.pending_start = None;
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("token", &self.token)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
