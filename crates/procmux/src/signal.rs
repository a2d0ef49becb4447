use bytes::BytesMut;
use procmux_packets::{ExitStatus, ProcessError};

/// The kinds of observable events a process can queue for its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Error,
    Started,
    ReadyRead,
    Finished,
}

/// One queued event, waiting to be drained on the caller's thread.
#[derive(Debug)]
pub(crate) enum ProcessSignal {
    Error {
        error: ProcessError,
        message: String,
    },
    Started {
        process_id: u32,
    },
    ReadyRead {
        stdout: BytesMut,
        stderr: BytesMut,
    },
    Finished {
        exit_status: ExitStatus,
        exit_code: i32,
    },
}

impl ProcessSignal {
    pub(crate) fn kind(&self) -> SignalKind {
        match self {
            ProcessSignal::Error { .. } => SignalKind::Error,
            ProcessSignal::Started { .. } => SignalKind::Started,
            ProcessSignal::ReadyRead { .. } => SignalKind::ReadyRead,
            ProcessSignal::Finished { .. } => SignalKind::Finished,
        }
    }

    pub(crate) fn ready_read(stdout: &[u8], stderr: &[u8]) -> Self {
        ProcessSignal::ReadyRead {
            stdout: BytesMut::from(stdout),
            stderr: BytesMut::from(stderr),
        }
    }
}

/// The per-process event queue.
///
/// Appending maintains the structural invariant that no two adjacent entries
/// are both `ReadyRead`: a new `ReadyRead` merges into a `ReadyRead` tail.
#[derive(Debug, Default)]
pub(crate) struct SignalQueue {
    items: Vec<ProcessSignal>,
}

impl SignalQueue {
    pub(crate) fn push(&mut self, signal: ProcessSignal) {
        if let ProcessSignal::ReadyRead {
            stdout: ref new_stdout,
            stderr: ref new_stderr,
        } = signal
        {
            if let Some(ProcessSignal::ReadyRead { stdout, stderr }) = self.items.last_mut() {
                stdout.extend_from_slice(new_stdout);
                stderr.extend_from_slice(new_stderr);
                return;
            }
        }
        self.items.push(signal);
    }

    pub(crate) fn contains(&self, kind: SignalKind) -> bool {
        self.items.iter().any(|signal| signal.kind() == kind)
    }

    /// Whether a blocked `wait_for(target)` has something to drain: the
    /// target itself, or a terminal `Error`/`Finished` record.
    pub(crate) fn should_flush_for(&self, target: SignalKind) -> bool {
        self.items.iter().any(|signal| {
            let kind = signal.kind();
            kind == target || kind == SignalKind::Error || kind == SignalKind::Finished
        })
    }

    /// Split off the records a drain for `target` may deliver.
    ///
    /// Everything goes when no target is given, when the target is
    /// `ReadyRead` or `Finished`, or when any `Error` is queued. Otherwise
    /// only the prefix up to the last matching record is taken and the rest
    /// stays queued.
    pub(crate) fn take_for(&mut self, target: Option<SignalKind>) -> Vec<ProcessSignal> {
        let flush_all = target
            .map_or(true, |t| matches!(t, SignalKind::ReadyRead | SignalKind::Finished))
            || self.contains(SignalKind::Error);
        if flush_all {
            return std::mem::take(&mut self.items);
        }

        let target = match target {
            Some(target) => target,
            None => return std::mem::take(&mut self.items),
        };
        let mut last_match = self
            .items
            .iter()
            .rposition(|signal| signal.kind() == target);
        if last_match.is_none() && target == SignalKind::ReadyRead {
            last_match = self
                .items
                .iter()
                .rposition(|signal| signal.kind() == SignalKind::Started);
        }
        match last_match {
            Some(index) => self.items.drain(..=index).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}
