//! Test double for the helper binary: speaks the packet protocol over the
//! other end of a socketpair.
#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use procmux::{Launcher, LocalStream};
use procmux_packets::{
    ExitStatus, Packet, PacketError, PacketReader, ProcessError, ProcessFinishedPayload,
    StartProcessPayload,
};

pub struct HelperSide {
    reader: PacketReader<LocalStream>,
    writer: LocalStream,
}

impl HelperSide {
    pub fn send(&mut self, token: u32, packet: Packet) {
        self.writer.write_all(&packet.encode(token)).unwrap();
        self.writer.flush().unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    pub fn recv(&mut self) -> (u32, Packet) {
        self.reader.read_packet().unwrap()
    }

    pub fn expect_start(&mut self) -> (u32, StartProcessPayload) {
        match self.recv() {
            (token, Packet::StartProcess(payload)) => (token, payload),
            other => panic!("expected StartProcess, got {other:?}"),
        }
    }

    pub fn expect_closed(mut self) {
        match self.reader.read_packet() {
            Err(PacketError::ConnectionClosed) => {}
            other => panic!("expected closed connection, got {other:?}"),
        }
    }

}

/// A launcher wired to a scripted helper over a socketpair.
pub fn launcher_with_helper() -> (Launcher, HelperSide) {
    let (host, helper) = LocalStream::pair().unwrap();
    let launcher = Launcher::attach(host).unwrap();
    let reader = PacketReader::new(helper.try_clone().unwrap());
    (
        launcher,
        HelperSide {
            reader,
            writer: helper,
        },
    )
}

/// A helper that answers every start with started → one output chunk per
/// argument → a clean finish. Runs until the socket closes.
pub fn spawn_echo_helper(helper: HelperSide) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let HelperSide {
            mut reader,
            mut writer,
        } = helper;
        let mut next_pid = 1000u32;
        loop {
            let (token, packet) = match reader.read_packet() {
                Ok(message) => message,
                Err(_) => return,
            };
            match packet {
                Packet::StartProcess(payload) => {
                    next_pid += 1;
                    let mut reply = |packet: Packet| {
                        writer.write_all(&packet.encode(token)).unwrap();
                    };
                    reply(Packet::ProcessStarted {
                        process_id: next_pid,
                    });
                    for argument in &payload.arguments {
                        reply(Packet::StandardOutput {
                            data: argument.clone().into_bytes().into(),
                        });
                    }
                    reply(Packet::ProcessFinished(ProcessFinishedPayload {
                        message: String::new(),
                        stdout: Default::default(),
                        stderr: Default::default(),
                        exit_status: ExitStatus::Normal,
                        error: ProcessError::Unknown,
                        exit_code: 0,
                    }));
                    writer.flush().unwrap();
                }
                Packet::Shutdown => return,
                // Stop requests may arrive for tokens that already finished.
                _ => {}
            }
        }
    })
}

/// Collects notification names in arrival order.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|logged| logged.as_str() == entry)
            .count()
    }
}

/// Standard event handlers that record into an [`EventLog`].
pub fn recording_events(log: &EventLog) -> procmux::ProcessEvents {
    let mut events = procmux::ProcessEvents::default();
    let entries = log.clone();
    events.on_started = Some(Arc::new(move || entries.push("started")));
    let entries = log.clone();
    events.on_error_occurred =
        Some(Arc::new(move |error| entries.push(format!("error:{error:?}"))));
    let entries = log.clone();
    events.on_ready_read_stdout = Some(Arc::new(move || entries.push("stdout")));
    let entries = log.clone();
    events.on_ready_read_stderr = Some(Arc::new(move || entries.push("stderr")));
    let entries = log.clone();
    events.on_finished = Some(Arc::new(move |code, status| {
        entries.push(format!("finished:{code}:{status:?}"))
    }));
    events
}
