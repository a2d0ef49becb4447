mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{launcher_with_helper, recording_events, EventLog};
use procmux::{Launcher, LocalStream, ProcessError, ProcessMode, ProcessState};
use procmux_packets::{ExitStatus, Packet, PacketError, PacketReader, ProcessFinishedPayload};

const WAIT: Duration = Duration::from_secs(5);

fn scratch_socket(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("procmux-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("launcher.sock")
}

#[test]
fn duplicate_token_registration_is_rejected() {
    let (launcher, _helper) = launcher_with_helper();
    let first = launcher.register(1, ProcessMode::Reader);
    assert!(first.is_some());
    assert!(launcher.register(1, ProcessMode::Reader).is_none());

    drop(first);
    assert!(launcher.register(1, ProcessMode::Reader).is_some());
}

#[test]
fn write_outside_running_sends_nothing() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(2, ProcessMode::Writer).unwrap();

    assert_eq!(process.write(b"ignored"), None);

    // The next packet the helper sees must be the start, not a write.
    process.start("cat", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    assert_eq!(token, 2);
}

#[test]
fn zero_timeout_wait_polls_the_queue() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(3, ProcessMode::Reader).unwrap();

    process.start("sleeper", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();

    // Nothing queued yet: the poll comes back false without blocking.
    assert!(!process.wait_for_started(Duration::ZERO));

    helper.send(token, Packet::ProcessStarted { process_id: 5 });
    // The record is drain-eligible as soon as the launcher thread queues it.
    let mut polled = false;
    for _ in 0..100 {
        if process.wait_for_started(Duration::ZERO) {
            polled = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(polled, "queued Started should satisfy a zero-timeout wait");
    assert_eq!(process.state(), ProcessState::Running);
}

#[test]
fn wait_for_finished_flushes_earlier_signals_and_keeps_waiting() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(4, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("worker", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();

    let waiter = std::thread::spawn(move || process.wait_for_finished(WAIT));

    helper.send(token, Packet::ProcessStarted { process_id: 6 });
    helper.send(
        token,
        Packet::StandardOutput {
            data: Bytes::from_static(b"progress"),
        },
    );
    std::thread::sleep(Duration::from_millis(300));
    helper.send(
        token,
        Packet::ProcessFinished(ProcessFinishedPayload {
            exit_status: ExitStatus::Normal,
            exit_code: 0,
            ..Default::default()
        }),
    );

    assert!(waiter.join().unwrap());
    assert_eq!(
        log.entries(),
        vec!["started", "stdout", "finished:0:Normal"]
    );
}

#[test]
fn wait_for_ready_read_delivers_output() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(5, ProcessMode::Reader).unwrap();

    process.start("chatty", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    helper.send(token, Packet::ProcessStarted { process_id: 12 });
    assert!(process.wait_for_started(WAIT));

    let waiter = std::thread::spawn(move || {
        let got = process.wait_for_ready_read(WAIT);
        (got, process.read_all_standard_output())
    });
    std::thread::sleep(Duration::from_millis(100));
    helper.send(
        token,
        Packet::StandardOutput {
            data: Bytes::from_static(b"line\n"),
        },
    );

    let (got, output) = waiter.join().unwrap();
    assert!(got);
    assert_eq!(output.as_ref(), b"line\n");
}

#[test]
fn cancel_before_socket_ready_discards_deferred_start() {
    let sock_path = scratch_socket("cancel-deferred");
    let launcher = Launcher::listen(&sock_path).unwrap();
    assert!(!launcher.is_ready());

    let process = launcher.register(1, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("never", Vec::new(), Vec::new());
    assert_eq!(process.state(), ProcessState::Starting);

    process.cancel();
    assert_eq!(log.entries(), vec!["error:FailedToStart"]);
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert_eq!(
        process.error_string(),
        "process was canceled before it was started."
    );
    assert_eq!(process.exit_code(), 255);

    // Connect as the helper now: the discarded start must never arrive.
    let stream = LocalStream::connect(&sock_path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut reader = PacketReader::new(stream);
    match reader.read_packet() {
        Err(PacketError::Io(err)) => assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )),
        other => panic!("expected a read timeout, got {other:?}"),
    }
}

#[test]
fn cancel_while_running_drops_late_records() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(6, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("undying", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    helper.send(token, Packet::ProcessStarted { process_id: 20 });
    assert!(process.wait_for_started(WAIT));

    process.cancel();
    assert_eq!(process.state(), ProcessState::NotRunning);
    match helper.recv() {
        (6, Packet::StopProcess) => {}
        other => panic!("expected StopProcess, got {other:?}"),
    }

    // The helper's stop report arrives after the cancel; it must be dropped.
    helper.send(
        token,
        Packet::StandardOutput {
            data: Bytes::from_static(b"late"),
        },
    );
    helper.send(
        token,
        Packet::ProcessFinished(ProcessFinishedPayload {
            message: "stopped".into(),
            exit_status: ExitStatus::Crash,
            error: ProcessError::Crashed,
            exit_code: -1,
            ..Default::default()
        }),
    );
    std::thread::sleep(Duration::from_millis(300));

    assert!(process.poll_events().is_empty());
    assert!(process.read_all_standard_output().is_empty());
    assert_eq!(log.entries(), vec!["started"]);
    assert!(!process.wait_for_finished(Duration::ZERO));
}

#[test]
fn cancel_is_idempotent() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(7, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("short", Vec::new(), Vec::new());
    let (_token, _payload) = helper.expect_start();

    process.cancel();
    process.cancel();
    process.cancel();

    assert_eq!(process.state(), ProcessState::NotRunning);
    // The socket was up, so the cancel went out as a single StopProcess
    // instead of a synthesized error notification.
    assert_eq!(log.count("error:FailedToStart"), 0);
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert_eq!(
        process.error_string(),
        "process was canceled before it was started."
    );
    match helper.recv() {
        (7, Packet::StopProcess) => {}
        other => panic!("expected StopProcess, got {other:?}"),
    }
}

#[test]
fn unregister_severs_delivery() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(8, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("orphan", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();

    launcher.unregister(8);
    helper.send(token, Packet::ProcessStarted { process_id: 31 });
    std::thread::sleep(Duration::from_millis(300));

    assert!(process.poll_events().is_empty());
    assert!(log.entries().is_empty());
}

#[test]
fn socket_loss_mid_run_synthesizes_failed_to_start() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(9, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("victim", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    helper.send(token, Packet::ProcessStarted { process_id: 40 });
    assert!(process.wait_for_started(WAIT));

    // A frame with an undersized length is a fatal decode error.
    helper.send_raw(&3u32.to_le_bytes());

    assert!(!process.wait_for_finished(WAIT));
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert!(process
        .error_string()
        .starts_with("internal socket error:"));
    assert_eq!(log.count("error:FailedToStart"), 1);

    let launcher_error = launcher.last_error().expect("terminal error recorded");
    assert!(launcher_error.contains("invalid packet size"));
    assert!(!launcher.is_ready());
}

#[test]
fn start_after_socket_failure_fails_immediately() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(10, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    helper.send_raw(&1u32.to_le_bytes());
    for _ in 0..100 {
        if launcher.last_error().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    process.poll_events();
    process.start("too-late", Vec::new(), Vec::new());
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert_eq!(log.count("error:FailedToStart"), 2);
}
