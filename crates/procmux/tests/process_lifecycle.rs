mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{launcher_with_helper, recording_events, EventLog};
use procmux::{ChannelMode, ExitStatus, ProcessError, ProcessMode, ProcessState, SignalKind};
use procmux_packets::{Packet, ProcessFinishedPayload};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn normal_run_delivers_started_output_finished() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(1, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("echo", vec!["hello".into()], Vec::new());

    let (token, payload) = helper.expect_start();
    assert_eq!(token, 1);
    assert_eq!(payload.program, "echo");
    assert_eq!(payload.arguments, vec!["hello".to_string()]);

    helper.send(1, Packet::ProcessStarted { process_id: 4711 });
    helper.send(
        1,
        Packet::StandardOutput {
            data: Bytes::from_static(b"hello\n"),
        },
    );
    helper.send(
        1,
        Packet::ProcessFinished(ProcessFinishedPayload {
            exit_status: ExitStatus::Normal,
            exit_code: 0,
            ..Default::default()
        }),
    );

    assert!(process.wait_for_finished(WAIT));
    assert_eq!(
        log.entries(),
        vec!["started", "stdout", "finished:0:Normal"]
    );
    assert_eq!(process.read_all_standard_output().as_ref(), b"hello\n");
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.process_id(), 4711);
    assert_eq!(process.exit_code(), 0);
    assert_eq!(process.exit_status(), ExitStatus::Normal);
}

#[test]
fn failed_start_reports_error_and_exit_code() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(2, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("/no/such/bin", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();

    helper.send(
        token,
        Packet::ProcessError {
            error: ProcessError::FailedToStart,
            message: "no such file or directory".into(),
        },
    );

    assert!(!process.wait_for_started(WAIT));
    assert_eq!(log.entries(), vec!["error:FailedToStart"]);
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert_eq!(process.error_string(), "no such file or directory");
    assert_eq!(process.exit_code(), 255);
}

#[test]
fn output_bursts_coalesce_into_one_notification() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(3, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("yes", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    helper.send(token, Packet::ProcessStarted { process_id: 1 });
    assert!(process.wait_for_started(WAIT));

    for chunk in [b"a", b"b", b"c"] {
        helper.send(
            token,
            Packet::StandardOutput {
                data: Bytes::copy_from_slice(chunk),
            },
        );
    }
    // Let all three land in the queue before draining.
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(process.poll_events(), vec![SignalKind::ReadyRead]);
    assert_eq!(log.count("stdout"), 1);
    assert_eq!(process.read_all_standard_output().as_ref(), b"abc");
}

#[test]
fn finished_with_error_and_trailing_output_orders_records() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(4, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("crasher", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    helper.send(token, Packet::ProcessStarted { process_id: 7 });
    helper.send(
        token,
        Packet::ProcessFinished(ProcessFinishedPayload {
            message: "crashed".into(),
            stdout: Bytes::from_static(b"last words"),
            stderr: Bytes::from_static(b"oops"),
            exit_status: ExitStatus::Crash,
            error: ProcessError::Crashed,
            exit_code: -1,
        }),
    );

    // The error record terminates the wait.
    assert!(!process.wait_for_finished(WAIT));
    assert_eq!(
        log.entries(),
        vec![
            "started",
            "error:Crashed",
            "stdout",
            "stderr",
            "finished:-1:Crash"
        ]
    );
    assert_eq!(process.read_all_standard_output().as_ref(), b"last words");
    assert_eq!(process.read_all_standard_error().as_ref(), b"oops");
    assert_eq!(process.exit_status(), ExitStatus::Crash);
    assert_eq!(process.exit_code(), -1);
}

#[test]
fn unknown_error_on_finish_is_not_surfaced() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(5, ProcessMode::Reader).unwrap();
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("true", Vec::new(), Vec::new());
    let (token, _payload) = helper.expect_start();
    helper.send(token, Packet::ProcessStarted { process_id: 8 });
    helper.send(
        token,
        Packet::ProcessFinished(ProcessFinishedPayload {
            message: "unknown error".into(),
            exit_status: ExitStatus::Normal,
            error: ProcessError::Unknown,
            exit_code: 0,
            ..Default::default()
        }),
    );

    assert!(process.wait_for_finished(WAIT));
    assert_eq!(log.count("error:Unknown"), 0);
    assert_eq!(log.entries(), vec!["started", "finished:0:Normal"]);
}

#[test]
fn forwarded_channel_bypasses_buffers() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(6, ProcessMode::Reader).unwrap();
    process.set_channel_mode(ChannelMode::Forwarded);
    let log = EventLog::default();
    process.set_event_handlers(recording_events(&log));

    process.start("loud", Vec::new(), Vec::new());
    let (token, payload) = helper.expect_start();
    assert_eq!(payload.channel_mode, ChannelMode::Forwarded);
    helper.send(token, Packet::ProcessStarted { process_id: 9 });
    helper.send(
        token,
        Packet::StandardOutput {
            data: Bytes::from_static(b"to host stdout\n"),
        },
    );
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(process.poll_events(), vec![SignalKind::Started, SignalKind::ReadyRead]);
    assert!(process.read_all_standard_output().is_empty());
    assert_eq!(log.count("stdout"), 0);
}

#[test]
fn write_reaches_helper_when_running() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(7, ProcessMode::Writer).unwrap();

    process.start("cat", Vec::new(), Bytes::from_static(b"seed"));
    let (token, payload) = helper.expect_start();
    assert_eq!(payload.process_mode, ProcessMode::Writer);
    assert_eq!(payload.write_data.as_ref(), b"seed");

    helper.send(token, Packet::ProcessStarted { process_id: 11 });
    assert!(process.wait_for_started(WAIT));

    assert_eq!(process.write(b"more\n"), Some(5));
    match helper.recv() {
        (7, Packet::WriteProcess { data }) => assert_eq!(data.as_ref(), b"more\n"),
        other => panic!("expected WriteProcess, got {other:?}"),
    }
}

#[test]
fn shutdown_sends_final_packet_and_closes() {
    let (launcher, mut helper) = launcher_with_helper();
    let process = launcher.register(8, ProcessMode::Reader).unwrap();
    drop(process);

    launcher.shutdown();
    match helper.recv() {
        (0, Packet::Shutdown) => {}
        other => panic!("expected Shutdown, got {other:?}"),
    }
    helper.expect_closed();
}
