//! Drive a process handle against a toy in-process helper.
//!
//! The "helper" here is a thread speaking the packet protocol over a
//! socketpair: it pretends to spawn whatever it is asked for, echoes the
//! write-on-start data back as output, and reports a clean exit. Swap the
//! socketpair for `Launcher::listen` plus a real helper binary to launch
//! actual processes.
//!
//! Run with: `cargo run --example feed_child`

use std::io::Write;
use std::time::Duration;

use procmux::{Launcher, LocalStream, ProcessMode};
use procmux_packets::{ExitStatus, Packet, PacketReader, ProcessFinishedPayload};

fn main() -> Result<(), procmux::LaunchError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
        .with_target(false)
        .init();

    let (host, helper) = LocalStream::pair()?;
    let helper_thread = std::thread::spawn(move || toy_helper(helper));

    let launcher = Launcher::attach(host)?;
    let process = launcher
        .register(1, ProcessMode::Reader)
        .expect("token 1 is fresh");

    process.start("rev", vec!["--stdin".into()], "a man a plan".as_bytes().to_vec());
    if process.wait_for_finished(Duration::from_secs(5)) {
        println!(
            "child said: {}",
            String::from_utf8_lossy(&process.read_all_standard_output())
        );
        println!("exit code: {}", process.exit_code());
    } else {
        eprintln!("child failed: {:?} ({})", process.error(), process.error_string());
    }

    drop(process);
    launcher.shutdown();
    helper_thread.join().expect("helper thread");
    Ok(())
}

fn toy_helper(stream: LocalStream) {
    let mut writer = stream.try_clone().expect("clone helper stream");
    let mut reader = PacketReader::new(stream);
    loop {
        let (token, packet) = match reader.read_packet() {
            Ok(message) => message,
            Err(_) => return,
        };
        match packet {
            Packet::StartProcess(payload) => {
                let mut reply = |packet: Packet| {
                    writer
                        .write_all(&packet.encode(token))
                        .expect("helper write");
                };
                reply(Packet::ProcessStarted { process_id: 4711 });
                let echoed: Vec<u8> = payload.write_data.iter().rev().copied().collect();
                reply(Packet::StandardOutput {
                    data: echoed.into(),
                });
                reply(Packet::ProcessFinished(ProcessFinishedPayload {
                    exit_status: ExitStatus::Normal,
                    exit_code: 0,
                    ..Default::default()
                }));
            }
            Packet::Shutdown => return,
            _ => {}
        }
    }
}
