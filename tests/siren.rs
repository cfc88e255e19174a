use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use obake::siren::REMOTE_LISTENER_ADDR;

fn siren() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_siren"));
    cmd.env_remove("SIREN_LOG_LEVEL").stdin(Stdio::null());
    cmd
}

#[test]
fn bogus_level_is_a_parse_error() {
    let out = siren().arg("--log-level=bogus").output().unwrap();
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("bogus"));
    assert!(stderr.contains("--log-level"));
    assert!(!stderr.contains("remote listener"));
}

#[test]
fn bogus_level_from_environment_is_a_parse_error() {
    let out = siren()
        .env("SIREN_LOG_LEVEL", "loud")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn unknown_flag_prints_usage() {
    let out = siren().arg("--port=4006").output().unwrap();
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Usage"));
}

/// Everything touching the fixed port runs in one test so the cases cannot race.
#[test]
fn fixed_port_session_and_occupied_port() {
    // Something else on this machine may own the port; nothing to test then.
    let Ok(holder) = TcpListener::bind(REMOTE_LISTENER_ADDR) else {
        return;
    };

    let out = siren().output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("4005"));
    drop(holder);

    let mut child = siren()
        .env("SIREN_LOG_LEVEL", "debug")
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let stream = loop {
        match TcpStream::connect(REMOTE_LISTENER_ADDR) {
            Ok(stream) => break stream,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
            Err(err) => {
                let _ = child.kill();
                panic!("siren never opened its listener: {err}");
            }
        }
    };

    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    writer.write_all(b"level\nping\nquit\n").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "debug\n");
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "pong\n");

    child.kill().unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(String::from_utf8_lossy(&out.stderr).contains("DEBUG"));
}
