//! Integration tests: drive real child processes through `TestCommand`
//!
//! Scripts run under `/bin/sh`, so these tests are unix only.

#![cfg(unix)]

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use emx_testcmd::{DecodeErrorKind, TestCommand};
use regex::Regex;
use serde::Deserialize;

fn sh(script: &str) -> TestCommand {
    TestCommand::new("/bin/sh", ["-c", script])
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        String::new()
    }
}

fn expect_panic<T>(f: impl FnOnce() -> T) -> String {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("expected a panic"),
        Err(payload) => panic_message(payload),
    }
}

#[test]
fn test_fails_to_start_missing_program() {
    let msg = expect_panic(|| TestCommand::new("", Vec::<&str>::new()));
    assert!(msg.starts_with("TestCommand.Start panicked: failed to start test command"), "{}", msg);

    let err = TestCommand::builder("/nonexistent/program").try_start().err().unwrap();
    assert!(format!("{:#}", err).contains("/nonexistent/program"));
}

#[test]
fn test_runs_a_test_command() {
    let cmd = sh(r#"echo '"go-kay"' && read _"#);
    let s: String = cmd.decode();
    assert_eq!(s, "go-kay");
    cmd.close();
    assert!(cmd.is_closed());
    assert!(cmd.exit_status().unwrap().success());

    // second close is a no-op
    cmd.close();
    assert!(cmd.exit_status().unwrap().success());
}

#[test]
fn test_terminates_a_blocking_command() {
    let cmd = Arc::new(
        TestCommand::builder("/bin/sleep")
            .arg("10000001")
            .grace(Duration::from_millis(200))
            .start(),
    );
    let (done_tx, done_rx) = mpsc::channel();
    let closer = Arc::clone(&cmd);
    thread::spawn(move || {
        closer.close();
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("test command close() not reacting within time limit");
    assert!(cmd.is_closed());
    assert!(!cmd.exit_status().unwrap().success());
}

#[test]
fn test_terminates_script_ignoring_proceed() {
    let cmd = TestCommand::builder("/bin/sh")
        .args(["-c", "echo 42; exec sleep 10000002"])
        .grace(Duration::from_millis(200))
        .start();
    assert_eq!(cmd.decode::<i32>(), 42);

    let started = Instant::now();
    cmd.close();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!cmd.exit_status().unwrap().success());
}

#[test]
fn test_panics_on_undecodable_output_with_stderr() {
    let cmd = sh(r#"echo 'something broke' >&2; echo '"foo'"#);
    let msg = expect_panic(|| cmd.decode::<String>());
    let re = Regex::new(
        "(?s)^TestCommand\\.Decode panicked: control character .* at line 2 column 0\nwhile reading:\n\t\"foo►\n◄\nchild process stderr:\n.*something broke",
    )
    .unwrap();
    assert!(re.is_match(&msg), "{}", msg);
}

#[test]
fn test_try_decode_reports_end_of_stream() {
    let cmd = sh("echo 1");
    assert_eq!(cmd.try_decode::<i32>().unwrap(), 1);
    let err = cmd.try_decode::<i32>().unwrap_err();
    assert_eq!(err.kind(), DecodeErrorKind::Eof);
    cmd.close();
}

#[test]
fn test_tells_lines_to_script() {
    let cmd = sh(r#"read line; echo "\"got $line\""; read _"#);
    cmd.tell("hello");
    assert_eq!(cmd.decode::<String>(), "got hello");
    cmd.close();
    assert!(cmd.exit_status().unwrap().success());
}

#[test]
fn test_proceeds_through_phases() {
    let cmd = sh("echo 1; read _; echo 2; read _; echo 3");
    assert_eq!(cmd.decode::<i32>(), 1);
    cmd.proceed();
    assert_eq!(cmd.decode::<i32>(), 2);
    cmd.proceed();
    assert_eq!(cmd.decode::<i32>(), 3);
    cmd.close();
    assert!(cmd.exit_status().unwrap().success());
}

#[test]
fn test_decodes_structured_values() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Report {
        name: String,
        count: u32,
        tags: Vec<String>,
    }

    let cmd = sh(r#"echo '{"name": "sampler", "count": 3, "tags": ["a", "b"]}'; read _"#);
    let report: Report = cmd.decode();
    assert_eq!(
        report,
        Report {
            name: "sampler".into(),
            count: 3,
            tags: vec!["a".into(), "b".into()],
        }
    );
}

#[test]
fn test_operations_after_close_panic() {
    let cmd = sh("read _");
    cmd.close();

    let msg = expect_panic(|| cmd.decode::<i32>());
    assert!(msg.contains("TestCommand.Decode called on closed test command"), "{}", msg);
    let msg = expect_panic(|| cmd.tell("late"));
    assert!(msg.contains("TestCommand.Tell called on closed test command"), "{}", msg);
    let msg = expect_panic(|| cmd.proceed());
    assert!(msg.contains("TestCommand.Proceed called on closed test command"), "{}", msg);
}

#[test]
fn test_concurrent_close() {
    let cmd = Arc::new(
        TestCommand::builder("/bin/sleep")
            .arg("10000003")
            .grace(Duration::from_millis(100))
            .start(),
    );
    let closers: Vec<_> = (0..2)
        .map(|_| {
            let cmd = Arc::clone(&cmd);
            thread::spawn(move || cmd.close())
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }
    assert!(cmd.is_closed());
    cmd.close();
}

#[test]
fn test_drop_reaps_child() {
    let cmd = TestCommand::builder("/bin/sleep")
        .arg("10000004")
        .grace(Duration::from_millis(100))
        .start();
    let pid = cmd.pid().to_string();
    drop(cmd);

    let alive = Command::new("kill")
        .args(["-0", &pid])
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!alive.success(), "child {} still around after drop", pid);
}

#[test]
fn test_stderr_is_captured() {
    let cmd = sh("echo 'warming up' >&2; echo 1; read _");
    assert_eq!(cmd.decode::<i32>(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !cmd.stderr().contains("warming up") && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(cmd.stderr(), "warming up\n");
}

#[test]
fn test_runs_script_file_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.sh");
    std::fs::write(&script, "echo \"\\\"$1\\\"\" && echo \"\\\"$script\\\"\" && read _\n").unwrap();

    let cmd = TestCommand::builder("/bin/sh")
        .arg(&script)
        .arg("foo")
        .env("script", &script)
        .current_dir(dir.path())
        .start();
    assert_eq!(cmd.decode::<String>(), "foo");
    assert_eq!(cmd.decode::<String>(), script.to_string_lossy());
    cmd.close();
}
