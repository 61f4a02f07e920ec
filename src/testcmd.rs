//! Test command
//!
//! Runs a child process as an interactive test fixture: values come back as
//! JSON lines on its stdout, lines go to its stdin, and its stderr is kept
//! around for when things go wrong.
//!
//! Failures are reported by panicking, so they fail the running test and
//! cannot be ignored.

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, error, trace, warn};

use crate::decoder::Decoder;
use crate::error::DecodeError;
use crate::stderr::{lock, StderrCapture};

/// How long `close` waits for the child to exit before killing it.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Environment variable overriding the default grace period, in milliseconds.
pub const GRACE_ENV: &str = "TESTCMD_GRACE_MS";

/// How long a failure report waits for stderr output still in flight.
const STDERR_SETTLE: Duration = Duration::from_millis(250);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for a [`TestCommand`]
pub struct TestCommandBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    grace: Option<Duration>,
}

impl TestCommandBuilder {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
            env_clear: false,
            current_dir: None,
            grace: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for the child, on top of the inherited
    /// environment (unless [`env_clear`](Self::env_clear) is used).
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    /// Do not inherit the parent's environment.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Grace period given to the child to exit on `close` before it gets
    /// killed. Defaults to [`DEFAULT_GRACE`], or `$TESTCMD_GRACE_MS`.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    /// Start the child process.
    pub fn try_start(self) -> Result<TestCommand> {
        let label = self.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.env_clear {
            cmd.env_clear();
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start test command {:?}", label))?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("test command {:?} started without stdio pipes", label);
            }
        };

        let pid = child.id();
        let grace = self.grace.unwrap_or_else(grace_from_env);
        debug!(program = %label, pid, ?grace, "started test command");

        Ok(TestCommand {
            label,
            pid,
            grace,
            state: Mutex::new(State::Running(child)),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Decoder::new(stdout)),
            stderr: StderrCapture::spawn(stderr),
        })
    }

    /// Start the child process, panicking if it cannot be started.
    pub fn start(self) -> TestCommand {
        match self.try_start() {
            Ok(cmd) => cmd,
            Err(err) => panic!("TestCommand.Start panicked: {:#}", err),
        }
    }
}

fn grace_from_env() -> Duration {
    match std::env::var(GRACE_ENV) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(value = %value, "ignoring unparsable {}", GRACE_ENV);
                DEFAULT_GRACE
            }
        },
        Err(_) => DEFAULT_GRACE,
    }
}

enum State {
    Running(Child),
    Closed(Option<ExitStatus>),
}

/// A child process used as a test fixture.
///
/// Scripts are expected to print one JSON value per line and to block on a
/// line read from stdin whenever they wait for the test to
/// [`proceed`](TestCommand::proceed). Dropping a `TestCommand` closes it.
pub struct TestCommand {
    label: String,
    pid: u32,
    grace: Duration,
    state: Mutex<State>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Decoder<ChildStdout>>,
    stderr: StderrCapture,
}

impl TestCommand {
    /// Start `program` with `args`, inheriting the environment. Panics if the
    /// program cannot be started.
    pub fn new<I, S>(program: impl AsRef<OsStr>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        TestCommandBuilder::new(program).args(args).start()
    }

    pub fn builder(program: impl AsRef<OsStr>) -> TestCommandBuilder {
        TestCommandBuilder::new(program)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        matches!(*lock(&self.state), State::Closed(_))
    }

    /// Exit status reaped by [`close`](Self::close), if any.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *lock(&self.state) {
            State::Closed(status) => status,
            State::Running(_) => None,
        }
    }

    /// Stderr output captured so far.
    pub fn stderr(&self) -> String {
        self.stderr.contents()
    }

    /// Decode the next JSON value written by the child, returning the error
    /// instead of panicking.
    pub fn try_decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        self.ensure_open("Decode");
        lock(&self.stdout).decode()
    }

    /// Decode the next JSON value written by the child.
    ///
    /// Panics on failure, with the offending input and the child's stderr.
    pub fn decode<T: DeserializeOwned>(&self) -> T {
        match self.try_decode() {
            Ok(value) => value,
            Err(err) => {
                self.stderr.settle(STDERR_SETTLE);
                panic!(
                    "TestCommand.Decode panicked: {}\nchild process stderr:\n{}",
                    err,
                    self.stderr.contents()
                );
            }
        }
    }

    /// Send `line` to the child's stdin.
    pub fn tell(&self, line: &str) {
        self.ensure_open("Tell");
        if let Err(err) = self.write_line(line) {
            panic!("TestCommand.Tell panicked: {:#}", err);
        }
    }

    /// Send the empty line a waiting script takes as its cue to continue.
    pub fn proceed(&self) {
        self.ensure_open("Proceed");
        if let Err(err) = self.write_line("") {
            panic!("TestCommand.Proceed panicked: {:#}", err);
        }
    }

    /// Shut the child down: signal it to proceed, close its stdin, and give it
    /// the grace period to exit before killing it. Closing an already closed
    /// command does nothing.
    pub fn close(&self) {
        if let Err(err) = self.shutdown() {
            panic!("TestCommand.Close panicked: {:#}", err);
        }
    }

    fn ensure_open(&self, op: &str) {
        if self.is_closed() {
            panic!("TestCommand.{} called on closed test command {:?}", op, self.label);
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = lock(&self.stdin);
        let pipe = stdin.as_mut().context("stdin of test command is already closed")?;
        trace!(pid = self.pid, line, "writing to test command");
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        data.push('\n');
        pipe.write_all(data.as_bytes())
            .and_then(|()| pipe.flush())
            .context("writing to test command stdin")
    }

    fn shutdown(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let State::Running(child) = &mut *state else {
            return Ok(());
        };
        debug!(pid = self.pid, "closing test command");

        // The child might have exited already, or not be reading at all.
        if let Some(mut pipe) = lock(&self.stdin).take() {
            let _ = pipe.write_all(b"\n").and_then(|()| pipe.flush());
        }

        let status = match wait_timeout(child, self.grace).context("waiting for test command to exit")? {
            Some(status) => status,
            None => {
                warn!(pid = self.pid, grace = ?self.grace, "test command did not exit in time, killing it");
                child.kill().context("killing test command")?;
                child.wait().context("reaping killed test command")?
            }
        };
        debug!(pid = self.pid, %status, "test command exited");
        *state = State::Closed(Some(status));
        drop(state);

        self.stderr.settle(STDERR_SETTLE);
        Ok(())
    }
}

impl Drop for TestCommand {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(pid = self.pid, error = ?err, "failed to shut down test command");
        }
    }
}

/// Wait for `child` to exit, giving up after `timeout`.
fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
