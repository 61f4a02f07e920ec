//! Stderr capture
//!
//! Drains a child's stderr on a background thread into a shared buffer, so
//! the child never blocks on a full pipe and its diagnostics can be shown
//! when a test fails.

use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct StderrCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StderrCapture {
    /// Start draining `pipe` until it reaches end of stream.
    pub(crate) fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let pump = thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "stderr capture stopped");
                        break;
                    }
                }
            }
        });
        Self {
            buf,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Everything captured so far.
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }

    /// Give the pump up to `timeout` to reach end of stream, reaping it if it
    /// did. A pump still running afterwards is left alone; it ends as soon as
    /// the last writer of the pipe goes away.
    pub(crate) fn settle(&self, timeout: Duration) {
        let mut pump = lock(&self.pump);
        let deadline = Instant::now() + timeout;
        while let Some(handle) = pump.as_ref() {
            if handle.is_finished() {
                if let Some(handle) = pump.take() {
                    let _ = handle.join();
                }
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
