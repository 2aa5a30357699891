use std::{
    io::Write,
    sync::{Arc, Mutex},
};

/// Where captured stdout/stderr of an execution is replayed.
pub trait ConsoleSink: Send + Sync {
    fn stdout(&self, text: &str);
    fn stderr(&self, text: &str);
}

/// The process's own streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdConsole;

impl ConsoleSink for StdConsole {
    fn stdout(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(err) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            tracing::debug!(event = "udf.dispatch.replay_failed", stream = "stdout", error = %err);
        }
    }

    fn stderr(&self, text: &str) {
        let mut err_stream = std::io::stderr().lock();
        if let Err(err) = err_stream.write_all(text.as_bytes()) {
            tracing::debug!(event = "udf.dispatch.replay_failed", stream = "stderr", error = %err);
        }
    }
}

/// Keeps everything replayed into it.
#[derive(Debug, Clone, Default)]
pub struct CapturedConsole {
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
}

impl CapturedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl ConsoleSink for CapturedConsole {
    fn stdout(&self, text: &str) {
        if let Ok(mut buf) = self.stdout.lock() {
            buf.push_str(text);
        }
    }

    fn stderr(&self, text: &str) {
        if let Ok(mut buf) = self.stderr.lock() {
            buf.push_str(text);
        }
    }
}
