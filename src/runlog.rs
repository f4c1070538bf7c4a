//! Per-run log sink.
//!
//! Output of every action taken for a run is appended to that run's own log
//! file with a stable `[action]` prefix. The sink is opened inside the
//! per-run loop and flushed when it goes out of scope; sharing one sink
//! across runs would interleave unrelated runs into one file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::external::CommandOutput;

pub struct RunLog {
    file: File,
}

impl RunLog {
    /// Open (appending) the log for one run, creating parents as needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(RunLog { file })
    }

    /// Append one prefixed line, stamped with the wall clock.
    pub fn line(&mut self, action: &str, text: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        // A failed log write must not take the tick down with it.
        let _ = writeln!(self.file, "{stamp} [{action}] {text}");
    }

    /// Append the captured output of an external command, line by line.
    pub fn command_output(&mut self, action: &str, output: &CommandOutput) {
        for line in output.stdout.lines() {
            self.line(action, line);
        }
        for line in output.stderr.lines() {
            self.line(action, &format!("stderr: {line}"));
        }
        self.line(action, &format!("exit status {}", output.status_code));
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        self.flush();
    }
}
