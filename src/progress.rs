//! Batch task progress reporting.
//!
//! Used by `storytrim batch --wait` to show how far a full-book trim has
//! come while the CLI polls the task. Progress goes to **stderr** so stdout
//! stays parseable for scripts.

use std::io::Write;

/// A single progress event for a batch task.
#[derive(Clone, Debug)]
pub enum BatchProgressEvent {
    /// Task accepted, not yet picked up by a worker.
    Queued { task_id: String },
    /// Task running: `done` of `total` chapters finished.
    Running {
        task_id: String,
        progress: i64,
        done: u64,
        total: u64,
    },
    /// Terminal state reached.
    Finished {
        task_id: String,
        status: String,
        failed: u64,
        total: u64,
    },
}

pub trait BatchProgressReporter: Send + Sync {
    fn report(&self, event: BatchProgressEvent);
}

/// Human-friendly progress on stderr: "task 1a2b…  running  42%  1,234 / 2,900 chapters".
pub struct StderrProgress;

impl BatchProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Queued { task_id } => format!("task {}  queued\n", task_id),
            BatchProgressEvent::Running {
                task_id,
                progress,
                done,
                total,
            } => format!(
                "task {}  running  {}%  {} / {} chapters\n",
                task_id,
                progress,
                format_number(*done),
                format_number(*total)
            ),
            BatchProgressEvent::Finished {
                task_id,
                status,
                failed,
                total,
            } => format!(
                "task {}  {}  {} of {} chapters failed\n",
                task_id,
                status,
                format_number(*failed),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BatchProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        let obj = match &event {
            BatchProgressEvent::Queued { task_id } => serde_json::json!({
                "event": "progress",
                "task_id": task_id,
                "phase": "queued"
            }),
            BatchProgressEvent::Running {
                task_id,
                progress,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "task_id": task_id,
                "phase": "running",
                "progress": progress,
                "done": done,
                "total": total
            }),
            BatchProgressEvent::Finished {
                task_id,
                status,
                failed,
                total,
            } => serde_json::json!({
                "event": "finished",
                "task_id": task_id,
                "status": status,
                "failed": failed,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl BatchProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BatchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
