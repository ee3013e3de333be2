//! 🏭 ProcessWorker: one segment, outsourced to a child process.
//!
//! Same contract as the in-process scanner, different address space. The
//! child is this very binary in `worker` mode. It talks back over its pipes:
//! - every stdout line becomes an `info` event (`WorkerOutput`);
//! - every stderr line becomes an `error` event;
//! - the last stdout line, `segment-report {json}`, carries the tally;
//! - the exit code says whether any of it counts.
//!
//! If the child crashes, only the child crashes. That's the whole pitch.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::Worker;
use crate::coordinator::{ExportJob, SegmentReport};
use crate::errors::ExportError;
use crate::events::{EventSender, ExportEvent};

/// 📜 Prefix of the one stdout line that isn't chatter.
pub const REPORT_PREFIX: &str = "segment-report ";

/// 🧾 How to launch a worker: the program plus whatever goes before `worker`
/// (config path, destination overrides).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// 🧮 Full argument list for one segment of `job`.
    pub fn args_for(&self, job: &ExportJob, segment: u32) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "worker".to_string(),
            job.table.clone(),
            "--segment".to_string(),
            segment.to_string(),
            "--total-segments".to_string(),
            job.total_segments.to_string(),
            "--max-file-size-bytes".to_string(),
            job.max_file_size_bytes.to_string(),
        ]);
        for column in job.columns.iter().flat_map(|columns| columns.iter()) {
            args.push("--columns".to_string());
            args.push(column.clone());
        }
        if job.compress {
            args.push("--compress".to_string());
        }
        args
    }
}

#[derive(Debug)]
pub struct ProcessWorker {
    command: WorkerCommand,
    job: Arc<ExportJob>,
    segment: u32,
    events: EventSender,
}

impl ProcessWorker {
    pub fn new(command: WorkerCommand, job: Arc<ExportJob>, segment: u32, events: EventSender) -> Self {
        Self {
            command,
            job,
            segment,
            events,
        }
    }

    pub async fn run(self) -> Result<SegmentReport, ExportError> {
        let segment = self.segment;
        let args = self.command.args_for(&self.job, segment);
        debug!(
            "🏭 spawning {} {}",
            self.command.program.display(),
            args.join(" ")
        );
        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExportError::WorkerSpawn { segment, source })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(protocol(segment, "worker pipes were not captured"));
        };

        let (report_line, stderr_pumped, status) = tokio::join!(
            pump_stdout(stdout, segment, &self.events),
            pump_stderr(stderr, segment, &self.events),
            child.wait(),
        );

        let status = status.map_err(|err| protocol(segment, format!("could not wait for worker: {err}")))?;
        let report_line = report_line.map_err(|err| protocol(segment, format!("stdout: {err}")))?;
        stderr_pumped.map_err(|err| protocol(segment, format!("stderr: {err}")))?;

        if !status.success() {
            return Err(ExportError::WorkerFailed {
                segment,
                status: status.to_string(),
            });
        }
        let Some(json) = report_line else {
            return Err(protocol(segment, "worker exited without a segment report"));
        };
        let report: SegmentReport = serde_json::from_str(&json)
            .map_err(|err| protocol(segment, format!("unreadable segment report: {err}")))?;
        if report.segment != segment {
            return Err(protocol(
                segment,
                format!("worker reported segment {} instead", report.segment),
            ));
        }
        info!("✅ worker for segment {segment} exited cleanly");
        Ok(report)
    }
}

async fn pump_stdout(
    stdout: impl AsyncRead + Unpin,
    segment: u32,
    events: &EventSender,
) -> std::io::Result<Option<String>> {
    let mut lines = BufReader::new(stdout).lines();
    let mut report = None;
    while let Some(line) = lines.next_line().await? {
        match line.strip_prefix(REPORT_PREFIX) {
            Some(json) => report = Some(json.to_string()),
            None => events.emit(ExportEvent::WorkerOutput { segment, line }),
        }
    }
    Ok(report)
}

async fn pump_stderr(
    stderr: impl AsyncRead + Unpin,
    segment: u32,
    events: &EventSender,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        events.emit(ExportEvent::Error {
            segment: Some(segment),
            message: line,
        });
    }
    Ok(())
}

fn protocol(segment: u32, message: impl Into<String>) -> ExportError {
    ExportError::WorkerProtocol {
        segment,
        message: message.into(),
    }
}

impl Worker for ProcessWorker {
    type Output = SegmentReport;

    fn start(self) -> JoinHandle<Result<SegmentReport, ExportError>> {
        tokio::spawn(self.run())
    }
}
