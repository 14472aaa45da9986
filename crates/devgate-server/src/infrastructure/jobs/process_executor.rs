//! Runs each job as an external program.
//!
//! The program is started as
//!
//! ```text
//! <program> <configured args...> <job id> <params as JSON>
//! ```
//!
//! and talks back through its standard output, one directive per line:
//!
//! | Line                  | Meaning                                         |
//! |-----------------------|-------------------------------------------------|
//! | `progress:0.42`       | progress report `{"fraction": 0.42}`            |
//! | `progress:{...}`      | progress report with the given JSON object      |
//! | `output:/path/to/file`| result locator for the completion event         |
//!
//! Any other line is logged at debug level.  Exit status zero means
//! success; otherwise the last line written to standard error becomes the
//! job error.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use devgate_core::JobId;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::application::job_coordinator::{JobError, JobExecutor, JobOutput, ProgressSink};

/// One parsed line of job output.
#[derive(Debug, Clone, PartialEq)]
enum Directive {
    Progress(Value),
    Output(String),
    Other,
}

fn parse_line(line: &str) -> Directive {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("progress:") {
        let rest = rest.trim();
        if let Ok(fraction) = rest.parse::<f64>() {
            return Directive::Progress(json!({ "fraction": fraction }));
        }
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(rest) {
            return Directive::Progress(value);
        }
        return Directive::Other;
    }
    match line.strip_prefix("output:").map(str::trim) {
        Some(path) if !path.is_empty() => Directive::Output(path.to_string()),
        _ => Directive::Other,
    }
}

pub struct ProcessJobExecutor {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl ProcessJobExecutor {
    pub fn new(program: Option<PathBuf>, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl JobExecutor for ProcessJobExecutor {
    async fn execute(
        &self,
        job_id: &JobId,
        params: Value,
        progress: ProgressSink,
    ) -> Result<JobOutput, JobError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| JobError::Spawn("no job program configured".to_string()))?;

        let mut child = Command::new(program)
            .args(&self.args)
            .arg(job_id.as_str())
            .arg(params.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| JobError::Spawn(format!("{}: {err}", program.display())))?;
        info!(%job_id, program = %program.display(), "job process started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Spawn("job stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Spawn("job stderr unavailable".to_string()))?;

        let read_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut locator = None;
            let mut seen = 0u64;
            while let Some(line) = lines.next_line().await? {
                seen += 1;
                match parse_line(&line) {
                    Directive::Progress(report) => {
                        progress.report(report);
                    }
                    Directive::Output(path) => locator = Some(path),
                    Directive::Other => debug!(%job_id, %line, "job output"),
                }
            }
            Ok::<_, std::io::Error>((locator, seen))
        };
        let read_stderr = async {
            let mut text = String::new();
            stderr.read_to_string(&mut text).await.map(|_| text)
        };

        let (stdout_result, stderr_result) = tokio::join!(read_stdout, read_stderr);
        let (locator, lines) = stdout_result?;
        let stderr_text = stderr_result?;
        let status = child.wait().await?;

        if status.success() {
            Ok(JobOutput {
                locator,
                summary: json!({ "exit_code": status.code(), "lines": lines }),
            })
        } else {
            let reason = stderr_text
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no error output");
            Err(JobError::Failed(format!("{status}: {reason}")))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
