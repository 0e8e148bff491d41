//! Work function backed by an external command, used by `tablerun claim`.
//!
//! The command receives the claimed entry as a JSON object on stdin. Exit
//! status 0 is success. If stdout holds a JSON object, its members become
//! extra field updates; anything else on stdout is ignored.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agent::WorkOutcome;
use crate::core::record::{Entry, Fields};
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct WorkCommand {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl WorkCommand {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            output_limit_bytes,
        }
    }

    /// Run the command for `entry`. Spawn failures are errors; a non-zero
    /// exit or a timeout is a failed outcome.
    #[instrument(skip_all, fields(program = ?self.argv.first(), row = entry.row()))]
    pub fn run(&self, entry: &Entry) -> Result<WorkOutcome> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("work command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let mut payload = serde_json::to_vec(entry.fields()).context("serialize entry")?;
        payload.push(b'\n');
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run work command {program}"))?;

        let stderr = output.stderr_text();
        if !stderr.trim().is_empty() {
            info!(stderr = %stderr.trim_end(), "work command stderr");
        }
        if output.timed_out {
            warn!(
                timeout_secs = self.timeout.as_secs(),
                "work command timed out"
            );
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "work command failed");
        }

        let mut outcome = if output.succeeded() {
            WorkOutcome::succeeded()
        } else {
            WorkOutcome::failed()
        };
        outcome.updates = parse_updates(&output.stdout_text());
        Ok(outcome)
    }
}

/// Field updates from a work command's stdout.
///
/// Strings are taken verbatim, `null` clears a field and other JSON values are
/// stored in their compact JSON form.
pub fn parse_updates(stdout: &str) -> Fields {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Fields::new();
    }
    let map = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            debug!("work command output is not a JSON object, ignoring");
            return Fields::new();
        }
    };
    map.into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (name, value)
        })
        .collect()
}
