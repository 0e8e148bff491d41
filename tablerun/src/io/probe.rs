//! Local process listing for admission control.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::conflict::{ProcessLine, parse_process_table};
use crate::io::process::run_command_with_timeout;

const PS_TIMEOUT: Duration = Duration::from_secs(10);
const PS_OUTPUT_LIMIT_BYTES: usize = 4_000_000;

/// Source of the running-process table.
pub trait ResourceProbe {
    fn process_lines(&self) -> Result<Vec<ProcessLine>>;
}

/// Probe backed by `ps -eo pid=,args=`.
pub struct PsProbe;

impl ResourceProbe for PsProbe {
    fn process_lines(&self) -> Result<Vec<ProcessLine>> {
        let mut cmd = Command::new("ps");
        cmd.args(["-eo", "pid=,args="]);
        let output = run_command_with_timeout(cmd, None, PS_TIMEOUT, PS_OUTPUT_LIMIT_BYTES)
            .context("run ps")?;
        if !output.succeeded() {
            return Err(anyhow!(
                "ps failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!("ps output exceeded {PS_OUTPUT_LIMIT_BYTES} bytes"));
        }
        Ok(parse_process_table(&output.stdout_text()))
    }
}
