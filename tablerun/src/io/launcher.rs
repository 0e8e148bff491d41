//! Goal executable discovery and launch.
//!
//! A goal named `build` is served by an executable `build_agent` in the goal
//! directory. Launched processes inherit stdio; background launches are not
//! tracked afterwards and serial launches ignore the exit status (outcomes are
//! reported through the store, not the exit code).

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

const GOAL_SUFFIX: &str = "_agent";

/// Fully resolved invocation of one goal executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for GoalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Path of the executable serving `goal`.
pub fn goal_program(goal_dir: &Path, goal: &str) -> PathBuf {
    goal_dir.join(format!("{goal}{GOAL_SUFFIX}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Spawn and move on.
    Background,
    /// Block until the child exits.
    Serial,
}

/// Abstraction over how goal executables are started.
pub trait Launcher {
    /// True when `program` can be launched.
    fn is_available(&self, program: &Path) -> bool;

    fn launch(&self, command: &GoalCommand, mode: LaunchMode) -> Result<()>;
}

/// Launcher that spawns real OS processes.
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn is_available(&self, program: &Path) -> bool {
        program.is_file()
    }

    #[instrument(skip_all, fields(command = %command, ?mode))]
    fn launch(&self, command: &GoalCommand, mode: LaunchMode) -> Result<()> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).stdin(Stdio::null());
        match mode {
            LaunchMode::Background => {
                let child = cmd
                    .spawn()
                    .with_context(|| format!("spawn {}", command.program.display()))?;
                debug!(pid = child.id(), "launched in background");
            }
            LaunchMode::Serial => {
                let status = cmd
                    .status()
                    .with_context(|| format!("run {}", command.program.display()))?;
                debug!(exit_code = ?status.code(), "goal process exited");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_program_uses_agent_suffix() {
        assert_eq!(
            goal_program(Path::new("/opt/goals"), "build"),
            PathBuf::from("/opt/goals/build_agent")
        );
    }

    #[test]
    fn command_renders_for_logs() {
        let command = GoalCommand {
            program: PathBuf::from("/opt/goals/build_agent"),
            args: vec!["7".to_string(), "en".to_string()],
        };
        assert_eq!(command.to_string(), "/opt/goals/build_agent 7 en");
    }

    #[test]
    fn serial_launch_waits_for_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("ran");
        let command = GoalCommand {
            program: PathBuf::from("touch"),
            args: vec![marker.display().to_string()],
        };
        ProcessLauncher
            .launch(&command, LaunchMode::Serial)
            .expect("launch");
        assert!(marker.exists());
    }

    #[test]
    fn missing_program_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!ProcessLauncher.is_available(&temp.path().join("nope_agent")));
        assert!(!ProcessLauncher.is_available(temp.path()));
    }
}
