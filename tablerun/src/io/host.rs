//! Process-wide facts about where we run.
//!
//! These are read once at startup and passed down explicitly so agent and
//! admission logic never consult ambient state.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};

/// Who is claiming: recorded in goal fields and used for self-counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub hostname: String,
    /// Pattern identifying sibling instances in the process table.
    pub program: String,
    pub pid: u32,
}

impl Identity {
    pub fn new(hostname: impl Into<String>, program: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            program: program.into(),
            pid,
        }
    }

    /// Identity of the current process with the given self-count pattern.
    pub fn detect(program: impl Into<String>) -> Result<Self> {
        Ok(Self::new(local_hostname()?, program, std::process::id()))
    }
}

/// Local host name, from the kernel when available, else `hostname(1)`.
pub fn local_hostname() -> Result<String> {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(raw) = fs::read_to_string(path) {
            let name = raw.trim();
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
    }
    let output = Command::new("hostname")
        .output()
        .context("run hostname")?;
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || name.is_empty() {
        return Err(anyhow!("could not determine local hostname"));
    }
    Ok(name)
}

/// `agents/` next to the running executable.
pub fn default_goal_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow!("executable {} has no parent", exe.display()))?;
    Ok(dir.join("agents"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_a_hostname() {
        let identity = Identity::detect("build_agent").expect("identity");
        assert!(!identity.hostname.is_empty());
        assert!(!identity.hostname.contains('\n'));
        assert_eq!(identity.pid, std::process::id());
    }

    #[test]
    fn goal_dir_is_beside_executable() {
        let dir = default_goal_dir().expect("dir");
        assert!(dir.ends_with("agents"));
    }
}
