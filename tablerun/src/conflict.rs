//! Node-local admission control: refuse a claim attempt when too many
//! siblings or named conflicting processes are already running here.

use tracing::warn;

use crate::core::conflict::{ConflictLimits, Refusal, evaluate};
use crate::io::probe::ResourceProbe;

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    limits: ConflictLimits,
    own_pid: u32,
    program: String,
    debug: bool,
}

impl ConflictDetector {
    pub fn new(limits: ConflictLimits, own_pid: u32, program: impl Into<String>) -> Self {
        Self {
            limits,
            own_pid,
            program: program.into(),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// `Some` when the attempt must not proceed. Fails closed: an unreadable
    /// process table is a refusal.
    pub fn check(&self, probe: &dyn ResourceProbe) -> Option<Refusal> {
        if self.limits.is_empty() {
            return None;
        }
        let lines = match probe.process_lines() {
            Ok(lines) => lines,
            Err(err) => {
                if self.debug {
                    warn!(err = %format!("{err:#}"), "process table unavailable");
                }
                return Some(Refusal::ProbeUnavailable(format!("{err:#}")));
            }
        };
        evaluate(&lines, self.own_pid, &self.program, &self.limits)
    }
}
