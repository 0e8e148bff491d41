//! Goal field encoding.
//!
//! A goal field is an opaque string tag. Only exact and prefix comparisons are
//! meaningful; nothing here interprets the content as a number or boolean.

use std::fmt;

/// Value written to a flag or goal field to mean "set" / "done".
pub const FLAG_SET: &str = "1";

const RUNNING_PREFIX: &str = "r:";
const FAILED_PREFIX: &str = "F:";

/// Decoded state of one goal field on one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalStatus {
    Unset,
    /// Claimed by the named host.
    Running(String),
    Done,
    /// Work reported failure on the named host.
    Failed(String),
    /// Non-empty content that is none of the known tags (human edits, typos).
    Other(String),
}

impl GoalStatus {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::Unset;
        }
        if raw == FLAG_SET {
            return Self::Done;
        }
        if let Some(host) = raw.strip_prefix(RUNNING_PREFIX) {
            return Self::Running(host.to_string());
        }
        if let Some(host) = raw.strip_prefix(FAILED_PREFIX) {
            return Self::Failed(host.to_string());
        }
        Self::Other(raw.to_string())
    }

    pub fn running(host: &str) -> Self {
        Self::Running(host.to_string())
    }

    pub fn failed(host: &str) -> Self {
        Self::Failed(host.to_string())
    }

    /// Done and Failed are never retried by automated code.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => Ok(()),
            Self::Running(host) => write!(f, "{RUNNING_PREFIX}{host}"),
            Self::Done => f.write_str(FLAG_SET),
            Self::Failed(host) => write!(f, "{FAILED_PREFIX}{host}"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// True when a flag field (`ready`, `complete`, a prerequisite) is set.
pub fn is_flag_set(value: Option<&str>) -> bool {
    value == Some(FLAG_SET)
}
