//! Eligibility checks applied before an agent claims a goal.

use std::fmt;

use crate::core::record::Entry;
use crate::core::status::{GoalStatus, is_flag_set};

/// Column names of the readiness and completion flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagColumns {
    pub ready: String,
    pub complete: String,
}

impl Default for FlagColumns {
    fn default() -> Self {
        Self {
            ready: "ready".to_string(),
            complete: "complete".to_string(),
        }
    }
}

/// Why an agent attempt ended without running the work function.
///
/// Every variant is a successful no-op from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Local admission control refused the attempt.
    Admission(String),
    NotReady,
    AlreadyComplete,
    /// The goal field is already claimed, finished, or holds foreign content.
    GoalTaken(GoalStatus),
    PrerequisiteUnmet(String),
    /// Another writer owns the goal after the settle interval.
    ClaimLost { observed: GoalStatus },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admission(reason) => write!(f, "refused by admission control: {reason}"),
            Self::NotReady => f.write_str("entry not ready"),
            Self::AlreadyComplete => f.write_str("entry already complete"),
            Self::GoalTaken(status) if status.is_terminal() => {
                write!(f, "goal already finished ('{status}')")
            }
            Self::GoalTaken(status) => write!(f, "goal already set to '{status}'"),
            Self::PrerequisiteUnmet(field) => write!(f, "prerequisite '{field}' not met"),
            Self::ClaimLost { observed } => write!(f, "claim lost (goal now '{observed}')"),
        }
    }
}

/// Readiness, terminal-state and prerequisite gates, in that order.
pub fn check_eligibility(
    entry: &Entry,
    goal: &str,
    flags: &FlagColumns,
    prerequisites: &[String],
) -> Result<(), SkipReason> {
    if !is_flag_set(entry.get(&flags.ready)) {
        return Err(SkipReason::NotReady);
    }
    if is_flag_set(entry.get(&flags.complete)) {
        return Err(SkipReason::AlreadyComplete);
    }
    let status = GoalStatus::parse(entry.get(goal).unwrap_or_default());
    if status != GoalStatus::Unset {
        return Err(SkipReason::GoalTaken(status));
    }
    if let Some(unmet) = prerequisites
        .iter()
        .find(|field| !is_flag_set(entry.get(field)))
    {
        return Err(SkipReason::PrerequisiteUnmet(unmet.clone()));
    }
    Ok(())
}
