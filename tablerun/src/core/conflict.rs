//! Process-table counting for node-local admission control.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Interactive editors and pagers whose command lines often mention a program
/// name without running it.
static EDITOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\S*/)?(?:vi|vim|nvim|view|emacs|nano|pico|less|more)(?:\s|$)")
        .expect("editor pattern is valid")
});

/// One running process as reported by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLine {
    pub pid: u32,
    pub command: String,
}

/// Parse `<pid> <command...>` lines; lines without a numeric pid are dropped.
pub fn parse_process_table(raw: &str) -> Vec<ProcessLine> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessLine {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// Instance caps checked before a claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictLimits {
    /// Refuse when this many other instances of the own program are running.
    pub max_selves: Option<usize>,
    /// Refuse when a named process reaches its count.
    pub conflicts_with: BTreeMap<String, usize>,
}

impl ConflictLimits {
    pub fn is_empty(&self) -> bool {
        self.max_selves.is_none() && self.conflicts_with.is_empty()
    }
}

/// Why admission control refused an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    SelfLimit { count: usize, max: usize },
    Conflict { name: String, count: usize, max: usize },
    /// The process table could not be read; refusing is the safe default.
    ProbeUnavailable(String),
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfLimit { count, max } => {
                write!(f, "{count} instances of self running (max {max})")
            }
            Self::Conflict { name, count, max } => {
                write!(f, "{count} instances of '{name}' running (max {max})")
            }
            Self::ProbeUnavailable(cause) => write!(f, "process table unavailable: {cause}"),
        }
    }
}

/// Count matching processes and decide whether to refuse.
///
/// Editor lines and the caller's own pid are ignored before counting.
pub fn evaluate(
    lines: &[ProcessLine],
    own_pid: u32,
    program: &str,
    limits: &ConflictLimits,
) -> Option<Refusal> {
    let candidates: Vec<&ProcessLine> = lines
        .iter()
        .filter(|line| line.pid != own_pid && !EDITOR.is_match(&line.command))
        .collect();
    let count = |pattern: &str| {
        candidates
            .iter()
            .filter(|line| line.command.contains(pattern))
            .count()
    };

    if let Some(max) = limits.max_selves {
        let running = count(program);
        if running >= max {
            return Some(Refusal::SelfLimit {
                count: running,
                max,
            });
        }
    }
    for (name, max) in &limits.conflicts_with {
        let running = count(name);
        if running >= *max {
            return Some(Refusal::Conflict {
                name: name.clone(),
                count: running,
                max: *max,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(raw: &str) -> Vec<ProcessLine> {
        parse_process_table(raw)
    }

    #[test]
    fn parses_pid_and_command() {
        let lines = table("  12 /usr/bin/build_agent 7 en\nPID CMD\n  40 sleep 5\n");
        assert_eq!(
            lines,
            vec![
                ProcessLine {
                    pid: 12,
                    command: "/usr/bin/build_agent 7 en".to_string()
                },
                ProcessLine {
                    pid: 40,
                    command: "sleep 5".to_string()
                },
            ]
        );
    }

    #[test]
    fn no_limits_never_refuses() {
        let lines = table("1 build_agent\n2 build_agent\n");
        assert_eq!(
            evaluate(&lines, 99, "build_agent", &ConflictLimits::default()),
            None
        );
    }

    #[test]
    fn self_limit_ignores_own_pid_and_editors() {
        let lines = table(concat!(
            "10 build_agent 1\n",
            "11 build_agent 2\n",
            "12 vim build_agent\n",
            "13 /usr/bin/less build_agent.log\n",
            "99 build_agent 3\n",
        ));
        let limits = ConflictLimits {
            max_selves: Some(3),
            ..ConflictLimits::default()
        };
        assert_eq!(evaluate(&lines, 99, "build_agent", &limits), None);

        let limits = ConflictLimits {
            max_selves: Some(2),
            ..ConflictLimits::default()
        };
        assert_eq!(
            evaluate(&lines, 99, "build_agent", &limits),
            Some(Refusal::SelfLimit { count: 2, max: 2 })
        );
    }

    #[test]
    fn conflicts_refuse_at_the_configured_count() {
        let limits = ConflictLimits {
            conflicts_with: BTreeMap::from([("otherproc".to_string(), 2)]),
            ..ConflictLimits::default()
        };
        let two = table("1 otherproc a\n2 otherproc b\n");
        assert_eq!(
            evaluate(&two, 99, "me", &limits),
            Some(Refusal::Conflict {
                name: "otherproc".to_string(),
                count: 2,
                max: 2
            })
        );
        let one = table("1 otherproc a\n");
        assert_eq!(evaluate(&one, 99, "me", &limits), None);
    }

    #[test]
    fn editor_pattern_matches_program_token_only() {
        assert!(EDITOR.is_match("vim notes.txt"));
        assert!(EDITOR.is_match("/usr/bin/nvim"));
        assert!(!EDITOR.is_match("vimdiff_agent"));
        assert!(!EDITOR.is_match("build_agent --less"));
    }
}
