//! Claim protocol for one goal on one entry.
//!
//! An [`Agent`] decides whether to run caller-supplied work exactly once for
//! `(table, entry, goal)` and records the outcome in the goal field. There is
//! no lock: the agent writes `r:<host>`, waits a settle interval, re-reads the
//! field and proceeds only if its own host is still recorded there. Correctness
//! depends on the settle interval being much larger than the store's write
//! propagation delay; under extreme delay zero or (rarely) two agents may
//! believe they won.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::capture;
use crate::conflict::ConflictDetector;
use crate::core::conflict::ConflictLimits;
use crate::core::gate::{FlagColumns, SkipReason, check_eligibility};
use crate::core::keys::{KeyFields, describe_keys};
use crate::core::record::{Entry, Fields, Table};
use crate::core::status::{FLAG_SET, GoalStatus};
use crate::error::{AgentError, ConfigError, StoreError};
use crate::io::clock::Clock;
use crate::io::host::Identity;
use crate::io::notify::{FailureReport, Notifier};
use crate::io::probe::ResourceProbe;
use crate::io::store::RecordStore;

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// What to claim and under which constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub goal: String,
    pub table: String,
    /// Must cover every required key field; optional key fields narrow the lookup.
    pub keys: Fields,
    /// Fields that must read `"1"` before the goal may run.
    pub prerequisites: Vec<String>,
    pub max_selves: Option<usize>,
    pub conflicts_with: BTreeMap<String, usize>,
    /// Fields also set to `"1"` when the work succeeds.
    pub subsumes: Vec<String>,
    /// Stream diagnostics live instead of buffering them for failure reports.
    pub debug: bool,
    pub settle: Duration,
}

impl AgentOptions {
    pub fn new(goal: impl Into<String>, table: impl Into<String>, keys: Fields) -> Self {
        Self {
            goal: goal.into(),
            table: table.into(),
            keys,
            prerequisites: Vec::new(),
            max_selves: None,
            conflicts_with: BTreeMap::new(),
            subsumes: Vec::new(),
            debug: false,
            settle: DEFAULT_SETTLE,
        }
    }
}

/// Collaborators an agent talks to.
#[derive(Clone, Copy)]
pub struct AgentEnv<'a> {
    pub store: &'a dyn RecordStore,
    pub probe: &'a dyn ResourceProbe,
    pub clock: &'a dyn Clock,
    pub notifier: &'a dyn Notifier,
    pub identity: &'a Identity,
}

/// Result reported by the work function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkOutcome {
    pub success: bool,
    /// Extra field updates saved together with the goal status.
    pub updates: Fields,
}

impl WorkOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            updates: Fields::new(),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.updates.insert(name.into(), value.into());
        self
    }
}

/// How an attempt ended when no internal error occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Work ran and reported success; goal marked `"1"`.
    Completed,
    /// Work ran and reported failure; goal marked `"F:<host>"`.
    WorkFailed,
    Skipped(SkipReason),
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::WorkFailed => f.write_str("work failed"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

pub struct Agent<'a> {
    options: AgentOptions,
    flags: FlagColumns,
    detector: ConflictDetector,
    env: AgentEnv<'a>,
}

impl<'a> Agent<'a> {
    pub fn new(
        options: AgentOptions,
        key_fields: &KeyFields,
        flags: FlagColumns,
        env: AgentEnv<'a>,
    ) -> Result<Self, ConfigError> {
        if options.goal.trim().is_empty() {
            return Err(ConfigError::MissingGoal);
        }
        if options.table.trim().is_empty() {
            return Err(ConfigError::MissingTable);
        }
        key_fields.validate_lookup(&options.keys)?;
        let limits = ConflictLimits {
            max_selves: options.max_selves,
            conflicts_with: options.conflicts_with.clone(),
        };
        let detector = ConflictDetector::new(limits, env.identity.pid, &env.identity.program)
            .with_debug(options.debug);
        Ok(Self {
            options,
            flags,
            detector,
            env,
        })
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Run `work` at most once if this agent wins the claim.
    ///
    /// Returns false only when the attempt hit an internal error (store
    /// failure, missing entry, work error). Deliberate skips return true.
    /// Without debug, diagnostics of a failed attempt go to the notifier.
    pub fn process<F>(&self, work: F) -> bool
    where
        F: FnOnce(&Entry) -> Result<WorkOutcome>,
    {
        if self.options.debug {
            return match self.try_process(work) {
                Ok(outcome) => {
                    info!(goal = %self.options.goal, %outcome, "agent attempt finished");
                    true
                }
                Err(err) => {
                    error!(
                        goal = %self.options.goal,
                        err = %format!("{err:#}"),
                        "agent attempt failed"
                    );
                    false
                }
            };
        }

        let (result, diagnostics) = capture(|| {
            let result = self.try_process(work);
            if let Err(err) = &result {
                error!(
                    goal = %self.options.goal,
                    err = %format!("{err:#}"),
                    "agent attempt failed"
                );
            }
            result
        });
        match result {
            Ok(_) => true,
            Err(err) => {
                self.report_failure(&err, diagnostics);
                false
            }
        }
    }

    /// Same protocol as [`Agent::process`] without error capture.
    #[instrument(skip_all, fields(goal = %self.options.goal, table = %self.options.table))]
    pub fn try_process<F>(&self, work: F) -> Result<ProcessOutcome>
    where
        F: FnOnce(&Entry) -> Result<WorkOutcome>,
    {
        let mut table = self.load_table()?;

        if let Some(refusal) = self.detector.check(self.env.probe) {
            info!(%refusal, "admission refused");
            return Ok(ProcessOutcome::Skipped(SkipReason::Admission(
                refusal.to_string(),
            )));
        }

        let row = self.locate(&table)?;
        let entry = entry_at(&table, row)?;
        if let Err(reason) = check_eligibility(
            entry,
            &self.options.goal,
            &self.flags,
            &self.options.prerequisites,
        ) {
            debug!(%reason, "goal not runnable");
            return Ok(ProcessOutcome::Skipped(reason));
        }

        let row = match self.claim(&mut table, row)? {
            Claim::Won(row) => row,
            Claim::Lost(observed) => {
                info!(%observed, "claim lost");
                return Ok(ProcessOutcome::Skipped(SkipReason::ClaimLost { observed }));
            }
        };

        let entry = entry_at(&table, row)?.clone();
        info!(keys = %describe_keys(&self.options.keys), "running work");
        let outcome = work(&entry).context("run work")?;
        self.finalize(&mut table, row, outcome)
    }

    /// Look up the target entry in a fresh copy of the table.
    pub fn entry(&self) -> Result<Option<Entry>> {
        let table = self.load_table()?;
        let row = match self.locate(&table) {
            Ok(row) => row,
            Err(AgentError::EntryNotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(entry_at(&table, row)?.clone()))
    }

    fn load_table(&self) -> Result<Table> {
        let name = &self.options.table;
        self.env
            .store
            .fetch(name)
            .with_context(|| format!("load table {name}"))?
            .ok_or_else(|| AgentError::TableNotFound(name.clone()).into())
    }

    fn locate(&self, table: &Table) -> Result<usize, AgentError> {
        locate_entry(table, &self.options.keys)
    }

    /// Write the claim, settle, reload `table` and check who owns the goal.
    fn claim(&self, table: &mut Table, row: usize) -> Result<Claim> {
        let host = &self.env.identity.hostname;
        let mine = GoalStatus::running(host);
        let entry = entry_at_mut(table, row)?;
        entry.pin(self.options.keys.clone());
        entry.set(&self.options.goal, mine.encode());
        match self.env.store.save(table) {
            Ok(()) => {}
            Err(StoreError::Conflict { detail, .. }) => {
                info!(%detail, "store rejected claim write");
                return Ok(Claim::Lost(GoalStatus::Unset));
            }
            Err(err) => return Err(err).context("save claim"),
        }

        debug!(
            settle_ms = self.options.settle.as_millis() as u64,
            "claim written, settling"
        );
        self.env.clock.sleep(self.options.settle);

        self.env
            .store
            .refresh(table)
            .context("reload table after settling")?;
        let row = match self.locate(table) {
            Ok(row) => row,
            Err(err) => {
                warn!(err = %err, "entry changed while settling");
                return Ok(Claim::Lost(GoalStatus::Unset));
            }
        };
        let observed = GoalStatus::parse(
            entry_at(table, row)?
                .get(&self.options.goal)
                .unwrap_or_default(),
        );
        if observed == mine {
            Ok(Claim::Won(row))
        } else {
            Ok(Claim::Lost(observed))
        }
    }

    fn finalize(
        &self,
        table: &mut Table,
        row: usize,
        outcome: WorkOutcome,
    ) -> Result<ProcessOutcome> {
        let mut updates = Fields::new();
        let result = if outcome.success {
            updates.insert(self.options.goal.clone(), FLAG_SET.to_string());
            for field in &self.options.subsumes {
                updates.insert(field.clone(), FLAG_SET.to_string());
            }
            ProcessOutcome::Completed
        } else {
            updates.insert(
                self.options.goal.clone(),
                GoalStatus::failed(&self.env.identity.hostname).encode(),
            );
            ProcessOutcome::WorkFailed
        };
        updates.extend(outcome.updates);
        self.record(table, row, &updates)?;
        info!(outcome = %result, "goal recorded");
        Ok(result)
    }

    /// Write `updates` onto the claimed entry. If rows moved while the work
    /// ran, reload, find the entry again by its keys and write once more.
    fn record(&self, table: &mut Table, row: usize, updates: &Fields) -> Result<()> {
        let entry = entry_at_mut(table, row)?;
        entry.pin(self.options.keys.clone());
        entry.merge(updates);
        match self.env.store.save(table) {
            Ok(()) => return Ok(()),
            Err(StoreError::Conflict { detail, .. }) => {
                warn!(%detail, "entry moved while working, locating it again");
            }
            Err(err) => return Err(err).context("save goal outcome"),
        }

        self.env
            .store
            .refresh(table)
            .context("reload table before recording outcome")?;
        let row = self.locate(table)?;
        let entry = entry_at_mut(table, row)?;
        entry.pin(self.options.keys.clone());
        entry.merge(updates);
        self.env.store.save(table).context("save goal outcome")
    }

    fn report_failure(&self, err: &anyhow::Error, diagnostics: String) {
        let report = FailureReport {
            subject: format!(
                "tablerun: {} on {} {} failed on {}",
                self.options.goal,
                self.options.table,
                describe_keys(&self.options.keys),
                self.env.identity.hostname
            ),
            body: format!("{err:#}\n\n{diagnostics}"),
        };
        if let Err(notify_err) = self.env.notifier.notify(&report) {
            error!(
                err = %format!("{notify_err:#}"),
                "failed to deliver failure report"
            );
            eprintln!("{}\n{}", report.subject, report.body);
        }
    }
}

enum Claim {
    Won(usize),
    Lost(GoalStatus),
}

/// Row of the unique entry of `table` matching every `(name, value)` in `keys`.
pub fn locate_entry(table: &Table, keys: &Fields) -> Result<usize, AgentError> {
    let positions = table.positions_matching(keys);
    match positions.as_slice() {
        [index] => Ok(table.entries()[*index].row()),
        [] => Err(AgentError::EntryNotFound {
            table: table.name().to_string(),
            keys: describe_keys(keys),
        }),
        many => Err(AgentError::AmbiguousEntry {
            table: table.name().to_string(),
            keys: describe_keys(keys),
            count: many.len(),
        }),
    }
}

fn entry_at(table: &Table, row: usize) -> Result<&Entry> {
    table
        .entry_at_row(row)
        .with_context(|| format!("row {row} missing from table {}", table.name()))
}

fn entry_at_mut(table: &mut Table, row: usize) -> Result<&mut Entry> {
    let name = table.name().to_string();
    table
        .entry_at_row_mut(row)
        .with_context(|| format!("row {row} missing from table {name}"))
}
