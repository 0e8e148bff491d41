//! Test-only fakes and fixtures for agents, runners and stores.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::agent::{Agent, AgentEnv, AgentOptions};
use crate::core::conflict::ProcessLine;
use crate::core::gate::FlagColumns;
use crate::core::keys::{KeyFieldConfig, KeyFields};
use crate::core::record::{Fields, Table};
use crate::error::{ConfigError, StoreError};
use crate::io::clock::Clock;
use crate::io::host::Identity;
use crate::io::json_store::JsonDirStore;
use crate::io::launcher::{GoalCommand, LaunchMode, Launcher};
use crate::io::notify::{FailureReport, Notifier};
use crate::io::probe::ResourceProbe;
use crate::io::store::{MemoryStore, RecordStore};

/// Build a field map from literal pairs.
pub fn row(pairs: &[(&str, &str)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Key fields where `required` come first, then `optional`, ranked in order.
pub fn key_fields(required: &[&str], optional: &[&str]) -> KeyFields {
    let mut config = BTreeMap::new();
    for (rank, name) in required.iter().chain(optional).enumerate() {
        config.insert(
            name.to_string(),
            KeyFieldConfig {
                required: rank < required.len(),
                rank: rank as i64,
            },
        );
    }
    KeyFields::new(&config).expect("test key fields need a required field")
}

/// Empty file-backed store in a fresh temporary directory.
pub fn temp_json_store() -> (tempfile::TempDir, JsonDirStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = JsonDirStore::new(temp.path());
    (temp, store)
}

/// Process table with fixed content, or a fixed failure.
pub struct FakeProbe {
    result: std::result::Result<Vec<ProcessLine>, String>,
}

impl FakeProbe {
    pub fn empty() -> Self {
        Self { result: Ok(Vec::new()) }
    }

    /// One line per command, with pids starting at 1000.
    pub fn with_commands(commands: &[&str]) -> Self {
        let lines = commands
            .iter()
            .enumerate()
            .map(|(i, command)| ProcessLine {
                pid: 1000 + i as u32,
                command: command.to_string(),
            })
            .collect();
        Self { result: Ok(lines) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

impl ResourceProbe for FakeProbe {
    fn process_lines(&self) -> Result<Vec<ProcessLine>> {
        self.result.clone().map_err(|message| anyhow!(message))
    }
}

/// Records requested sleeps without waiting.
#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("clock lock").clone()
    }
}

impl Clock for RecordingClock {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("clock lock").push(duration);
    }
}

/// Runs a hook instead of sleeping, e.g. to let a racing writer act during
/// the settle interval.
pub struct HookClock<F: Fn(Duration)> {
    hook: F,
}

impl<F: Fn(Duration)> HookClock<F> {
    pub fn new(hook: F) -> Self {
        Self { hook }
    }
}

impl<F: Fn(Duration)> Clock for HookClock<F> {
    fn sleep(&self, duration: Duration) {
        (self.hook)(duration);
    }
}

/// Every sleeper blocks until all participants have arrived.
pub struct BarrierClock {
    barrier: Barrier,
}

impl BarrierClock {
    pub fn new(participants: usize) -> Self {
        Self {
            barrier: Barrier::new(participants),
        }
    }
}

impl Clock for BarrierClock {
    fn sleep(&self, _duration: Duration) {
        self.barrier.wait();
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingNotifier {
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().expect("notifier lock").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, report: &FailureReport) -> Result<()> {
        self.reports
            .lock()
            .expect("notifier lock")
            .push(report.clone());
        Ok(())
    }
}

/// Launcher that records launches of a fixed set of "installed" programs.
#[derive(Default)]
pub struct RecordingLauncher {
    installed: BTreeSet<PathBuf>,
    launched: Mutex<Vec<(GoalCommand, LaunchMode)>>,
}

impl RecordingLauncher {
    pub fn with_programs(programs: &[PathBuf]) -> Self {
        Self {
            installed: programs.iter().cloned().collect(),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn launched(&self) -> Vec<(GoalCommand, LaunchMode)> {
        self.launched.lock().expect("launcher lock").clone()
    }
}

impl Launcher for RecordingLauncher {
    fn is_available(&self, program: &Path) -> bool {
        self.installed.contains(program)
    }

    fn launch(&self, command: &GoalCommand, mode: LaunchMode) -> Result<()> {
        self.launched
            .lock()
            .expect("launcher lock")
            .push((command.clone(), mode));
        Ok(())
    }
}

/// Store whose first fetch on each thread blocks until every participant has
/// fetched, so all claimants start from the same snapshot.
pub struct LockstepStore {
    inner: MemoryStore,
    barrier: Barrier,
    started: Mutex<HashSet<ThreadId>>,
}

impl LockstepStore {
    pub fn new(inner: MemoryStore, participants: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(participants),
            started: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl RecordStore for LockstepStore {
    fn table_names(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.inner.table_names()
    }

    fn fetch(&self, table: &str) -> std::result::Result<Option<Table>, StoreError> {
        let fetched = self.inner.fetch(table)?;
        let first = self
            .started
            .lock()
            .expect("lockstep lock")
            .insert(thread::current().id());
        if first {
            self.barrier.wait();
        }
        Ok(fetched)
    }

    fn save(&self, table: &mut Table) -> std::result::Result<(), StoreError> {
        self.inner.save(table)
    }

    fn create_table(
        &self,
        table: &str,
        columns: &[String],
    ) -> std::result::Result<Table, StoreError> {
        self.inner.create_table(table, columns)
    }
}

/// Store where a save becomes visible to fetches only after `lag` of
/// simulated time. Time advances through the paired [`SimClock`].
pub struct LaggedStore {
    inner: MemoryStore,
    lag: Duration,
    now: Arc<Mutex<Duration>>,
    in_flight: Mutex<Vec<(Duration, Table)>>,
}

impl LaggedStore {
    pub fn new(inner: MemoryStore, lag: Duration) -> Self {
        Self {
            inner,
            lag,
            now: Arc::new(Mutex::new(Duration::ZERO)),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn clock(&self) -> SimClock {
        SimClock {
            now: Arc::clone(&self.now),
        }
    }

    fn publish_due(&self) -> std::result::Result<(), StoreError> {
        let now = *self.now.lock().expect("sim time lock");
        let mut in_flight = self.in_flight.lock().expect("lagged lock");
        let (due, waiting): (Vec<_>, Vec<_>) = in_flight
            .drain(..)
            .partition(|(visible_at, _)| *visible_at <= now);
        *in_flight = waiting;
        for (_, mut table) in due {
            self.inner.save(&mut table)?;
        }
        Ok(())
    }
}

impl RecordStore for LaggedStore {
    fn table_names(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.inner.table_names()
    }

    fn fetch(&self, table: &str) -> std::result::Result<Option<Table>, StoreError> {
        self.publish_due()?;
        self.inner.fetch(table)
    }

    fn save(&self, table: &mut Table) -> std::result::Result<(), StoreError> {
        let visible_at = *self.now.lock().expect("sim time lock") + self.lag;
        self.in_flight
            .lock()
            .expect("lagged lock")
            .push((visible_at, table.clone()));
        table.mark_clean();
        Ok(())
    }

    fn create_table(
        &self,
        table: &str,
        columns: &[String],
    ) -> std::result::Result<Table, StoreError> {
        self.inner.create_table(table, columns)
    }
}

/// Simulated time shared with a [`LaggedStore`]; sleeping advances it.
pub struct SimClock {
    now: Arc<Mutex<Duration>>,
}

impl Clock for SimClock {
    fn sleep(&self, duration: Duration) {
        *self.now.lock().expect("sim time lock") += duration;
    }
}

/// Store that fails every save with a conflict.
pub struct ConflictingStore {
    pub inner: MemoryStore,
}

impl RecordStore for ConflictingStore {
    fn table_names(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.inner.table_names()
    }

    fn fetch(&self, table: &str) -> std::result::Result<Option<Table>, StoreError> {
        self.inner.fetch(table)
    }

    fn save(&self, table: &mut Table) -> std::result::Result<(), StoreError> {
        Err(StoreError::conflict(table.name(), "revision changed"))
    }

    fn create_table(
        &self,
        table: &str,
        columns: &[String],
    ) -> std::result::Result<Table, StoreError> {
        self.inner.create_table(table, columns)
    }
}

/// Everything an agent needs, backed by in-memory fakes.
pub struct AgentHarness {
    pub store: MemoryStore,
    pub probe: FakeProbe,
    pub clock: RecordingClock,
    pub notifier: RecordingNotifier,
    pub identity: Identity,
    pub key_fields: KeyFields,
}

impl AgentHarness {
    /// Harness keyed by a single required `id` field.
    pub fn new(hostname: &str) -> Self {
        Self {
            store: MemoryStore::new(),
            probe: FakeProbe::empty(),
            clock: RecordingClock::default(),
            notifier: RecordingNotifier::default(),
            identity: Identity::new(hostname, "build_agent", 4242),
            key_fields: key_fields(&["id"], &[]),
        }
    }

    pub fn env(&self) -> AgentEnv<'_> {
        AgentEnv {
            store: &self.store,
            probe: &self.probe,
            clock: &self.clock,
            notifier: &self.notifier,
            identity: &self.identity,
        }
    }

    pub fn agent(&self, options: AgentOptions) -> std::result::Result<Agent<'_>, ConfigError> {
        Agent::new(options, &self.key_fields, FlagColumns::default(), self.env())
    }
}
