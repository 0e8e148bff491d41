//! Traversal and dispatch across a slice of the store.
//!
//! A [`Runner`] walks the selected tables and their entries. With a callback
//! it hands each entry to caller code; without one it launches a
//! `<goal>_agent` executable per goal column, passing the entry's key values
//! as positional arguments. Every column is a candidate goal unless a
//! `skip_goal` predicate excludes it; key, `ready` and `complete` columns are
//! not filtered implicitly.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::core::filter::PageSelection;
use crate::core::keys::KeyFields;
use crate::core::record::{Entry, Table};
use crate::error::ConfigError;
use crate::io::clock::Clock;
use crate::io::launcher::{GoalCommand, LaunchMode, Launcher, goal_program};
use crate::io::store::RecordStore;

pub const DEFAULT_SLEEP_BETWEEN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Visit only these tables. Exclusive with `skip_pages`.
    pub only_pages: Vec<String>,
    /// Visit every table except these. Exclusive with `only_pages`.
    pub skip_pages: Vec<String>,
    /// Log what would run without running it. Forces `debug`.
    pub dry_run: bool,
    /// Wait for each goal process instead of launching in the background.
    pub run_in_serial: bool,
    pub debug: bool,
    pub sleep_between: Duration,
    pub goal_dir: PathBuf,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            only_pages: Vec::new(),
            skip_pages: Vec::new(),
            dry_run: false,
            run_in_serial: false,
            debug: false,
            sleep_between: DEFAULT_SLEEP_BETWEEN,
            goal_dir: PathBuf::from("agents"),
        }
    }
}

#[derive(Clone, Copy)]
pub struct RunnerEnv<'a> {
    pub store: &'a dyn RecordStore,
    pub launcher: &'a dyn Launcher,
    pub clock: &'a dyn Clock,
}

/// Counts of what one traversal did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tables: Vec<String>,
    pub entries: usize,
    pub callbacks: usize,
    pub launched: usize,
    /// Goals logged but not launched because of `dry_run`.
    pub dry_run: usize,
    /// Goal columns with no matching executable.
    pub missing: usize,
    pub launch_failures: usize,
}

/// Mutable access to one entry for a traversal callback.
pub struct EntryHandle<'r> {
    store: &'r dyn RecordStore,
    table: &'r mut Table,
    position: usize,
}

impl EntryHandle<'_> {
    pub fn table_name(&self) -> &str {
        self.table.name()
    }

    pub fn table(&self) -> &Table {
        self.table
    }

    pub fn entry(&self) -> &Entry {
        &self.table.entries()[self.position]
    }

    /// Update a field in memory; call [`EntryHandle::save`] to persist.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.table.entries_mut()[self.position].set(name, value);
    }

    pub fn save(&mut self) -> Result<()> {
        let name = self.table.name().to_string();
        self.store
            .save(self.table)
            .with_context(|| format!("save table {name}"))
    }
}

type EntryPredicate<'a> = Box<dyn Fn(&Entry) -> bool + 'a>;
type GoalPredicate<'a> = Box<dyn Fn(&str) -> bool + 'a>;

pub struct Runner<'a> {
    options: RunnerOptions,
    key_fields: KeyFields,
    pages: PageSelection<'a>,
    skip_entry: Option<EntryPredicate<'a>>,
    skip_goal: Option<GoalPredicate<'a>>,
    env: RunnerEnv<'a>,
}

impl<'a> Runner<'a> {
    pub fn new(
        mut options: RunnerOptions,
        key_fields: KeyFields,
        env: RunnerEnv<'a>,
    ) -> Result<Self, ConfigError> {
        let pages =
            PageSelection::from_lists(options.only_pages.clone(), options.skip_pages.clone())?;
        if options.dry_run {
            options.debug = true;
        }
        Ok(Self {
            options,
            key_fields,
            pages,
            skip_entry: None,
            skip_goal: None,
            env,
        })
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Key field names in rank order; the positional argument order.
    pub fn query_fields(&self) -> Vec<String> {
        self.key_fields.query_fields()
    }

    /// Visit only tables for which `predicate` holds. Replaces any earlier
    /// page selection.
    pub fn only_pages_if(mut self, predicate: impl Fn(&str) -> bool + 'a) -> Self {
        self.pages = PageSelection::only_if(predicate);
        self
    }

    /// Visit only tables for which `predicate` does not hold. Replaces any
    /// earlier page selection.
    pub fn skip_pages_if(mut self, predicate: impl Fn(&str) -> bool + 'a) -> Self {
        self.pages = PageSelection::skip_if(predicate);
        self
    }

    pub fn skip_entry(mut self, predicate: impl Fn(&Entry) -> bool + 'a) -> Self {
        self.skip_entry = Some(Box::new(predicate));
        self
    }

    /// Exclude goal columns from the default dispatch. Ignored by callbacks.
    pub fn skip_goal(mut self, predicate: impl Fn(&str) -> bool + 'a) -> Self {
        self.skip_goal = Some(Box::new(predicate));
        self
    }

    /// Hand every candidate entry to `callback`, which saves its own changes.
    #[instrument(skip_all, fields(dry_run = self.options.dry_run))]
    pub fn process_with<F>(&self, mut callback: F) -> Result<RunSummary>
    where
        F: FnMut(&mut EntryHandle<'_>) -> Result<()>,
    {
        let (mut tables, candidates, mut summary) = self.candidates()?;
        for (index, position) in candidates {
            let table = &mut tables[index];
            if self.options.dry_run {
                let entry = &table.entries()[position];
                info!(
                    table = %table.name(),
                    keys = %self.key_fields.arguments_for(entry).join(" "),
                    "dry run: would process entry"
                );
            } else {
                let name = table.name().to_string();
                let row = table.entries()[position].row();
                let mut handle = EntryHandle {
                    store: self.env.store,
                    table,
                    position,
                };
                callback(&mut handle)
                    .with_context(|| format!("process entry row {row} of table {name}"))?;
                summary.callbacks += 1;
            }
            self.env.clock.sleep(self.options.sleep_between);
        }
        Ok(summary)
    }

    /// Launch one goal executable per goal column of every candidate entry.
    #[instrument(
        skip_all,
        fields(dry_run = self.options.dry_run, serial = self.options.run_in_serial)
    )]
    pub fn dispatch(&self) -> Result<RunSummary> {
        let (tables, candidates, mut summary) = self.candidates()?;
        for (index, position) in candidates {
            let table = &tables[index];
            self.dispatch_entry(table, &table.entries()[position], &mut summary);
        }
        Ok(summary)
    }

    /// `process(callback?)`: callback traversal when given, default dispatch otherwise.
    pub fn process<F>(&self, callback: Option<F>) -> Result<RunSummary>
    where
        F: FnMut(&mut EntryHandle<'_>) -> Result<()>,
    {
        match callback {
            Some(callback) => self.process_with(callback),
            None => self.dispatch(),
        }
    }

    fn dispatch_entry(&self, table: &Table, entry: &Entry, summary: &mut RunSummary) {
        let args = self.key_fields.arguments_for(entry);
        let mode = if self.options.run_in_serial {
            LaunchMode::Serial
        } else {
            LaunchMode::Background
        };
        for goal in table.columns() {
            if self.skip_goal.as_ref().is_some_and(|skip| skip(goal)) {
                continue;
            }
            let program = goal_program(&self.options.goal_dir, goal);
            if !self.env.launcher.is_available(&program) {
                if self.options.debug {
                    info!(
                        goal = %goal,
                        program = %program.display(),
                        "no goal executable, skipping"
                    );
                } else {
                    debug!(
                        goal = %goal,
                        program = %program.display(),
                        "no goal executable, skipping"
                    );
                }
                summary.missing += 1;
                continue;
            }
            let command = GoalCommand {
                program,
                args: args.clone(),
            };
            if self.options.dry_run {
                info!(table = %table.name(), command = %command, "dry run: would launch");
                summary.dry_run += 1;
            } else {
                if self.options.debug {
                    info!(table = %table.name(), command = %command, "launching goal");
                }
                match self.env.launcher.launch(&command, mode) {
                    Ok(()) => summary.launched += 1,
                    Err(err) => {
                        error!(
                            command = %command,
                            err = %format!("{err:#}"),
                            "failed to launch goal"
                        );
                        summary.launch_failures += 1;
                    }
                }
            }
            self.env.clock.sleep(self.options.sleep_between);
        }
    }

    /// Load the selected tables and list `(table index, entry position)` for
    /// every entry that survives `skip_entry`.
    fn candidates(&self) -> Result<(Vec<Table>, Vec<(usize, usize)>, RunSummary)> {
        let names = self.env.store.table_names().context("list tables")?;
        let mut summary = RunSummary::default();
        let mut tables = Vec::new();
        for name in self.pages.select(&names) {
            if self.options.debug {
                info!(table = %name, "visiting table");
            }
            match self
                .env
                .store
                .fetch(&name)
                .with_context(|| format!("load table {name}"))?
            {
                Some(mut table) => {
                    for entry in table.entries_mut() {
                        let identity = self.key_fields.identity_of(entry);
                        entry.pin(identity);
                    }
                    tables.push(table);
                    summary.tables.push(name);
                }
                None => warn!(table = %name, "table disappeared before it could be read"),
            }
        }

        let mut candidates = Vec::new();
        for (index, table) in tables.iter().enumerate() {
            for (position, entry) in table.entries().iter().enumerate() {
                if self.skip_entry.as_ref().is_some_and(|skip| skip(entry)) {
                    continue;
                }
                candidates.push((index, position));
            }
        }
        summary.entries = candidates.len();
        Ok((tables, candidates, summary))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::capture::capture;
    use crate::error::StoreError;
    use crate::io::store::MemoryStore;
    use crate::test_support::{RecordingClock, RecordingLauncher, key_fields, row};

    struct Fixture {
        store: MemoryStore,
        launcher: RecordingLauncher,
        clock: RecordingClock,
    }

    impl Fixture {
        fn new(installed: &[&str]) -> Self {
            let store = MemoryStore::new();
            for table in ["bar", "foo", "qux"] {
                store
                    .put(
                        table,
                        &["id", "lang", "ready", "build"],
                        vec![
                            row(&[("id", "1"), ("lang", "en"), ("ready", "1"), ("build", "")]),
                            row(&[("id", "2"), ("lang", ""), ("ready", ""), ("build", "")]),
                        ],
                    )
                    .expect("put");
            }
            let programs: Vec<PathBuf> = installed
                .iter()
                .map(|goal| goal_program(Path::new("/goals"), goal))
                .collect();
            Self {
                store,
                launcher: RecordingLauncher::with_programs(&programs),
                clock: RecordingClock::default(),
            }
        }

        fn env(&self) -> RunnerEnv<'_> {
            RunnerEnv {
                store: &self.store,
                launcher: &self.launcher,
                clock: &self.clock,
            }
        }

        fn runner(&self, options: RunnerOptions) -> Result<Runner<'_>, ConfigError> {
            Runner::new(
                RunnerOptions {
                    goal_dir: PathBuf::from("/goals"),
                    ..options
                },
                key_fields(&["id"], &["lang"]),
                self.env(),
            )
        }
    }

    fn visited(runner: &Runner<'_>) -> Vec<String> {
        runner
            .process_with(|_| Ok(()))
            .expect("process")
            .tables
    }

    #[test]
    fn only_pages_visits_just_those_tables() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner");
        assert_eq!(visited(&runner), vec!["foo"]);
    }

    #[test]
    fn skip_pages_visits_everything_else() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                skip_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner");
        assert_eq!(visited(&runner), vec!["bar", "qux"]);
    }

    #[test]
    fn both_page_lists_fail_construction() {
        let fixture = Fixture::new(&[]);
        let result = fixture.runner(RunnerOptions {
            only_pages: vec!["foo".to_string()],
            skip_pages: vec!["bar".to_string()],
            ..RunnerOptions::default()
        });
        assert_eq!(result.err(), Some(ConfigError::ConflictingPageFilters));
        assert!(fixture.clock.sleeps().is_empty());
    }

    #[test]
    fn latest_page_filter_replaces_earlier_ones() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner")
            .only_pages_if(|name| name.starts_with('b'))
            .skip_pages_if(|name| name == "bar");
        assert_eq!(visited(&runner), vec!["foo", "qux"]);
    }

    #[test]
    fn skip_entry_filters_candidates() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner")
            .skip_entry(|entry| entry.get("ready") != Some("1"));

        let mut seen = Vec::new();
        let summary = runner
            .process_with(|handle| {
                seen.push(handle.entry().get("id").unwrap_or_default().to_string());
                Ok(())
            })
            .expect("process");
        assert_eq!(seen, vec!["1"]);
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.callbacks, 1);
    }

    #[test]
    fn callback_can_update_and_save_entries() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["qux".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner");
        runner
            .process_with(|handle| {
                assert_eq!(handle.table_name(), "qux");
                handle.set("ready", "1");
                handle.save()
            })
            .expect("process");

        let table = fixture.store.fetch("qux").expect("fetch").expect("table");
        assert!(table.entries().iter().all(|e| e.get("ready") == Some("1")));
    }

    #[test]
    fn callbacks_are_spaced_by_sleep_between() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                sleep_between: Duration::from_secs(10),
                ..RunnerOptions::default()
            })
            .expect("runner");
        let summary = runner.process_with(|_| Ok(())).expect("process");

        let sleeps = fixture.clock.sleeps();
        assert_eq!(summary.callbacks, 6);
        assert_eq!(sleeps.len(), summary.callbacks);
        assert!(sleeps.iter().all(|d| *d >= Duration::from_secs(10)));
    }

    #[test]
    fn dispatch_launches_every_available_goal_with_key_arguments() {
        let fixture = Fixture::new(&["build"]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner");
        let summary = runner.dispatch().expect("dispatch");

        let launched = fixture.launcher.launched();
        assert_eq!(
            launched,
            vec![
                (
                    GoalCommand {
                        program: PathBuf::from("/goals/build_agent"),
                        args: vec!["1".to_string(), "en".to_string()],
                    },
                    LaunchMode::Background
                ),
                (
                    GoalCommand {
                        program: PathBuf::from("/goals/build_agent"),
                        args: vec!["2".to_string()],
                    },
                    LaunchMode::Background
                ),
            ]
        );
        assert_eq!(summary.launched, 2);
        // id, lang and ready have no executables.
        assert_eq!(summary.missing, 6);
        assert_eq!(fixture.clock.sleeps().len(), 2);
    }

    #[test]
    fn structural_columns_are_goals_unless_skipped() {
        let fixture = Fixture::new(&["build", "ready"]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                run_in_serial: true,
                ..RunnerOptions::default()
            })
            .expect("runner");
        runner.dispatch().expect("dispatch");
        let programs: Vec<PathBuf> = fixture
            .launcher
            .launched()
            .into_iter()
            .map(|(command, mode)| {
                assert_eq!(mode, LaunchMode::Serial);
                command.program
            })
            .collect();
        assert!(programs.contains(&PathBuf::from("/goals/ready_agent")));

        let fixture = Fixture::new(&["build", "ready"]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner")
            .skip_goal(|goal| goal == "ready");
        runner.dispatch().expect("dispatch");
        assert!(
            fixture
                .launcher
                .launched()
                .iter()
                .all(|(command, _)| command.program.ends_with("build_agent"))
        );
    }

    #[test]
    fn dry_run_forces_debug_logs_commands_and_writes_nothing() {
        let fixture = Fixture::new(&["build"]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                dry_run: true,
                ..RunnerOptions::default()
            })
            .expect("runner");
        assert!(runner.options().debug);

        let (summary, logs) = capture(|| runner.dispatch().expect("dispatch"));
        assert!(fixture.launcher.launched().is_empty());
        assert_eq!(summary.dry_run, 2);
        assert!(logs.contains("visiting table"));
        assert!(logs.contains("/goals/build_agent 1 en"));
        assert!(logs.contains("/goals/build_agent 2"));

        let before = fixture.store.fetch("foo").expect("fetch");
        let (_, logs) = capture(|| {
            runner
                .process_with(|handle| {
                    handle.set("build", "r:nope");
                    handle.save()
                })
                .expect("process")
        });
        assert!(logs.contains("dry run: would process entry"));
        assert_eq!(fixture.store.fetch("foo").expect("fetch"), before);
    }

    #[test]
    fn missing_executables_are_reported_in_debug_mode() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                debug: true,
                ..RunnerOptions::default()
            })
            .expect("runner");
        let (summary, logs) = capture(|| runner.dispatch().expect("dispatch"));
        assert_eq!(summary.missing, 8);
        let skipped: Vec<&str> = logs
            .lines()
            .filter(|line| line.contains("no goal executable"))
            .collect();
        assert_eq!(skipped.len(), 8);
        assert!(skipped.iter().all(|line| line.contains("INFO")));
    }

    /// Lists one table that is never there when fetched.
    struct VanishingStore {
        inner: MemoryStore,
    }

    impl RecordStore for VanishingStore {
        fn table_names(&self) -> Result<Vec<String>, StoreError> {
            let mut names = self.inner.table_names()?;
            names.push("zzz".to_string());
            Ok(names)
        }

        fn fetch(&self, table: &str) -> Result<Option<Table>, StoreError> {
            self.inner.fetch(table)
        }

        fn save(&self, table: &mut Table) -> Result<(), StoreError> {
            self.inner.save(table)
        }

        fn create_table(&self, table: &str, columns: &[String]) -> Result<Table, StoreError> {
            self.inner.create_table(table, columns)
        }
    }

    #[test]
    fn vanished_tables_are_not_counted_as_visited() {
        let fixture = Fixture::new(&[]);
        let store = VanishingStore {
            inner: MemoryStore::new(),
        };
        store
            .inner
            .put("foo", &["id"], vec![row(&[("id", "1")])])
            .expect("put");
        let env = RunnerEnv {
            store: &store,
            ..fixture.env()
        };
        let runner =
            Runner::new(RunnerOptions::default(), key_fields(&["id"], &[]), env).expect("runner");
        let summary = runner.process_with(|_| Ok(())).expect("process");
        assert_eq!(summary.tables, vec!["foo"]);
        assert_eq!(summary.callbacks, 1);
    }

    #[test]
    fn callback_save_after_rows_shift_is_rejected() {
        let fixture = Fixture::new(&[]);
        let runner = fixture
            .runner(RunnerOptions {
                only_pages: vec!["foo".to_string()],
                ..RunnerOptions::default()
            })
            .expect("runner")
            .skip_entry(|entry| entry.get("id") != Some("2"));

        let result = runner.process_with(|handle| {
            fixture
                .store
                .put(
                    "foo",
                    &["id", "build"],
                    vec![row(&[("id", "3"), ("build", "")]), row(&[("id", "4"), ("build", "")])],
                )
                .expect("replace rows");
            handle.set("build", "queued");
            handle.save()
        });
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("no longer holds {id=2}"));

        let table = fixture.store.fetch("foo").expect("fetch").expect("table");
        assert!(table.entries().iter().all(|e| e.get("build") == Some("")));
    }

    #[test]
    fn query_fields_follow_rank() {
        let fixture = Fixture::new(&[]);
        let runner = fixture.runner(RunnerOptions::default()).expect("runner");
        assert_eq!(runner.query_fields(), vec!["id", "lang"]);
    }
}
