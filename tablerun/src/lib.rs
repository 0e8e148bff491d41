//! Claim-and-arbitrate job coordination over a shared record store.
//!
//! Independent nodes run goal executables against the same tables. Each
//! [`agent::Agent`] claims a goal on one entry by writing its host name,
//! waits for the write to settle, and only proceeds if its claim survived.
//! A [`runner::Runner`] walks the tables and launches those executables.
//!
//! - **[`core`]**: Pure logic (status tags, key fields, eligibility,
//!   admission counting, page filters). No I/O.
//! - **[`io`]**: Side effects behind traits (stores, process table, clock,
//!   launcher, notifier, config).
//!
//! Orchestration modules ([`agent`], [`conflict`], [`runner`]) combine the two
//! and back the CLI commands.

pub mod agent;
pub mod capture;
pub mod conflict;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod work;
