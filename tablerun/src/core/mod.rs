//! Deterministic, pure logic shared by the agent and the runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! tables, entries and process listings and return deterministic outputs
//! suitable for tests.

pub mod conflict;
pub mod filter;
pub mod gate;
pub mod keys;
pub mod record;
pub mod status;
