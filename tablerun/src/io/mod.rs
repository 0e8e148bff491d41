//! Side-effecting collaborators: stores, processes, clocks, notification.
//!
//! Each concern sits behind a trait so the agent and runner can be driven by
//! fakes in tests.

pub mod clock;
pub mod config;
pub mod host;
pub mod json_store;
pub mod launcher;
pub mod notify;
pub mod probe;
pub mod process;
pub mod store;
