//! Stable exit codes for tablerun CLI commands.

/// Command succeeded. For `claim` this includes deliberate skips.
pub const OK: i32 = 0;
/// Invalid usage, configuration or key values.
pub const INVALID: i32 = 1;
/// `tablerun claim` hit an internal error (store, lookup or work command).
pub const FAILED: i32 = 2;
