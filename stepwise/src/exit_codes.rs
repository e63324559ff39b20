//! Stable exit codes for `stepwise` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, config, or input, or an internal error.
pub const INVALID: i32 = 1;
/// `stepwise run` executed the artifact and it failed.
pub const EXEC_FAILED: i32 = 2;
/// The operator interrupted the run (128 + SIGINT).
pub const INTERRUPTED: i32 = 130;
