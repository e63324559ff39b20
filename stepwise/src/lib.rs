//! Plan-driven code generation and execution engine.
//!
//! An operator gives a natural-language instruction; a planner turns it into
//! numbered steps; each step is generated, executed, and, on failure, repaired
//! once before the operator decides how to continue. The layers are:
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing, provenance,
//!   marker and dependency detection). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting services (child processes, the WebAssembly
//!   sandbox, artifacts, collaborators, the console).
//!
//! [`engine`] owns plan state and the code buffer, [`executor`] runs code,
//! [`signal`] forwards marker-signalled images to analysis, and [`session`]
//! ties them to the interactive prompt.

pub mod core;
pub mod engine;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
pub mod signal;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
