//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod action;
pub mod dependency;
pub mod marker;
pub mod plan_parser;
pub mod provenance;
pub mod types;
