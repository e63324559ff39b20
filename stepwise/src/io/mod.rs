//! Side-effecting services: processes, files, collaborators, the console.

pub mod artifacts;
pub mod collaborator;
pub mod config;
pub mod installer;
pub mod interrupt;
pub mod operator;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod supervisor;
pub mod system;
