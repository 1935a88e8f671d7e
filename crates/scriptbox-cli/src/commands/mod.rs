//! CLI commands

pub mod instrument;
pub mod run;
