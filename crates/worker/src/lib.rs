//! The `batchgen` command-line front end: argument parsing, logging setup
//! and the subcommand implementations. `main.rs` only wires them together.

pub mod cli;
pub mod commands;
pub mod logging;
