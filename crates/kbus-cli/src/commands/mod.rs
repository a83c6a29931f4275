//! CLI subcommands.

pub mod limits;
pub mod scenario;
