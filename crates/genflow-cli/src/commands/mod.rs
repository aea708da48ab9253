//! Command implementations
//!
//! Each subcommand has its own module with a `run` function (or one function
//! per nested subcommand).

pub mod config;
pub mod ddl;
pub mod graph;
pub mod log;
pub mod ping;
pub mod run;
pub mod test;
