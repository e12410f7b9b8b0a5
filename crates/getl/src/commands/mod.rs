//! `getl` subcommands

pub mod migrate;
pub mod pipelines;
pub mod run;
