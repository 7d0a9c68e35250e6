//! Core library for crackerjack — the typed data model, configuration,
//! memoization and baseline stores, the coverage ratchet, and the git and
//! config-merge gateways.
//!
//! Everything above this crate (hook engine, agents, orchestrator) consumes
//! these types; nothing here spawns a tool directly — subprocess access goes
//! through `cj-guard`.

pub mod baseline;
pub mod cache;
pub mod config;
pub mod git;
pub mod merge;
pub mod ratchet;
pub mod types;

pub use types::*;
