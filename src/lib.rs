//! Isolaunch Orchestrator Library
//!
//! Per-identity storage isolation for a host application that keeps a single
//! shared storage directory, and a launch orchestrator that runs identities
//! through that isolation strictly one at a time.

pub mod config;
pub mod launch;
pub mod storage;
