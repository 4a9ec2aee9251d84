//! TimeLocker core: backup orchestration, calendar-based retention, and a
//! tamper-evident audit ledger over pluggable backup engines.

pub mod audit;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod humanize;
pub mod lock;
pub mod observability;
pub mod orchestrator;
pub mod retention;
pub mod snapshots;
pub mod verify;
