//! Regwatch Common - Shared library for the KernelCI regression watcher
//!
//! Queries a KernelCI results database for newly detected issues, correlates
//! them with related build/test history, and composes plain-text email
//! reports. Also provides a cached client for the dashboard REST API and
//! Gmail-based report delivery.

pub mod config;
pub mod dashboard;
pub mod db;
pub mod issues;
pub mod mail;
pub mod report;

pub use config::RegwatchConfig;
pub use db::Db;
