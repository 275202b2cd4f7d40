//! SQLite persistence for the bosun task store.
//!
//! The schema is event-sourced: `task_events` is the append-only log and
//! `tasks` / `task_attempts` are the materialized views. Query functions
//! live under [`queries`]; no SQL escapes this crate.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
