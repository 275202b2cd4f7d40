//! Core subsystems of the bosun orchestrator.
//!
//! Four tightly coupled pieces live here: the executor pool and router,
//! the worktree/branch lifecycle manager, the maintenance and singleton
//! supervisor, and the kanban sync core. Everything else (setup wizard,
//! notification channels, webhook dispatch, agent SDK protocols) is an
//! external collaborator reached through the traits in [`sdk`] and
//! [`kanban`].

pub mod branch;
pub mod busgate;
pub mod executor;
pub mod git;
pub mod kanban;
pub mod lock;
pub mod maintenance;
pub mod process;
pub mod router;
pub mod sdk;
pub mod supervisor;
pub mod taskstore;
pub mod throttle;
pub mod worktree;
