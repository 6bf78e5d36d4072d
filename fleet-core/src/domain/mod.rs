//! Core domain types
//!
//! This module contains the core domain structures used across Fleet crates.
//! Job records live only in memory: nothing here is persisted, and a restarted
//! control plane starts with an empty arena.

pub mod envelope;
pub mod job;
pub mod log;
pub mod operation;
pub mod resource;
