//! Data Transfer Objects
//!
//! Views and requests exchanged between the job service and its callers
//! (the API layer, the CLI, observers).

pub mod job;
