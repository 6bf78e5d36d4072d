//! Fleet Core
//!
//! Core types and abstractions for the Fleet control plane.
//!
//! This crate contains:
//! - Domain types: jobs, operations, typed resource specs and the wire envelopes
//!   exchanged with remote host agents
//! - DTOs: views handed to callers of the job service

pub mod domain;
pub mod dto;
