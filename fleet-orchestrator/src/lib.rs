//! Fleet Orchestrator
//!
//! In-memory job orchestration for the fleet control plane:
//! - Registry: job records, lifecycle rules and parent/child aggregation
//! - Host slots: one active job per host, granted in arrival order
//! - Validation: the gate every submission passes before a job exists
//! - Service: submission API and the worker loops that dispatch jobs
//!
//! Nothing here is persisted. A restarted orchestrator starts with an empty
//! registry and empty host queues.

pub mod config;
pub mod error;
pub mod host_slots;
pub mod observer;
pub mod registry;
pub mod service;
pub mod validation;

pub use config::Config;
pub use error::JobError;
pub use host_slots::{HostSlotGuard, HostSlotSnapshot, HostSlots, SlotWaiter};
pub use observer::{ChannelObserver, JobEvent, JobObserver};
pub use registry::{HostClaim, JobRegistry, JobStateCounts, RegistryError, Retention};
pub use service::{JobService, ServiceMetrics};
pub use validation::{Inventory, ValidatedJob, Validator};
