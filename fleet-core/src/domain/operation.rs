//! Operation catalogue
//!
//! Every job carries exactly one operation. The operation decides which typed
//! resource spec its parameters must deserialize into and which remote pool
//! category runs it.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Infrastructure change requested by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateVm,
    DeleteVm,
    CreateDisk,
    CreateNic,
    UpdateNic,
    InitializeVm,
    /// Composite: expands into create_vm, create_disk, create_nic and initialize_vm steps
    ManagedDeployment,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::CreateVm,
        Operation::DeleteVm,
        Operation::CreateDisk,
        Operation::CreateNic,
        Operation::UpdateNic,
        Operation::InitializeVm,
        Operation::ManagedDeployment,
    ];

    /// Wire name used in request envelopes
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateVm => "create_vm",
            Operation::DeleteVm => "delete_vm",
            Operation::CreateDisk => "create_disk",
            Operation::CreateNic => "create_nic",
            Operation::UpdateNic => "update_nic",
            Operation::InitializeVm => "initialize_vm",
            Operation::ManagedDeployment => "managed_deployment",
        }
    }

    /// Whether the operation only exists as a parent of composite steps
    pub fn is_composite(&self) -> bool {
        matches!(self, Operation::ManagedDeployment)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown operation name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation '{0}'")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}
