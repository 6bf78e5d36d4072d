//! Submission gate
//!
//! Every submission is checked here before a job record exists: parameters
//! must deserialize into the operation's typed spec, names must be valid and
//! unique within a composite, and resources to be created must not already
//! exist according to the inventory (when one is configured). Conflicts with
//! other active jobs are checked atomically by the registry on insert.

use fleet_core::domain::operation::Operation;
use fleet_core::domain::resource::{ClaimMode, ResourceKey, ResourceSpec};
use fleet_core::dto::job::CompositeStep;
use std::sync::Arc;

use crate::error::JobError;
use crate::registry::HostClaim;

/// Read-only view of what already exists on the hosts
pub trait Inventory: Send + Sync {
    fn exists(&self, host: &str, resource: &ResourceKey) -> bool;
}

/// A submission that passed the gate
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub host: String,
    pub spec: ResourceSpec,
    pub claims: Vec<HostClaim>,
}

impl ValidatedJob {
    pub fn operation(&self) -> Operation {
        self.spec.operation()
    }
}

#[derive(Default, Clone)]
pub struct Validator {
    inventory: Option<Arc<dyn Inventory>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Validates a single operation against one host
    pub fn validate(
        &self,
        operation: Operation,
        target_host: Option<&str>,
        parameters: &serde_json::Value,
    ) -> Result<ValidatedJob, JobError> {
        let host = validate_host(target_host)?;
        let spec = ResourceSpec::parse(operation, parameters)
            .map_err(|e| JobError::Validation(e.to_string()))?;
        self.check_inventory(&host, &spec)?;

        let claims = spec
            .claims()
            .into_iter()
            .map(|claim| HostClaim::new(&host, claim))
            .collect();
        Ok(ValidatedJob { host, spec, claims })
    }

    /// Validates every step of a composite and the steps against each other
    pub fn validate_composite(&self, steps: &[CompositeStep]) -> Result<Vec<ValidatedJob>, JobError> {
        if steps.is_empty() {
            return Err(JobError::Validation(
                "a composite needs at least one step".to_string(),
            ));
        }

        let mut validated: Vec<ValidatedJob> = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            if step.operation.is_composite() {
                return Err(JobError::Validation(format!(
                    "step {} cannot itself be a {}",
                    index + 1,
                    step.operation
                )));
            }
            let job = self
                .validate(step.operation, step.target_host.as_deref(), &step.parameters)
                .map_err(|e| match e {
                    JobError::Validation(reason) => {
                        JobError::Validation(format!("step {}: {}", index + 1, reason))
                    }
                    other => other,
                })?;

            let exclusive = job
                .claims
                .iter()
                .filter(|claim| claim.claim.mode == ClaimMode::Exclusive);
            for claim in exclusive {
                let duplicate = validated.iter().flat_map(|earlier| &earlier.claims).any(|held| {
                    held.claim.mode == ClaimMode::Exclusive && held.host == claim.host && held.claim.key == claim.claim.key
                });
                if duplicate {
                    return Err(JobError::Validation(format!(
                        "step {}: duplicate {} on {}",
                        index + 1,
                        claim.claim.key,
                        claim.host
                    )));
                }
            }
            validated.push(job);
        }
        Ok(validated)
    }

    fn check_inventory(&self, host: &str, spec: &ResourceSpec) -> Result<(), JobError> {
        let Some(inventory) = &self.inventory else {
            return Ok(());
        };
        let created = match spec {
            ResourceSpec::ManagedDeployment(deployment) => deployment
                .clone()
                .into_steps()
                .iter()
                .filter_map(ResourceSpec::created_resource)
                .collect(),
            other => other.created_resource().into_iter().collect::<Vec<_>>(),
        };
        for resource in created {
            if inventory.exists(host, &resource) {
                return Err(JobError::Validation(format!(
                    "{} already exists on {}",
                    resource, host
                )));
            }
        }
        Ok(())
    }
}

fn validate_host(target_host: Option<&str>) -> Result<String, JobError> {
    let host = target_host.map(str::trim).unwrap_or_default();
    if host.is_empty() {
        return Err(JobError::Validation("target host is required".to_string()));
    }
    if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(JobError::Validation(format!(
            "invalid target host '{}'",
            host
        )));
    }
    Ok(host.to_string())
}
