//! Typed resource specifications
//!
//! Job parameters arrive as opaque JSON and are validated by deserializing them
//! into the spec type owned by the job's operation. Hardware settings and guest
//! configuration are separate types handed to separate composite steps, so no
//! step ever has to guess which fields belong to it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::net::IpAddr;

use super::operation::Operation;

const MAX_NAME_LEN: usize = 100;
const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Reasons a parameter payload is rejected before a job exists
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("malformed parameters for {operation}: {reason}")]
    Malformed { operation: Operation, reason: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("duplicate resource name '{0}'")]
    Duplicate(String),
}

impl SpecError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        SpecError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Hardware definition of a new virtual machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmSpec {
    pub name: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub generation: Option<u8>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Reference to an existing virtual machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmRef {
    pub vm_name: String,
    #[serde(default)]
    pub force: bool,
}

/// Virtual disk attached to a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskSpec {
    /// Filled in from the machine name when part of a managed deployment
    #[serde(default)]
    pub vm_name: String,
    pub name: String,
    pub size_gb: u64,
    #[serde(default)]
    pub controller: Option<String>,
}

/// Network adapter attached to a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicSpec {
    #[serde(default)]
    pub vm_name: String,
    pub name: String,
    pub switch_name: String,
    #[serde(default)]
    pub vlan_id: Option<u16>,
    #[serde(default)]
    pub mac_address: Option<String>,
}

/// Reconfiguration of an existing network adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicUpdate {
    pub vm_name: String,
    pub name: String,
    #[serde(default)]
    pub switch_name: Option<String>,
    #[serde(default)]
    pub vlan_id: Option<u16>,
}

/// Guest operating system settings applied after the hardware exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuestConfig {
    #[serde(default)]
    pub vm_name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub prefix_length: Option<u8>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// A complete machine: hardware, storage, networking and guest settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagedDeployment {
    pub vm: VmSpec,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub guest: Option<GuestConfig>,
}

/// Parameters of a job, typed by operation
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    CreateVm(VmSpec),
    DeleteVm(VmRef),
    CreateDisk(DiskSpec),
    CreateNic(NicSpec),
    UpdateNic(NicUpdate),
    InitializeVm(GuestConfig),
    ManagedDeployment(ManagedDeployment),
}

impl ResourceSpec {
    /// Deserializes and validates `parameters` for `operation`
    pub fn parse(operation: Operation, parameters: &JsonValue) -> Result<Self, SpecError> {
        fn typed<T: serde::de::DeserializeOwned>(
            operation: Operation,
            parameters: &JsonValue,
        ) -> Result<T, SpecError> {
            if !parameters.is_object() {
                return Err(SpecError::Malformed {
                    operation,
                    reason: "parameters must be a JSON object".to_string(),
                });
            }
            T::deserialize(parameters).map_err(|e| SpecError::Malformed {
                operation,
                reason: e.to_string(),
            })
        }

        let spec = match operation {
            Operation::CreateVm => ResourceSpec::CreateVm(typed(operation, parameters)?),
            Operation::DeleteVm => ResourceSpec::DeleteVm(typed(operation, parameters)?),
            Operation::CreateDisk => ResourceSpec::CreateDisk(typed(operation, parameters)?),
            Operation::CreateNic => ResourceSpec::CreateNic(typed(operation, parameters)?),
            Operation::UpdateNic => ResourceSpec::UpdateNic(typed(operation, parameters)?),
            Operation::InitializeVm => ResourceSpec::InitializeVm(typed(operation, parameters)?),
            Operation::ManagedDeployment => {
                ResourceSpec::ManagedDeployment(typed(operation, parameters)?)
            }
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn operation(&self) -> Operation {
        match self {
            ResourceSpec::CreateVm(_) => Operation::CreateVm,
            ResourceSpec::DeleteVm(_) => Operation::DeleteVm,
            ResourceSpec::CreateDisk(_) => Operation::CreateDisk,
            ResourceSpec::CreateNic(_) => Operation::CreateNic,
            ResourceSpec::UpdateNic(_) => Operation::UpdateNic,
            ResourceSpec::InitializeVm(_) => Operation::InitializeVm,
            ResourceSpec::ManagedDeployment(_) => Operation::ManagedDeployment,
        }
    }

    /// Serializes the spec back into the `resource_spec` payload of a request
    pub fn to_parameters(&self) -> JsonValue {
        let value = match self {
            ResourceSpec::CreateVm(spec) => serde_json::to_value(spec),
            ResourceSpec::DeleteVm(spec) => serde_json::to_value(spec),
            ResourceSpec::CreateDisk(spec) => serde_json::to_value(spec),
            ResourceSpec::CreateNic(spec) => serde_json::to_value(spec),
            ResourceSpec::UpdateNic(spec) => serde_json::to_value(spec),
            ResourceSpec::InitializeVm(spec) => serde_json::to_value(spec),
            ResourceSpec::ManagedDeployment(spec) => serde_json::to_value(spec),
        };
        // Plain structs of strings and integers always serialize.
        value.unwrap_or(JsonValue::Null)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        match self {
            ResourceSpec::CreateVm(spec) => spec.validate(),
            ResourceSpec::DeleteVm(spec) => validate_name("vm_name", &spec.vm_name),
            ResourceSpec::CreateDisk(spec) => spec.validate(),
            ResourceSpec::CreateNic(spec) => spec.validate(),
            ResourceSpec::UpdateNic(spec) => spec.validate(),
            ResourceSpec::InitializeVm(spec) => spec.validate(),
            ResourceSpec::ManagedDeployment(spec) => spec.validate(),
        }
    }

    /// Resources this job touches while it is active
    pub fn claims(&self) -> Vec<ResourceClaim> {
        match self {
            ResourceSpec::CreateVm(spec) => vec![ResourceClaim::exclusive(ResourceKey::vm(&spec.name))],
            ResourceSpec::DeleteVm(spec) => {
                vec![ResourceClaim::exclusive(ResourceKey::vm(&spec.vm_name))]
            }
            ResourceSpec::CreateDisk(spec) => vec![
                ResourceClaim::shared(ResourceKey::vm(&spec.vm_name)),
                ResourceClaim::exclusive(ResourceKey::disk(&spec.vm_name, &spec.name)),
            ],
            ResourceSpec::CreateNic(spec) => vec![
                ResourceClaim::shared(ResourceKey::vm(&spec.vm_name)),
                ResourceClaim::exclusive(ResourceKey::nic(&spec.vm_name, &spec.name)),
            ],
            ResourceSpec::UpdateNic(spec) => vec![
                ResourceClaim::shared(ResourceKey::vm(&spec.vm_name)),
                ResourceClaim::exclusive(ResourceKey::nic(&spec.vm_name, &spec.name)),
            ],
            ResourceSpec::InitializeVm(spec) => vec![
                ResourceClaim::shared(ResourceKey::vm(&spec.vm_name)),
                ResourceClaim::exclusive(ResourceKey::Guest(spec.vm_name.to_lowercase())),
            ],
            ResourceSpec::ManagedDeployment(spec) => spec
                .clone()
                .into_steps()
                .iter()
                .flat_map(ResourceSpec::claims)
                .collect(),
        }
    }

    /// Resource created by this spec, used for inventory existence checks
    pub fn created_resource(&self) -> Option<ResourceKey> {
        match self {
            ResourceSpec::CreateVm(spec) => Some(ResourceKey::vm(&spec.name)),
            ResourceSpec::CreateDisk(spec) => Some(ResourceKey::disk(&spec.vm_name, &spec.name)),
            ResourceSpec::CreateNic(spec) => Some(ResourceKey::nic(&spec.vm_name, &spec.name)),
            _ => None,
        }
    }
}

impl VmSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_name("name", &self.name)?;
        if !(1..=64).contains(&self.cpu_count) {
            return Err(SpecError::invalid("cpu_count", "must be between 1 and 64"));
        }
        if self.memory_mb < 32 || self.memory_mb % 2 != 0 {
            return Err(SpecError::invalid(
                "memory_mb",
                "must be an even number of at least 32",
            ));
        }
        if let Some(generation) = self.generation {
            if generation != 1 && generation != 2 {
                return Err(SpecError::invalid("generation", "must be 1 or 2"));
            }
        }
        Ok(())
    }
}

impl DiskSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_name("vm_name", &self.vm_name)?;
        validate_name("name", &self.name)?;
        if !(1..=65_536).contains(&self.size_gb) {
            return Err(SpecError::invalid("size_gb", "must be between 1 and 65536"));
        }
        Ok(())
    }
}

impl NicSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_name("vm_name", &self.vm_name)?;
        validate_name("name", &self.name)?;
        validate_name("switch_name", &self.switch_name)?;
        validate_vlan(self.vlan_id)?;
        if let Some(mac) = &self.mac_address {
            validate_mac(mac)?;
        }
        Ok(())
    }
}

impl NicUpdate {
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_name("vm_name", &self.vm_name)?;
        validate_name("name", &self.name)?;
        if let Some(switch) = &self.switch_name {
            validate_name("switch_name", switch)?;
        }
        validate_vlan(self.vlan_id)?;
        if self.switch_name.is_none() && self.vlan_id.is_none() {
            return Err(SpecError::invalid(
                "nic update",
                "at least one of switch_name or vlan_id is required",
            ));
        }
        Ok(())
    }
}

impl GuestConfig {
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_name("vm_name", &self.vm_name)?;
        if let Some(hostname) = &self.hostname {
            let valid = !hostname.is_empty()
                && hostname.len() <= 15
                && hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !hostname.starts_with('-');
            if !valid {
                return Err(SpecError::invalid(
                    "hostname",
                    "must be 1-15 alphanumeric characters or '-'",
                ));
            }
        }
        for (field, value) in [("ip_address", &self.ip_address), ("gateway", &self.gateway)] {
            if let Some(addr) = value {
                parse_ip(field, addr)?;
            }
        }
        for dns in &self.dns_servers {
            parse_ip("dns_servers", dns)?;
        }
        if let Some(prefix) = self.prefix_length {
            if self.ip_address.is_none() {
                return Err(SpecError::invalid("prefix_length", "requires ip_address"));
            }
            if prefix == 0 || prefix > 128 {
                return Err(SpecError::invalid("prefix_length", "must be between 1 and 128"));
            }
        }
        Ok(())
    }
}

impl ManagedDeployment {
    pub fn validate(&self) -> Result<(), SpecError> {
        self.vm.validate()?;

        let mut disk_names = HashSet::new();
        for disk in &self.disks {
            check_owner("disks.vm_name", &disk.vm_name, &self.vm.name)?;
            if !disk_names.insert(disk.name.to_lowercase()) {
                return Err(SpecError::Duplicate(disk.name.clone()));
            }
        }
        let mut nic_names = HashSet::new();
        for nic in &self.nics {
            check_owner("nics.vm_name", &nic.vm_name, &self.vm.name)?;
            if !nic_names.insert(nic.name.to_lowercase()) {
                return Err(SpecError::Duplicate(nic.name.clone()));
            }
        }
        if let Some(guest) = &self.guest {
            check_owner("guest.vm_name", &guest.vm_name, &self.vm.name)?;
        }

        for step in self.clone().into_steps() {
            step.validate()?;
        }
        Ok(())
    }

    /// Splits the deployment into ordered steps: machine, disks, adapters, guest
    pub fn into_steps(self) -> Vec<ResourceSpec> {
        let vm_name = self.vm.name.clone();
        let mut steps = vec![ResourceSpec::CreateVm(self.vm)];
        steps.extend(self.disks.into_iter().map(|mut disk| {
            disk.vm_name = vm_name.clone();
            ResourceSpec::CreateDisk(disk)
        }));
        steps.extend(self.nics.into_iter().map(|mut nic| {
            nic.vm_name = vm_name.clone();
            ResourceSpec::CreateNic(nic)
        }));
        if let Some(mut guest) = self.guest {
            guest.vm_name = vm_name;
            steps.push(ResourceSpec::InitializeVm(guest));
        }
        steps
    }
}

/// Identity of a resource on one host (names are case-insensitive)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    Vm(String),
    Disk { vm: String, name: String },
    Nic { vm: String, name: String },
    Guest(String),
}

impl ResourceKey {
    pub fn vm(name: &str) -> Self {
        ResourceKey::Vm(name.to_lowercase())
    }

    pub fn disk(vm: &str, name: &str) -> Self {
        ResourceKey::Disk {
            vm: vm.to_lowercase(),
            name: name.to_lowercase(),
        }
    }

    pub fn nic(vm: &str, name: &str) -> Self {
        ResourceKey::Nic {
            vm: vm.to_lowercase(),
            name: name.to_lowercase(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Vm(name) => write!(f, "vm '{}'", name),
            ResourceKey::Disk { vm, name } => write!(f, "disk '{}' on vm '{}'", name, vm),
            ResourceKey::Nic { vm, name } => write!(f, "nic '{}' on vm '{}'", name, vm),
            ResourceKey::Guest(vm) => write!(f, "guest configuration of vm '{}'", vm),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimMode {
    Shared,
    Exclusive,
}

/// A resource held by an active job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub key: ResourceKey,
    pub mode: ClaimMode,
}

impl ResourceClaim {
    pub fn shared(key: ResourceKey) -> Self {
        Self {
            key,
            mode: ClaimMode::Shared,
        }
    }

    pub fn exclusive(key: ResourceKey) -> Self {
        Self {
            key,
            mode: ClaimMode::Exclusive,
        }
    }

    pub fn conflicts_with(&self, other: &ResourceClaim) -> bool {
        self.key == other.key
            && (self.mode == ClaimMode::Exclusive || other.mode == ClaimMode::Exclusive)
    }
}

fn validate_name(field: &str, value: &str) -> Result<(), SpecError> {
    if value.trim().is_empty() {
        return Err(SpecError::invalid(field, "must not be empty"));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(SpecError::invalid(
            field,
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if value
        .chars()
        .any(|c| c.is_control() || FORBIDDEN_NAME_CHARS.contains(&c))
    {
        return Err(SpecError::invalid(field, "contains a forbidden character"));
    }
    Ok(())
}

fn check_owner(field: &str, owner: &str, vm_name: &str) -> Result<(), SpecError> {
    if owner.is_empty() || owner.eq_ignore_ascii_case(vm_name) {
        Ok(())
    } else {
        Err(SpecError::invalid(
            field,
            format!("must be empty or '{}', got '{}'", vm_name, owner),
        ))
    }
}

fn validate_vlan(vlan_id: Option<u16>) -> Result<(), SpecError> {
    match vlan_id {
        Some(id) if !(1..=4094).contains(&id) => {
            Err(SpecError::invalid("vlan_id", "must be between 1 and 4094"))
        }
        _ => Ok(()),
    }
}

fn validate_mac(mac: &str) -> Result<(), SpecError> {
    let digits: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(SpecError::invalid("mac_address", "must contain 12 hex digits"))
    }
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr, SpecError> {
    value
        .parse::<IpAddr>()
        .map_err(|_| SpecError::invalid(field, format!("'{}' is not an IP address", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> JsonValue {
        json!({
            "vm": { "name": "web-01", "cpu_count": 2, "memory_mb": 4096 },
            "disks": [{ "name": "data", "size_gb": 40 }],
            "nics": [{ "name": "eth0", "switch_name": "external", "vlan_id": 12 }],
            "guest": { "hostname": "web01", "ip_address": "10.0.0.5", "prefix_length": 24 }
        })
    }

    #[test]
    fn test_parse_create_vm() {
        let spec = ResourceSpec::parse(
            Operation::CreateVm,
            &json!({"name": "db-01", "cpu_count": 4, "memory_mb": 8192}),
        )
        .unwrap();
        assert_eq!(spec.operation(), Operation::CreateVm);
        assert_eq!(spec.created_resource(), Some(ResourceKey::vm("DB-01")));
    }

    #[test]
    fn test_parse_rejects_non_object_and_unknown_fields() {
        let err = ResourceSpec::parse(Operation::CreateVm, &json!("db-01")).unwrap_err();
        assert!(matches!(err, SpecError::Malformed { .. }));

        let err = ResourceSpec::parse(
            Operation::DeleteVm,
            &json!({"vm_name": "db-01", "purge": true}),
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::Malformed { .. }));
    }

    #[test]
    fn test_invalid_values() {
        let err = ResourceSpec::parse(
            Operation::CreateVm,
            &json!({"name": "a/b", "cpu_count": 1, "memory_mb": 1024}),
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::Invalid { ref field, .. } if field == "name"));

        let err = ResourceSpec::parse(
            Operation::CreateNic,
            &json!({"vm_name": "a", "name": "n", "switch_name": "s", "vlan_id": 5000}),
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::Invalid { ref field, .. } if field == "vlan_id"));

        let err = ResourceSpec::parse(
            Operation::UpdateNic,
            &json!({"vm_name": "a", "name": "n"}),
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::Invalid { .. }));

        let err = ResourceSpec::parse(
            Operation::InitializeVm,
            &json!({"vm_name": "a", "dns_servers": ["not-an-ip"]}),
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::Invalid { ref field, .. } if field == "dns_servers"));
    }

    #[test]
    fn test_deployment_splits_into_ordered_steps() {
        let spec = ResourceSpec::parse(Operation::ManagedDeployment, &deployment()).unwrap();
        let ResourceSpec::ManagedDeployment(deployment) = spec else {
            panic!("expected a managed deployment");
        };

        let ops: Vec<Operation> = deployment
            .clone()
            .into_steps()
            .iter()
            .map(ResourceSpec::operation)
            .collect();
        assert_eq!(
            ops,
            vec![
                Operation::CreateVm,
                Operation::CreateDisk,
                Operation::CreateNic,
                Operation::InitializeVm
            ]
        );

        let steps = deployment.into_steps();
        let ResourceSpec::InitializeVm(guest) = &steps[3] else {
            panic!("expected guest step last");
        };
        assert_eq!(guest.vm_name, "web-01");
        assert_eq!(guest.hostname.as_deref(), Some("web01"));
    }

    #[test]
    fn test_deployment_rejects_duplicate_disk_names() {
        let mut params = deployment();
        params["disks"] = json!([
            { "name": "data", "size_gb": 10 },
            { "name": "DATA", "size_gb": 20 }
        ]);
        let err = ResourceSpec::parse(Operation::ManagedDeployment, &params).unwrap_err();
        assert_eq!(err, SpecError::Duplicate("DATA".to_string()));
    }

    #[test]
    fn test_claims_conflict_rules() {
        let create = ResourceClaim::exclusive(ResourceKey::vm("web"));
        let disk_on_vm = ResourceClaim::shared(ResourceKey::vm("WEB"));
        let nic_on_vm = ResourceClaim::shared(ResourceKey::vm("web"));
        let other = ResourceClaim::exclusive(ResourceKey::vm("db"));

        assert!(create.conflicts_with(&disk_on_vm));
        assert!(!disk_on_vm.conflicts_with(&nic_on_vm));
        assert!(!create.conflicts_with(&other));
    }
}
