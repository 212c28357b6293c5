use serde::{Deserialize, Serialize};

#[cfg(feature = "schema")]
use schemars::JsonSchema;

use crate::{DeployTarget, OsType, SlotIndex, SourceHash, Tags, ValidationErrors};

/// Immutable configuration for one class of build-agent instances.
///
/// Every instance provisioned for this descriptor is named `<name_prefix><index>`
/// (lower-cased), deployed from `target`, and counted against `max_instances`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    /// Identifier of the image inside the orchestration server.
    pub source_id: String,
    /// What instances are provisioned from.
    pub target: DeployTarget,
    pub region: String,
    pub network_id: String,
    pub subnet_id: String,
    /// Upper bound of slots holding capacity at the same time.
    pub max_instances: u32,
    pub name_prefix: String,
    pub vm_size: String,
    /// Reactivate stopped instances instead of creating new ones.
    #[serde(default)]
    pub reuse_stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<OsType>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    /// Provider-specific managed identity attached to every instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl ImageDescriptor {
    /// Check the whole descriptor, collecting every defect.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();

        if self.source_id.trim().is_empty() {
            errs.push("source id is missing");
        }
        validate_prefix(&self.name_prefix, &mut errs);
        if self.max_instances == 0 {
            errs.push("max instances must be at least 1");
        }
        if self.region.trim().is_empty() {
            errs.push("region is missing");
        }
        if self.network_id.trim().is_empty() {
            errs.push("network id is missing");
        }
        if self.subnet_id.trim().is_empty() {
            errs.push("subnet id is missing");
        }
        if self.vm_size.trim().is_empty() {
            errs.push("vm size is missing");
        }
        if self.tags.iter().any(|(k, _)| k.trim().is_empty()) {
            errs.push("tags contain an empty key");
        }
        self.target.validate(self.os_type, &mut errs);

        errs.into_result()
    }

    /// Derived, case-normalised name of the slot at `index`.
    pub fn instance_name(&self, index: SlotIndex) -> String {
        format!("{}{}", self.name_prefix, index).to_lowercase()
    }

    /// Inverse of [`ImageDescriptor::instance_name`].
    ///
    /// Returns `None` for names that do not belong to this image, including
    /// non-canonical indices such as `agent-07`.
    pub fn parse_instance_index(&self, name: &str) -> Option<SlotIndex> {
        let name = name.to_lowercase();
        let prefix = self.name_prefix.to_lowercase();
        let digits = name.strip_prefix(&prefix)?;

        if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        digits.parse().ok()
    }

    /// Hash of the current deploy target.
    pub fn source_hash(&self) -> SourceHash {
        self.target.compute_hash()
    }
}

fn validate_prefix(prefix: &str, errs: &mut ValidationErrors) {
    let normalized = prefix.to_lowercase();

    let Some(first) = normalized.chars().next() else {
        errs.push("name prefix is missing");
        return;
    };
    if !first.is_ascii_lowercase() {
        errs.push(format!("name prefix must start with a letter: {prefix}"));
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        errs.push(format!(
            "name prefix may only contain letters, digits and '-': {prefix}"
        ));
    }
}
