//! Deploy targets: what an image descriptor provisions from.
//!
//! The set of targets is closed. Each variant validates its own fields, shapes
//! the [`ProvisionSpec`] handed to the API connector and contributes a
//! [`SourceHash`] used to recognise instances deployed from an older source.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[cfg(feature = "schema")]
use schemars::JsonSchema;

use crate::{
    ImageDescriptor, TAG_IMAGE_ID, TAG_SOURCE_HASH, Tags, UserData, ValidationErrors,
    error::{ModelError, ModelResult},
};

/// User-data key carrying the container image for [`DeployTarget::Container`].
const USER_DATA_CONTAINER_IMAGE: &str = "CONTAINER_IMAGE";

/// User-data key carrying the container command line for [`DeployTarget::Container`].
const USER_DATA_CONTAINER_COMMAND: &str = "CONTAINER_COMMAND";

/// Guest operating system family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "windows",
        }
    }
}

impl FromStr for OsType {
    type Err = ModelError;
    fn from_str(s: &str) -> ModelResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "windows" => Ok(OsType::Windows),
            other => Err(ModelError::UnknownOsType(other.to_string())),
        }
    }
}

/// Source an instance is provisioned from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DeployTarget {
    /// Managed or gallery image.
    Image { image_id: String },
    /// Generalized VHD blob.
    Vhd { image_url: String },
    /// Container started on a container-optimised host.
    Container {
        image: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        command: Vec<String>,
    },
    /// Pre-built deployment template passed through to the provider.
    Template { template: serde_json::Value },
}

impl DeployTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            DeployTarget::Image { .. } => "image",
            DeployTarget::Vhd { .. } => "vhd",
            DeployTarget::Container { .. } => "container",
            DeployTarget::Template { .. } => "template",
        }
    }

    /// Record every problem with this target into `errs`.
    pub fn validate(&self, os_type: Option<OsType>, errs: &mut ValidationErrors) {
        match self {
            DeployTarget::Image { image_id } => {
                if image_id.trim().is_empty() {
                    errs.push("image target: image id is missing");
                }
            }
            DeployTarget::Vhd { image_url } => {
                if image_url.trim().is_empty() {
                    errs.push("vhd target: image url is missing");
                } else if !(image_url.starts_with("https://") || image_url.starts_with("http://"))
                {
                    errs.push(format!("vhd target: image url is not http(s): {image_url}"));
                }
                if os_type.is_none() {
                    errs.push("vhd target: os type is missing");
                }
            }
            DeployTarget::Container { image, .. } => {
                if image.trim().is_empty() {
                    errs.push("container target: image is missing");
                }
            }
            DeployTarget::Template { template } => match template.as_object() {
                Some(obj) if !obj.is_empty() => {}
                Some(_) => errs.push("template target: template is empty"),
                None => errs.push("template target: template must be a JSON object"),
            },
        }
    }

    /// Build the provider request for one instance of `image`.
    pub fn prepare_spec(
        &self,
        image: &ImageDescriptor,
        name: &str,
        user_data: UserData,
    ) -> ProvisionSpec {
        let hash = self.compute_hash();

        let mut tags = image.tags.clone();
        tags.insert(TAG_IMAGE_ID, image.source_id.as_str());
        tags.insert(TAG_SOURCE_HASH, hash.as_str());

        let user_data = match self {
            DeployTarget::Container { image, command } => {
                let mut data = user_data.with(USER_DATA_CONTAINER_IMAGE, image.as_str());
                if !command.is_empty() {
                    data.push(USER_DATA_CONTAINER_COMMAND, command.join(" "));
                }
                data
            }
            _ => user_data,
        };
        let os_type = match self {
            DeployTarget::Container { .. } => Some(image.os_type.unwrap_or(OsType::Linux)),
            _ => image.os_type,
        };

        ProvisionSpec {
            name: name.to_string(),
            region: image.region.clone(),
            vm_size: image.vm_size.clone(),
            network_id: image.network_id.clone(),
            subnet_id: image.subnet_id.clone(),
            os_type,
            identity: image.identity.clone(),
            target: self.clone(),
            source_hash: hash,
            user_data,
            tags,
        }
    }

    /// Digest of the target definition.
    pub fn compute_hash(&self) -> SourceHash {
        // serde_json maps are sorted, so the encoding is canonical for a given target.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        SourceHash(format!("sha256:{}", hex::encode(&digest[..16])))
    }
}

/// Identity of the deploy target an instance was created from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceHash(String);

impl SourceHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything an API connector needs to create or start one instance.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionSpec {
    pub name: String,
    pub region: String,
    pub vm_size: String,
    pub network_id: String,
    pub subnet_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<OsType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub target: DeployTarget,
    pub source_hash: SourceHash,
    pub user_data: UserData,
    pub tags: Tags,
}
