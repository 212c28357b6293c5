mod domain;
pub use domain::{
    KeyValue, SlotIndex, Tags, TimeoutMs, UserData, TAG_IMAGE_ID, TAG_PROFILE_ID,
    TAG_SOURCE_HASH, USER_DATA_AGENT_NAME, USER_DATA_IMAGE_ID, USER_DATA_PROFILE_ID,
};

mod error;
pub use error::{ModelError, ModelResult, ValidationErrors};

mod status;
pub use status::{InstanceStatus, ProviderInstance, ProviderState};

mod target;
pub use target::{DeployTarget, OsType, ProvisionSpec, SourceHash};

mod image;
pub use image::ImageDescriptor;

mod strategy;
pub use strategy::RetryStrategy;

mod config;
pub use config::FleetConfig;
