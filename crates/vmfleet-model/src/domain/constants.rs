//! Well-known keys shared by the controller and API connectors.

/// User-data key carrying the derived instance name, used by the agent as its own name.
pub const USER_DATA_AGENT_NAME: &str = "AGENT_NAME";

/// User-data key carrying the cloud profile identifier of the orchestration server.
pub const USER_DATA_PROFILE_ID: &str = "PROFILE_ID";

/// User-data key carrying the image `source_id`.
pub const USER_DATA_IMAGE_ID: &str = "IMAGE_ID";

/// Resource tag holding the [`crate::SourceHash`] an instance was deployed from.
///
/// Reconciliation compares it against the current descriptor to spot outdated instances.
pub const TAG_SOURCE_HASH: &str = "vmfleet-source-hash";

/// Resource tag holding the image `source_id`.
pub const TAG_IMAGE_ID: &str = "vmfleet-image-id";

/// Resource tag holding the cloud profile identifier.
pub const TAG_PROFILE_ID: &str = "vmfleet-profile-id";
