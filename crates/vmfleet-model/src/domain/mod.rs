mod kv;
pub use kv::KeyValue;

mod user_data;
pub use user_data::UserData;

mod tags;
pub use tags::Tags;

mod constants;
pub use constants::{
    TAG_IMAGE_ID, TAG_PROFILE_ID, TAG_SOURCE_HASH, USER_DATA_AGENT_NAME, USER_DATA_IMAGE_ID,
    USER_DATA_PROFILE_ID,
};

/// 1-based index of an instance slot within one image fleet.
///
/// Indices are never renumbered; the instance name is derived from it.
pub type SlotIndex = u32;

/// Timeout or delay value in milliseconds.
pub type TimeoutMs = u64;
