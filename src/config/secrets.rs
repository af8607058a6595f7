//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides the serde helper used for
//! connection URLs in config files.

pub use secrecy::{ExposeSecret, SecretString};

use serde::{Deserialize, Deserializer};

/// Deserialize an optional string straight into a `SecretString`.
pub fn deserialize_optional<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}
