//! Device identifiers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a switch in the fabric, e.g. `of:0000000000000001`.
///
/// Ordering is lexicographic on the textual id. Destination sets rely on
/// this to order the two members of a paired destination deterministically.
///
/// # Examples
///
/// ```
/// use sr_types::DeviceId;
///
/// let leaf: DeviceId = "of:0000000000000001".parse().unwrap();
/// assert_eq!(leaf.as_str(), "of:0000000000000001");
/// assert!("".parse::<DeviceId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id, rejecting empty ids and ids containing whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, ParseError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidDeviceId(id));
        }
        Ok(DeviceId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        DeviceId::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> String {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rejects_empty_and_whitespace() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("of:1 2").is_err());
        assert!(DeviceId::new("leaf1").is_ok());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = DeviceId::new("of:0000000000000001").unwrap();
        let b = DeviceId::new("of:0000000000000002").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_uses_plain_string() {
        let id = DeviceId::new("spine1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"spine1\"");
        assert!(serde_json::from_str::<DeviceId>("\"\"").is_err());
    }
}
