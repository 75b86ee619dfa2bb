//! Switch-local port numbers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A port number local to one device.
///
/// Accepts both the bare number and the `port/N` spelling used by
/// topology dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNumber(u32);

impl PortNumber {
    pub const fn new(port: u32) -> Self {
        PortNumber(port)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortNumber {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("port/").unwrap_or(s);
        digits
            .parse::<u32>()
            .map(PortNumber)
            .map_err(|_| ParseError::InvalidPortNumber(s.to_string()))
    }
}

impl From<u32> for PortNumber {
    fn from(port: u32) -> Self {
        PortNumber(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_forms() {
        assert_eq!("7".parse::<PortNumber>().unwrap(), PortNumber::new(7));
        assert_eq!("port/12".parse::<PortNumber>().unwrap(), PortNumber::new(12));
        assert!("eth0".parse::<PortNumber>().is_err());
    }
}
