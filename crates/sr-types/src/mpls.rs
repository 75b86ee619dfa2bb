//! MPLS label type.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 20-bit MPLS label.
///
/// In segment routing the label pushed towards a destination switch is that
/// switch's node segment id.
///
/// # Examples
///
/// ```
/// use sr_types::MplsLabel;
///
/// let label = MplsLabel::new(100).unwrap();
/// assert_eq!(label.as_u32(), 100);
/// assert!(MplsLabel::new(1 << 20).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MplsLabel(u32);

impl MplsLabel {
    /// Largest value representable in the 20-bit label field.
    pub const MAX: u32 = 0x000F_FFFF;

    pub const fn new(label: u32) -> Result<Self, ParseError> {
        if label <= Self::MAX {
            Ok(MplsLabel(label))
        } else {
            Err(ParseError::InvalidMplsLabel(label))
        }
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MplsLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MplsLabel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s.parse().map_err(|_| ParseError::InvalidMplsLabel(0))?;
        MplsLabel::new(value)
    }
}

impl TryFrom<u32> for MplsLabel {
    type Error = ParseError;

    fn try_from(label: u32) -> Result<Self, Self::Error> {
        MplsLabel::new(label)
    }
}

impl From<MplsLabel> for u32 {
    fn from(label: MplsLabel) -> u32 {
        label.0
    }
}
