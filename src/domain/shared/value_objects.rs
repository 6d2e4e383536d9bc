//! Shared value objects used across the presence and call contexts

use crate::domain::shared::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel identifier
///
/// Never empty. Unique per active call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::ValidationError(
                "channel id must not be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-level user identifier
///
/// `0` asks the transport to assign one on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(u32);

impl Uid {
    pub const AUTO: Uid = Uid(0);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_auto(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Uid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_rejects_blank() {
        assert!(ChannelId::parse("").is_err());
        assert!(ChannelId::parse("   ").is_err());
        assert_eq!(ChannelId::parse(" room-1 ").unwrap().as_str(), "room-1");
    }

    #[test]
    fn test_channel_id_deserialize_validates() {
        let ok: ChannelId = serde_json::from_str("\"room-9\"").unwrap();
        assert_eq!(ok.to_string(), "room-9");
        assert!(serde_json::from_str::<ChannelId>("\"\"").is_err());
    }

    #[test]
    fn test_uid_auto() {
        assert!(Uid::AUTO.is_auto());
        assert!(!Uid::new(5).is_auto());
        assert_eq!(Uid::from(7).value(), 7);
    }
}
