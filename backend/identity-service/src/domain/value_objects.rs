use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::IdentityError;

/// User identifier: a ULID (48-bit millisecond timestamp + 80 random bits).
///
/// Sorts lexicographically in creation order and serializes as the 26-char
/// Crockford base32 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Ulid);

impl UserId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(id: &str) -> Result<Self, IdentityError> {
        Ok(Self(Ulid::from_string(id)?))
    }

    /// Creation instant embedded in the identifier
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.0.datetime())
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Account lifecycle status.
///
/// Normal flow is `Pending -> Registered -> Activated`; `Revoked` is terminal
/// and reachable from any state through deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Registered,
    Activated,
    Locked,
    Revoked,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Registered => "registered",
            Status::Activated => "activated",
            Status::Locked => "locked",
            Status::Revoked => "revoked",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "registered" => Ok(Status::Registered),
            "activated" => Ok(Status::Activated),
            "locked" => Ok(Status::Locked),
            "revoked" => Ok(Status::Revoked),
            other => Err(IdentityError::InvalidStatus(other.to_string())),
        }
    }
}

/// External identity sources a user can bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialProvider {
    Google,
    Facebook,
    Line,
    Passkeys,
}

impl SocialProvider {
    pub const ALL: [SocialProvider; 4] = [
        SocialProvider::Google,
        SocialProvider::Facebook,
        SocialProvider::Line,
        SocialProvider::Passkeys,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Facebook => "facebook",
            Self::Line => "line",
            Self::Passkeys => "passkeys",
        }
    }
}

impl fmt::Display for SocialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocialProvider {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "facebook" => Ok(Self::Facebook),
            "line" => Ok(Self::Line),
            "passkeys" => Ok(Self::Passkeys),
            other => Err(IdentityError::ProviderNotSupported(other.to_string())),
        }
    }
}

/// Provider-scoped subject identifier (the `sub` claim)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocialId(String);

impl SocialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SocialId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SocialId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Binding between a user and an external identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub social_id: SocialId,
    #[serde(rename = "social_provider")]
    pub provider: SocialProvider,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SocialAccount {
    pub fn new(provider: SocialProvider, social_id: SocialId) -> Self {
        let now = Utc::now();
        Self {
            social_id,
            provider,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn matches(&self, provider: SocialProvider, social_id: &SocialId) -> bool {
        self.provider == provider && &self.social_id == social_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_round_trips_through_string() {
        let id = UserId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 26);
        assert_eq!(UserId::parse(&text).unwrap(), id);
    }

    #[test]
    fn test_user_id_rejects_garbage() {
        assert!(matches!(
            UserId::parse("not-a-ulid"),
            Err(IdentityError::InvalidUserId(_))
        ));
    }

    #[test]
    fn test_user_id_timestamp_is_recent() {
        let before = Utc::now() - chrono::Duration::seconds(1);
        let id = UserId::new();
        let after = Utc::now() + chrono::Duration::seconds(1);
        assert!(id.timestamp() >= before && id.timestamp() <= after);
    }

    #[test]
    fn test_user_ids_sort_by_creation() {
        let first = UserId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = UserId::new();
        assert!(first < second);
        assert!(first.to_string() < second.to_string());
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!("Activated".parse::<Status>().unwrap(), Status::Activated);
        assert_eq!("REVOKED".parse::<Status>().unwrap(), Status::Revoked);
        assert!("archived".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_json_is_lowercase() {
        let json = serde_json::to_string(&Status::Registered).unwrap();
        assert_eq!(json, "\"registered\"");
        let parsed: Status = serde_json::from_str("\"locked\"").unwrap();
        assert_eq!(parsed, Status::Locked);
    }

    #[test]
    fn test_social_provider_parse() {
        assert_eq!(
            "google".parse::<SocialProvider>().unwrap(),
            SocialProvider::Google
        );
        assert!(matches!(
            "twitter".parse::<SocialProvider>(),
            Err(IdentityError::ProviderNotSupported(_))
        ));
    }

    #[test]
    fn test_social_account_json_field_names() {
        let account = SocialAccount::new(SocialProvider::Line, SocialId::new("U123"));
        let value = serde_json::to_value(&account).unwrap();
        assert_eq!(value["social_id"], "U123");
        assert_eq!(value["social_provider"], "line");
    }
}
