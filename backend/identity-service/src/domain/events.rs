//! Domain events emitted by the `User` aggregate.
//!
//! Every event travels on the subject `users.<user id>.<routing key>`. The
//! transport only sees that subject and opaque JSON bytes, so decoding goes
//! through [`DECODERS`], a fixed table from event name to decoder.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::aggregates::User;
use super::value_objects::{SocialAccount, Status, UserId};
use crate::error::{IdentityError, Result};

/// Subject prefix shared by all user events
pub const SUBJECT_PREFIX: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    UserRegistered,
    UserActivated,
    UserSocialAccountAdded,
    UserSocialAccountRemoved,
    UserDeleted,
}

impl EventName {
    pub const ALL: [EventName; 5] = [
        EventName::UserRegistered,
        EventName::UserActivated,
        EventName::UserSocialAccountAdded,
        EventName::UserSocialAccountRemoved,
        EventName::UserDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::UserRegistered => "user_registered",
            EventName::UserActivated => "user_activated",
            EventName::UserSocialAccountAdded => "user_social_account_added",
            EventName::UserSocialAccountRemoved => "user_social_account_removed",
            EventName::UserDeleted => "user_deleted",
        }
    }

    /// Last subject segment
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventName::UserRegistered => "registered",
            EventName::UserActivated => "activated",
            EventName::UserSocialAccountAdded => "social_account_added",
            EventName::UserSocialAccountRemoved => "social_account_removed",
            EventName::UserDeleted => "deleted",
        }
    }

    pub fn from_routing_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.routing_key() == key)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| IdentityError::InvalidEvent(format!("unknown event name: {}", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user: User,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivated {
    pub user_id: UserId,
    pub status: Status,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSocialAccountAdded {
    pub user_id: UserId,
    pub account: SocialAccount,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSocialAccountRemoved {
    pub user_id: UserId,
    pub account: SocialAccount,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Closed set of events a user aggregate can emit
#[derive(Debug, Clone)]
pub enum UserEvent {
    Registered(UserRegistered),
    Activated(UserActivated),
    SocialAccountAdded(UserSocialAccountAdded),
    SocialAccountRemoved(UserSocialAccountRemoved),
    Deleted(UserDeleted),
}

type Decoder = fn(&[u8]) -> Result<UserEvent>;

fn decode_as<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| IdentityError::InvalidEvent(format!("malformed payload: {}", e)))
}

/// Event name to payload decoder
pub const DECODERS: [(EventName, Decoder); 5] = [
    (EventName::UserRegistered, |p| {
        decode_as(p).map(UserEvent::Registered)
    }),
    (EventName::UserActivated, |p| {
        decode_as(p).map(UserEvent::Activated)
    }),
    (EventName::UserSocialAccountAdded, |p| {
        decode_as(p).map(UserEvent::SocialAccountAdded)
    }),
    (EventName::UserSocialAccountRemoved, |p| {
        decode_as(p).map(UserEvent::SocialAccountRemoved)
    }),
    (EventName::UserDeleted, |p| decode_as(p).map(UserEvent::Deleted)),
];

impl UserEvent {
    pub fn name(&self) -> EventName {
        match self {
            UserEvent::Registered(_) => EventName::UserRegistered,
            UserEvent::Activated(_) => EventName::UserActivated,
            UserEvent::SocialAccountAdded(_) => EventName::UserSocialAccountAdded,
            UserEvent::SocialAccountRemoved(_) => EventName::UserSocialAccountRemoved,
            UserEvent::Deleted(_) => EventName::UserDeleted,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            UserEvent::Registered(e) => e.user.id(),
            UserEvent::Activated(e) => e.user_id,
            UserEvent::SocialAccountAdded(e) => e.user_id,
            UserEvent::SocialAccountRemoved(e) => e.user_id,
            UserEvent::Deleted(e) => e.user_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UserEvent::Registered(e) => e.occurred_at,
            UserEvent::Activated(e) => e.occurred_at,
            UserEvent::SocialAccountAdded(e) => e.occurred_at,
            UserEvent::SocialAccountRemoved(e) => e.occurred_at,
            UserEvent::Deleted(e) => e.occurred_at,
        }
    }

    /// `users.<user id>.<routing key>`
    pub fn subject(&self) -> String {
        format!(
            "{}.{}.{}",
            SUBJECT_PREFIX,
            self.user_id(),
            self.name().routing_key()
        )
    }

    /// JSON payload of the concrete event, without any envelope
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            UserEvent::Registered(e) => serde_json::to_vec(e),
            UserEvent::Activated(e) => serde_json::to_vec(e),
            UserEvent::SocialAccountAdded(e) => serde_json::to_vec(e),
            UserEvent::SocialAccountRemoved(e) => serde_json::to_vec(e),
            UserEvent::Deleted(e) => serde_json::to_vec(e),
        };
        Ok(payload?)
    }

    /// Recover a typed event from a subject and its payload
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self> {
        let (user_id, name) = parse_subject(subject)?;

        let decoder = DECODERS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, decoder)| *decoder)
            .ok_or_else(|| IdentityError::InvalidEvent(format!("no decoder for {}", name)))?;

        let event = decoder(payload)?;
        if event.user_id() != user_id {
            return Err(IdentityError::InvalidEvent(format!(
                "subject user {} does not match payload user {}",
                user_id,
                event.user_id()
            )));
        }

        Ok(event)
    }
}

/// Split `users.<user id>.<routing key>` into its typed parts
pub fn parse_subject(subject: &str) -> Result<(UserId, EventName)> {
    let parts: Vec<&str> = subject.split('.').collect();
    let [prefix, id, key] = parts.as_slice() else {
        return Err(IdentityError::InvalidEvent(format!(
            "malformed subject: {}",
            subject
        )));
    };

    if *prefix != SUBJECT_PREFIX {
        return Err(IdentityError::InvalidEvent(format!(
            "unexpected subject prefix: {}",
            subject
        )));
    }

    let user_id = UserId::parse(id)?;
    let name = EventName::from_routing_key(key)
        .ok_or_else(|| IdentityError::InvalidEvent(format!("unknown routing key: {}", key)))?;

    Ok((user_id, name))
}
