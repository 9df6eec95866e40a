// Core identifiers and enums shared across Taskhub realtime crates.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Errors raised when an identifier or room name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier must not contain ':'")]
    Separator,
    #[error("unknown room scope '{0}'")]
    UnknownScope(String),
    #[error("room name '{0}' is missing a scope prefix")]
    MissingScope(String),
}

fn validate_non_empty(value: &str) -> Result<(), IdError> {
    if value.trim().is_empty() {
        return Err(IdError::Empty);
    }
    Ok(())
}

/// A user identity as issued by the external identity provider.
///
/// The product uses database object ids rather than UUIDs, so this is an
/// opaque non-empty string. Provider-prefixed ids such as `google:123` are
/// accepted; room names split on the first `:` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_non_empty(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of a workspace, project, task or discussion owned by the data store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_non_empty(&value)?;
        if value.contains(':') {
            return Err(IdError::Separator);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A topic-scoped broadcast group.
///
/// Rendered as `{scope}:{id}`, e.g. `task:42` or `notifications:u1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomName {
    Workspace(ResourceId),
    Project(ResourceId),
    Task(ResourceId),
    User(UserId),
    Notifications(UserId),
    Discussion(ResourceId),
}

impl RoomName {
    pub fn scope(&self) -> &'static str {
        match self {
            Self::Workspace(_) => "workspace",
            Self::Project(_) => "project",
            Self::Task(_) => "task",
            Self::User(_) => "user",
            Self::Notifications(_) => "notifications",
            Self::Discussion(_) => "discussion",
        }
    }

    fn id(&self) -> &str {
        match self {
            Self::Workspace(id) | Self::Project(id) | Self::Task(id) | Self::Discussion(id) => {
                id.as_str()
            }
            Self::User(id) | Self::Notifications(id) => id.as_str(),
        }
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope(), self.id())
    }
}

impl FromStr for RoomName {
    type Err = IdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (scope, id) =
            value.split_once(':').ok_or_else(|| IdError::MissingScope(value.to_string()))?;
        match scope {
            "workspace" => Ok(Self::Workspace(ResourceId::new(id)?)),
            "project" => Ok(Self::Project(ResourceId::new(id)?)),
            "task" => Ok(Self::Task(ResourceId::new(id)?)),
            "user" => Ok(Self::User(UserId::new(id)?)),
            "notifications" => Ok(Self::Notifications(UserId::new(id)?)),
            "discussion" => Ok(Self::Discussion(ResourceId::new(id)?)),
            other => Err(IdError::UnknownScope(other.to_string())),
        }
    }
}

impl TryFrom<String> for RoomName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomName> for String {
    fn from(value: RoomName) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
}

/// How a call session was retired, as reported to each party.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    /// A connected call was hung up or lost.
    Ended,
    /// The call rang out without an answer (callee-side wording).
    Missed,
    /// The call rang out without an answer (caller-side wording).
    NoAnswer,
    /// The callee declined.
    Rejected,
}

impl CallOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::NoAnswer => "no-answer",
            Self::Rejected => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_render_with_scope_prefix() {
        let task = RoomName::Task(ResourceId::new("42").unwrap());
        let inbox = RoomName::Notifications(UserId::new("u1").unwrap());

        assert_eq!(task.to_string(), "task:42");
        assert_eq!(inbox.to_string(), "notifications:u1");
    }

    #[test]
    fn room_names_parse_every_scope() {
        for raw in [
            "workspace:w1",
            "project:p1",
            "task:t1",
            "user:u1",
            "notifications:u1",
            "discussion:d1",
        ] {
            let parsed: RoomName = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn room_name_rejects_unknown_scope_and_missing_prefix() {
        assert_eq!(
            "channel:1".parse::<RoomName>(),
            Err(IdError::UnknownScope("channel".to_string()))
        );
        assert!(matches!("task".parse::<RoomName>(), Err(IdError::MissingScope(_))));
        assert_eq!("task:".parse::<RoomName>(), Err(IdError::Empty));
    }

    #[test]
    fn identifiers_reject_empty_and_resource_separator() {
        assert_eq!(UserId::new("  "), Err(IdError::Empty));
        assert_eq!(ResourceId::new("a:b"), Err(IdError::Separator));
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
        assert_eq!(serde_json::from_str::<UserId>("\"u-7\"").unwrap().as_str(), "u-7");
    }

    #[test]
    fn provider_prefixed_user_ids_keep_their_rooms_intact() {
        let user = UserId::new("google:1234").unwrap();
        let dm = RoomName::User(user.clone());
        assert_eq!(dm.to_string(), "user:google:1234");
        assert_eq!("user:google:1234".parse::<RoomName>().unwrap(), dm);
        assert_eq!(
            "notifications:google:1234".parse::<RoomName>().unwrap(),
            RoomName::Notifications(user)
        );
        assert_eq!("task:a:b".parse::<RoomName>(), Err(IdError::Separator));
    }

    #[test]
    fn call_outcome_uses_kebab_case_on_the_wire() {
        assert_eq!(serde_json::to_value(CallOutcome::NoAnswer).unwrap(), "no-answer");
        assert_eq!(CallOutcome::NoAnswer.as_str(), "no-answer");
        assert_eq!(serde_json::to_value(CallType::Video).unwrap(), "video");
        assert_eq!(serde_json::to_value(PresenceStatus::Idle).unwrap(), "idle");
    }
}
