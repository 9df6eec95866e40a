// Event envelopes for the taskhub-realtime WebSocket protocol.
//
// Every frame is a JSON object `{"event": "<name>", "data": <payload>}`.
// Event names keep the product's colon-separated vocabulary; payload fields
// are camelCase. Domain content (task update bodies, comments, messages,
// notifications) is carried as opaque JSON since the data store owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CallOutcome, CallType, PresenceStatus, ResourceId, UserId};

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join:workspace")]
    JoinWorkspace(ResourceId),
    #[serde(rename = "join:project")]
    JoinProject(ResourceId),
    #[serde(rename = "join:task")]
    JoinTask(ResourceId),
    #[serde(rename = "leave:workspace")]
    LeaveWorkspace(ResourceId),
    #[serde(rename = "leave:project")]
    LeaveProject(ResourceId),
    #[serde(rename = "leave:task")]
    LeaveTask(ResourceId),
    /// Binds the connection to a user and joins its direct-message room.
    #[serde(rename = "dm:join")]
    DmJoin(UserId),
    /// Binds the connection to a user and joins its notification room.
    #[serde(rename = "notification:join")]
    NotificationJoin(UserId),
    #[serde(rename = "discussion:join")]
    DiscussionJoin(ResourceId),
    #[serde(rename = "discussion:leave")]
    DiscussionLeave(ResourceId),
    #[serde(rename = "user:active")]
    UserActive(UserActive),
    #[serde(rename = "task:update")]
    TaskUpdate(TaskUpdate),
    #[serde(rename = "comment:add")]
    CommentAdd(CommentAdd),
    #[serde(rename = "typing:start")]
    TypingStart(TypingStart),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingStop),
    #[serde(rename = "dm:send")]
    DmSend(DirectMessage),
    #[serde(rename = "dm:typing")]
    DmTyping(DmTyping),
    #[serde(rename = "notification:send")]
    NotificationSend(NotificationSend),
    #[serde(rename = "notification:read")]
    NotificationRead(NotificationRead),
    #[serde(rename = "discussion:comment")]
    DiscussionComment(DiscussionPost),
    #[serde(rename = "discussion:reply")]
    DiscussionReply(DiscussionPost),
    #[serde(rename = "discussion:update")]
    DiscussionUpdate(DiscussionPost),
    #[serde(rename = "discussion:watch")]
    DiscussionWatch(DiscussionWatch),
    #[serde(rename = "discussion:reaction")]
    DiscussionReaction(DiscussionPost),
    #[serde(rename = "call:initiate")]
    CallInitiate(CallInitiate),
    #[serde(rename = "call:answer")]
    CallAnswer(CallAnswer),
    #[serde(rename = "call:reject")]
    CallReject(CallReject),
    #[serde(rename = "call:end")]
    CallEnd(CallEnd),
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate(IceCandidate),
    #[serde(rename = "call:renegotiate")]
    CallRenegotiate(Renegotiation),
}

impl ClientEvent {
    /// Every inbound event name, in declaration order.
    pub const NAMES: &'static [&'static str] = &[
        "join:workspace",
        "join:project",
        "join:task",
        "leave:workspace",
        "leave:project",
        "leave:task",
        "dm:join",
        "notification:join",
        "discussion:join",
        "discussion:leave",
        "user:active",
        "task:update",
        "comment:add",
        "typing:start",
        "typing:stop",
        "dm:send",
        "dm:typing",
        "notification:send",
        "notification:read",
        "discussion:comment",
        "discussion:reply",
        "discussion:update",
        "discussion:watch",
        "discussion:reaction",
        "call:initiate",
        "call:answer",
        "call:reject",
        "call:end",
        "call:ice-candidate",
        "call:renegotiate",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinWorkspace(_) => "join:workspace",
            Self::JoinProject(_) => "join:project",
            Self::JoinTask(_) => "join:task",
            Self::LeaveWorkspace(_) => "leave:workspace",
            Self::LeaveProject(_) => "leave:project",
            Self::LeaveTask(_) => "leave:task",
            Self::DmJoin(_) => "dm:join",
            Self::NotificationJoin(_) => "notification:join",
            Self::DiscussionJoin(_) => "discussion:join",
            Self::DiscussionLeave(_) => "discussion:leave",
            Self::UserActive(_) => "user:active",
            Self::TaskUpdate(_) => "task:update",
            Self::CommentAdd(_) => "comment:add",
            Self::TypingStart(_) => "typing:start",
            Self::TypingStop(_) => "typing:stop",
            Self::DmSend(_) => "dm:send",
            Self::DmTyping(_) => "dm:typing",
            Self::NotificationSend(_) => "notification:send",
            Self::NotificationRead(_) => "notification:read",
            Self::DiscussionComment(_) => "discussion:comment",
            Self::DiscussionReply(_) => "discussion:reply",
            Self::DiscussionUpdate(_) => "discussion:update",
            Self::DiscussionWatch(_) => "discussion:watch",
            Self::DiscussionReaction(_) => "discussion:reaction",
            Self::CallInitiate(_) => "call:initiate",
            Self::CallAnswer(_) => "call:answer",
            Self::CallReject(_) => "call:reject",
            Self::CallEnd(_) => "call:end",
            Self::CallIceCandidate(_) => "call:ice-candidate",
            Self::CallRenegotiate(_) => "call:renegotiate",
        }
    }

    /// Decode one inbound text frame.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw).map_err(DecodeError::Json)?;
        let event = value
            .get("event")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(DecodeError::MissingEvent)?;

        if !Self::NAMES.contains(&event.as_str()) {
            return Err(DecodeError::UnknownEvent(event));
        }

        serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { event, source })
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame is missing the `event` field")]
    MissingEvent,
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// The event name, when the frame got far enough to carry one.
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::UnknownEvent(event) | Self::InvalidPayload { event, .. } => Some(event),
            Self::Json(_) | Self::MissingEvent => None,
        }
    }

    /// The event name only when it is one of [`ClientEvent::NAMES`].
    pub fn known_event(&self) -> Option<&'static str> {
        match self {
            Self::InvalidPayload { event, .. } => {
                ClientEvent::NAMES.iter().copied().find(|name| *name == event.as_str())
            }
            Self::UnknownEvent(_) | Self::Json(_) | Self::MissingEvent => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserActive {
    pub user_id: UserId,
    pub workspace_id: ResourceId,
    pub location: String,
}

/// Inbound `task:update`; also the payload of `task:updated` / `task:changed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: ResourceId,
    pub workspace_id: ResourceId,
    pub project_id: ResourceId,
    #[serde(default)]
    pub update: Value,
    pub user_id: UserId,
}

/// Inbound `comment:add`; also the payload of `comment:added`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommentAdd {
    pub task_id: ResourceId,
    pub comment: Value,
    pub user_id: UserId,
}

/// Inbound `typing:start`; also the payload of `user:typing`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingStart {
    pub task_id: ResourceId,
    pub user_id: UserId,
    pub user_name: String,
}

/// Inbound `typing:stop`; also the payload of `user:stopped-typing`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingStop {
    pub task_id: ResourceId,
    pub user_id: UserId,
}

/// A direct message. The relay stamps `senderId` from the connection's
/// bound identity before forwarding it as `dm:new`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub recipient_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DmTyping {
    pub recipient_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DmTypingNotice {
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSend {
    pub user_id: UserId,
    pub notification: Value,
}

/// Inbound `notification:read`; echoed to the reader's other connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRead {
    pub user_id: UserId,
    pub notification_id: String,
}

/// A discussion comment, reply, update or reaction. Only the discussion id
/// is routed on; the rest is forwarded untouched. `userId` is stamped from
/// the sender's bound identity when there is one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionPost {
    pub discussion_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionWatch {
    pub discussion_id: ResourceId,
    pub user_id: UserId,
    #[serde(default = "default_true")]
    pub watching: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiate {
    pub to: UserId,
    #[serde(default)]
    pub from: Option<UserId>,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub from_avatar: Option<String>,
    pub call_type: CallType,
    #[serde(default)]
    pub signal: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswer {
    /// The caller being answered.
    pub to: UserId,
    #[serde(default)]
    pub from: Option<UserId>,
    #[serde(default)]
    pub signal: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallReject {
    pub to: UserId,
    #[serde(default)]
    pub from: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallEnd {
    pub to: UserId,
    #[serde(default)]
    pub from: Option<UserId>,
    #[serde(default)]
    pub missed: bool,
    #[serde(default)]
    pub no_answer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub to: UserId,
    #[serde(default)]
    pub from: Option<UserId>,
    pub candidate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Renegotiation {
    pub to: UserId,
    #[serde(default)]
    pub from: Option<UserId>,
    pub signal: Value,
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected(Connected),
    #[serde(rename = "user:presence")]
    Presence(PresenceUpdate),
    #[serde(rename = "user:offline")]
    Offline(PresenceOffline),
    #[serde(rename = "user:typing")]
    Typing(TypingStart),
    #[serde(rename = "user:stopped-typing")]
    StoppedTyping(TypingStop),
    #[serde(rename = "task:updated")]
    TaskUpdated(TaskUpdate),
    #[serde(rename = "task:changed")]
    TaskChanged(TaskUpdate),
    #[serde(rename = "comment:added")]
    CommentAdded(CommentAdd),
    #[serde(rename = "dm:new")]
    DirectMessage(DirectMessage),
    #[serde(rename = "dm:typing")]
    DmTyping(DmTypingNotice),
    #[serde(rename = "notification:new")]
    Notification(Value),
    #[serde(rename = "notification:read")]
    NotificationRead(NotificationRead),
    #[serde(rename = "discussion:comment:new")]
    DiscussionCommentAdded(DiscussionPost),
    #[serde(rename = "discussion:reply:new")]
    DiscussionReplyAdded(DiscussionPost),
    #[serde(rename = "discussion:updated")]
    DiscussionUpdated(DiscussionPost),
    #[serde(rename = "discussion:watchers:changed")]
    DiscussionWatchersChanged(DiscussionWatch),
    #[serde(rename = "discussion:reaction:added")]
    DiscussionReactionAdded(DiscussionPost),
    #[serde(rename = "call:incoming")]
    CallIncoming(IncomingCall),
    #[serde(rename = "call:answered")]
    CallAnswered(CallAnswered),
    #[serde(rename = "call:rejected")]
    CallRejected(CallRejected),
    #[serde(rename = "call:ended")]
    CallEnded(CallEnded),
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate(RelayedIceCandidate),
    #[serde(rename = "call:renegotiate")]
    CallRenegotiate(RelayedRenegotiation),
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

impl ServerEvent {
    /// Every outbound event name, in declaration order.
    pub const NAMES: &'static [&'static str] = &[
        "connected",
        "user:presence",
        "user:offline",
        "user:typing",
        "user:stopped-typing",
        "task:updated",
        "task:changed",
        "comment:added",
        "dm:new",
        "dm:typing",
        "notification:new",
        "notification:read",
        "discussion:comment:new",
        "discussion:reply:new",
        "discussion:updated",
        "discussion:watchers:changed",
        "discussion:reaction:added",
        "call:incoming",
        "call:answered",
        "call:rejected",
        "call:ended",
        "call:ice-candidate",
        "call:renegotiate",
        "error",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Presence(_) => "user:presence",
            Self::Offline(_) => "user:offline",
            Self::Typing(_) => "user:typing",
            Self::StoppedTyping(_) => "user:stopped-typing",
            Self::TaskUpdated(_) => "task:updated",
            Self::TaskChanged(_) => "task:changed",
            Self::CommentAdded(_) => "comment:added",
            Self::DirectMessage(_) => "dm:new",
            Self::DmTyping(_) => "dm:typing",
            Self::Notification(_) => "notification:new",
            Self::NotificationRead(_) => "notification:read",
            Self::DiscussionCommentAdded(_) => "discussion:comment:new",
            Self::DiscussionReplyAdded(_) => "discussion:reply:new",
            Self::DiscussionUpdated(_) => "discussion:updated",
            Self::DiscussionWatchersChanged(_) => "discussion:watchers:changed",
            Self::DiscussionReactionAdded(_) => "discussion:reaction:added",
            Self::CallIncoming(_) => "call:incoming",
            Self::CallAnswered(_) => "call:answered",
            Self::CallRejected(_) => "call:rejected",
            Self::CallEnded(_) => "call:ended",
            Self::CallIceCandidate(_) => "call:ice-candidate",
            Self::CallRenegotiate(_) => "call:renegotiate",
            Self::Error(_) => "error",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub heartbeat_interval_ms: u32,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub workspace_id: ResourceId,
    pub location: String,
    pub status: PresenceStatus,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceOffline {
    pub user_id: UserId,
    pub workspace_id: ResourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub from: UserId,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub from_avatar: Option<String>,
    pub call_type: CallType,
    pub signal: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswered {
    pub from: UserId,
    pub signal: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRejected {
    pub from: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub from: UserId,
    pub outcome: CallOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayedIceCandidate {
    pub from: UserId,
    pub candidate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayedRenegotiation {
    pub from: UserId,
    pub signal: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// The inbound event that failed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}
