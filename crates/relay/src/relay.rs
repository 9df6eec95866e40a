// The relay instance: owns the registry, rooms, fan-out, presence and call
// signaling, runs the connect/disconnect lifecycle and dispatches decoded
// client events. Shared by `Arc` with the transport and with anything else
// that needs to publish.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskhub_common::{
    protocol::events::{
        CallAnswer, CallEnd, CallInitiate, CallReject, ClientEvent, CommentAdd, DirectMessage,
        DiscussionPost, DiscussionWatch, DmTyping, DmTypingNotice, IceCandidate,
        NotificationRead, RelayedIceCandidate, RelayedRenegotiation, Renegotiation, ServerEvent,
        TaskUpdate,
    },
    types::{RoomName, UserId},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::calls::{CallSignaling, CallerProfile, EndFlags, RingingCall};
use crate::config::RelayConfig;
use crate::error::{ErrorCode, RelayError};
use crate::fanout::FanOut;
use crate::metrics;
use crate::presence::{PresenceSettings, PresenceTracker, SweepReport};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::rooms::RoomManager;

#[derive(Debug, Clone, Copy, Default)]
pub struct RelaySettings {
    pub presence: PresenceSettings,
    /// Server-side ring timeout; `None` leaves it to the caller's client.
    pub ring_timeout: Option<Duration>,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            presence: PresenceSettings {
                typing_timeout: config.typing_timeout,
                idle_after: config.idle_after,
            },
            ring_timeout: config.ring_timeout,
        }
    }
}

#[derive(Debug)]
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    fanout: Arc<FanOut>,
    presence: PresenceTracker,
    calls: Arc<CallSignaling>,
    ring_timeout: Option<Duration>,
    started_at: Instant,
}

impl Relay {
    pub fn new(settings: RelaySettings) -> Self {
        let registry = Arc::new(ConnectionRegistry::default());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let fanout = Arc::new(FanOut::new(registry.clone(), rooms.clone()));
        let presence = PresenceTracker::new(registry.clone(), fanout.clone(), settings.presence);
        let calls = Arc::new(CallSignaling::new(fanout.clone()));

        Self {
            registry,
            rooms,
            fanout,
            presence,
            calls,
            ring_timeout: settings.ring_timeout,
            started_at: Instant::now(),
        }
    }

    /// Register a connection, pre-bound when the upgrade carried a verified
    /// identity.
    pub fn connect(
        &self,
        outbound: mpsc::UnboundedSender<ServerEvent>,
        user_id: Option<&UserId>,
    ) -> Result<ConnectionId, RelayError> {
        let connection_id = self.registry.connect(outbound);
        if let Some(user_id) = user_id {
            if let Err(error) = self.registry.bind(connection_id, user_id) {
                self.registry.begin_disconnect(connection_id);
                return Err(error);
            }
        }

        metrics::connection_opened();
        info!(
            connection_id = %connection_id,
            user_id = user_id.map(UserId::as_str).unwrap_or(""),
            "connection opened"
        );
        Ok(connection_id)
    }

    /// Tear a connection down. Safe to call more than once.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let Some(removed) = self.registry.begin_disconnect(connection_id) else {
            debug!(connection_id = %connection_id, "disconnect for unknown connection ignored");
            return;
        };

        let rooms_left = self.rooms.remove_everywhere(connection_id, removed.rooms.iter());
        self.presence.release_connection(connection_id);
        let ended_calls = match &removed.user_id {
            Some(user_id) => {
                self.calls
                    .handle_disconnect(connection_id, user_id, removed.user_still_connected)
                    .len()
            }
            None => 0,
        };

        metrics::connection_closed();
        let lifetime = Utc::now() - removed.connected_at;
        info!(
            connection_id = %connection_id,
            user_id = removed.user_id.as_ref().map(UserId::as_str).unwrap_or(""),
            rooms_left,
            ended_calls,
            lifetime_secs = lifetime.num_seconds(),
            "connection closed"
        );
    }

    /// Dispatch one event with panics contained to this event.
    pub fn handle_isolated(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RelayError> {
        let event_name = event.name();
        match catch_unwind(AssertUnwindSafe(|| self.handle(connection_id, event))) {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|message| (*message).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(
                    connection_id = %connection_id,
                    event = event_name,
                    panic = %detail,
                    "event handler panicked"
                );
                Err(RelayError::from_code(ErrorCode::InternalError))
            }
        }
    }

    pub fn handle(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RelayError> {
        match event {
            ClientEvent::JoinWorkspace(id) => self.join(connection_id, RoomName::Workspace(id)),
            ClientEvent::JoinProject(id) => self.join(connection_id, RoomName::Project(id)),
            ClientEvent::JoinTask(id) => self.join(connection_id, RoomName::Task(id)),
            ClientEvent::DiscussionJoin(id) => {
                self.join(connection_id, RoomName::Discussion(id))
            }
            ClientEvent::LeaveWorkspace(id) => self.leave(connection_id, RoomName::Workspace(id)),
            ClientEvent::LeaveProject(id) => self.leave(connection_id, RoomName::Project(id)),
            ClientEvent::LeaveTask(id) => self.leave(connection_id, RoomName::Task(id)),
            ClientEvent::DiscussionLeave(id) => {
                self.leave(connection_id, RoomName::Discussion(id))
            }
            // The `user:` and `notifications:` rooms record which tabs opted in;
            // delivery is addressed to the bound user, not the room.
            ClientEvent::DmJoin(user_id) => {
                self.registry.bind(connection_id, &user_id)?;
                self.join(connection_id, RoomName::User(user_id))
            }
            ClientEvent::NotificationJoin(user_id) => {
                self.registry.bind(connection_id, &user_id)?;
                self.join(connection_id, RoomName::Notifications(user_id))
            }
            ClientEvent::UserActive(active) => {
                self.registry.bind(connection_id, &active.user_id)?;
                self.presence.set_active(
                    connection_id,
                    &active.user_id,
                    &active.workspace_id,
                    &active.location,
                );
                Ok(())
            }
            ClientEvent::TaskUpdate(update) => self.task_update(connection_id, update),
            ClientEvent::CommentAdd(comment) => self.comment_add(connection_id, comment),
            ClientEvent::TypingStart(typing) => {
                self.check_claim(connection_id, &typing.user_id)?;
                self.presence.start_typing(connection_id, typing);
                Ok(())
            }
            ClientEvent::TypingStop(stop) => {
                self.check_claim(connection_id, &stop.user_id)?;
                self.presence.stop_typing(connection_id, stop);
                Ok(())
            }
            ClientEvent::DmSend(message) => self.direct_message(connection_id, message),
            ClientEvent::DmTyping(typing) => self.dm_typing(connection_id, typing),
            ClientEvent::NotificationSend(send) => {
                self.notify_user(&send.user_id, send.notification, Some(connection_id));
                Ok(())
            }
            ClientEvent::NotificationRead(read) => self.notification_read(connection_id, read),
            ClientEvent::DiscussionComment(post) => {
                self.discussion(connection_id, post, ServerEvent::DiscussionCommentAdded)
            }
            ClientEvent::DiscussionReply(post) => {
                self.discussion(connection_id, post, ServerEvent::DiscussionReplyAdded)
            }
            ClientEvent::DiscussionUpdate(post) => {
                self.discussion(connection_id, post, ServerEvent::DiscussionUpdated)
            }
            ClientEvent::DiscussionReaction(post) => {
                self.discussion(connection_id, post, ServerEvent::DiscussionReactionAdded)
            }
            ClientEvent::DiscussionWatch(watch) => self.discussion_watch(connection_id, watch),
            ClientEvent::CallInitiate(initiate) => self.call_initiate(connection_id, initiate),
            ClientEvent::CallAnswer(answer) => self.call_answer(connection_id, answer),
            ClientEvent::CallReject(reject) => self.call_reject(connection_id, reject),
            ClientEvent::CallEnd(end) => self.call_end(connection_id, end),
            ClientEvent::CallIceCandidate(candidate) => self.call_ice(connection_id, candidate),
            ClientEvent::CallRenegotiate(renegotiation) => {
                self.call_renegotiate(connection_id, renegotiation)
            }
        }
    }

    /// Push a notification to every connection of `user_id`. Entry point for
    /// the notification-creation path outside the socket protocol.
    pub fn notify_user(
        &self,
        user_id: &UserId,
        notification: Value,
        exclude: Option<ConnectionId>,
    ) -> usize {
        self.fanout.publish_to_user(user_id, ServerEvent::Notification(notification), exclude)
    }

    /// Periodic housekeeping for typing and idle presence.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        self.presence.sweep(now)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.size()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn calls(&self) -> &CallSignaling {
        &self.calls
    }

    fn join(&self, connection_id: ConnectionId, room: RoomName) -> Result<(), RelayError> {
        let joined = self.rooms.join(connection_id, room.clone())?;
        debug!(connection_id = %connection_id, room = %room, joined, "join");
        Ok(())
    }

    fn leave(&self, connection_id: ConnectionId, room: RoomName) -> Result<(), RelayError> {
        let left = self.rooms.leave(connection_id, &room);
        debug!(connection_id = %connection_id, room = %room, left, "leave");
        Ok(())
    }

    /// A `userId` in a payload must name the connection's identity once it
    /// has one. Unbound connections are taken at their word.
    fn check_claim(&self, connection_id: ConnectionId, claimed: &UserId) -> Result<(), RelayError> {
        match self.registry.user_for(connection_id) {
            Some(bound) if &bound != claimed => Err(RelayError::new(
                ErrorCode::ValidationFailed,
                format!("userId {claimed} does not match the connection's user"),
            )),
            _ => Ok(()),
        }
    }

    /// The bound user, after checking an optional `from` claim against it.
    fn acting_user(
        &self,
        connection_id: ConnectionId,
        claimed: Option<&UserId>,
    ) -> Result<UserId, RelayError> {
        let user_id = self.registry.require_user(connection_id)?;
        if let Some(claimed) = claimed {
            self.check_claim(connection_id, claimed)?;
        }
        Ok(user_id)
    }

    fn task_update(
        &self,
        connection_id: ConnectionId,
        update: TaskUpdate,
    ) -> Result<(), RelayError> {
        self.check_claim(connection_id, &update.user_id)?;
        let task_room = RoomName::Task(update.task_id.clone());
        let project_room = RoomName::Project(update.project_id.clone());
        let workspace_room = RoomName::Workspace(update.workspace_id.clone());

        let exclude = Some(connection_id);
        self.fanout.publish(&task_room, ServerEvent::TaskUpdated(update.clone()), exclude);
        self.fanout.publish(&project_room, ServerEvent::TaskChanged(update.clone()), exclude);
        self.fanout.publish(&workspace_room, ServerEvent::TaskChanged(update), exclude);
        Ok(())
    }

    fn comment_add(
        &self,
        connection_id: ConnectionId,
        comment: CommentAdd,
    ) -> Result<(), RelayError> {
        self.check_claim(connection_id, &comment.user_id)?;
        let room = RoomName::Task(comment.task_id.clone());
        self.fanout.publish(&room, ServerEvent::CommentAdded(comment), Some(connection_id));
        Ok(())
    }

    fn direct_message(
        &self,
        connection_id: ConnectionId,
        mut message: DirectMessage,
    ) -> Result<(), RelayError> {
        let sender = self.acting_user(connection_id, message.sender_id.as_ref())?;
        message.sender_id = Some(sender);
        let recipient = message.recipient_id.clone();
        self.fanout.publish_to_user(
            &recipient,
            ServerEvent::DirectMessage(message),
            Some(connection_id),
        );
        Ok(())
    }

    fn dm_typing(&self, connection_id: ConnectionId, typing: DmTyping) -> Result<(), RelayError> {
        let sender = self.acting_user(connection_id, None)?;
        let notice = DmTypingNotice { user_id: sender, is_typing: typing.is_typing };
        self.fanout.publish_to_user(
            &typing.recipient_id,
            ServerEvent::DmTyping(notice),
            Some(connection_id),
        );
        Ok(())
    }

    fn notification_read(
        &self,
        connection_id: ConnectionId,
        read: NotificationRead,
    ) -> Result<(), RelayError> {
        let reader = self.acting_user(connection_id, Some(&read.user_id))?;
        self.fanout.publish_to_user(
            &reader,
            ServerEvent::NotificationRead(read),
            Some(connection_id),
        );
        Ok(())
    }

    fn discussion(
        &self,
        connection_id: ConnectionId,
        mut post: DiscussionPost,
        outbound: fn(DiscussionPost) -> ServerEvent,
    ) -> Result<(), RelayError> {
        if let Some(claimed) = &post.user_id {
            self.check_claim(connection_id, claimed)?;
        }
        if let Some(bound) = self.registry.user_for(connection_id) {
            post.user_id = Some(bound);
        }

        let room = RoomName::Discussion(post.discussion_id.clone());
        self.fanout.publish(&room, outbound(post), Some(connection_id));
        Ok(())
    }

    fn discussion_watch(
        &self,
        connection_id: ConnectionId,
        watch: DiscussionWatch,
    ) -> Result<(), RelayError> {
        self.check_claim(connection_id, &watch.user_id)?;
        let room = RoomName::Discussion(watch.discussion_id.clone());
        self.fanout.publish(
            &room,
            ServerEvent::DiscussionWatchersChanged(watch),
            Some(connection_id),
        );
        Ok(())
    }

    fn call_initiate(
        &self,
        connection_id: ConnectionId,
        initiate: CallInitiate,
    ) -> Result<(), RelayError> {
        let caller = self.acting_user(connection_id, initiate.from.as_ref())?;
        let profile = CallerProfile { name: initiate.from_name, avatar: initiate.from_avatar };
        let ringing = self.calls.initiate(
            connection_id,
            &caller,
            &initiate.to,
            initiate.call_type,
            profile,
            initiate.signal,
        )?;

        if ringing.rung == 0 {
            debug!(pair = %ringing.key, "callee has no connections, call left ringing");
        }
        self.arm_ring_timeout(ringing);
        Ok(())
    }

    fn call_answer(
        &self,
        connection_id: ConnectionId,
        answer: CallAnswer,
    ) -> Result<(), RelayError> {
        let callee = self.acting_user(connection_id, answer.from.as_ref())?;
        self.calls.answer(connection_id, &callee, &answer.to, answer.signal)
    }

    fn call_reject(
        &self,
        connection_id: ConnectionId,
        reject: CallReject,
    ) -> Result<(), RelayError> {
        let callee = self.acting_user(connection_id, reject.from.as_ref())?;
        self.calls.reject(&callee, &reject.to).map(|_| ())
    }

    fn call_end(&self, connection_id: ConnectionId, end: CallEnd) -> Result<(), RelayError> {
        let party = self.acting_user(connection_id, end.from.as_ref())?;
        let flags = EndFlags { missed: end.missed, no_answer: end.no_answer };
        self.calls.end(&party, &end.to, flags).map(|_| ())
    }

    fn call_ice(&self, connection_id: ConnectionId, ice: IceCandidate) -> Result<(), RelayError> {
        let from = self.acting_user(connection_id, ice.from.as_ref())?;
        let event = ServerEvent::CallIceCandidate(RelayedIceCandidate {
            from: from.clone(),
            candidate: ice.candidate,
        });
        self.calls.relay(&from, &ice.to, event).map(|_| ())
    }

    fn call_renegotiate(
        &self,
        connection_id: ConnectionId,
        renegotiation: Renegotiation,
    ) -> Result<(), RelayError> {
        let from = self.acting_user(connection_id, renegotiation.from.as_ref())?;
        let event = ServerEvent::CallRenegotiate(RelayedRenegotiation {
            from: from.clone(),
            signal: renegotiation.signal,
        });
        self.calls.relay(&from, &renegotiation.to, event).map(|_| ())
    }

    fn arm_ring_timeout(&self, ringing: RingingCall) {
        let Some(timeout) = self.ring_timeout else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(pair = %ringing.key, "no async runtime, ring timeout not armed");
            return;
        };

        let calls = self.calls.clone();
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            calls.expire_ringing(&ringing.key, ringing.session_id);
        });
    }
}
