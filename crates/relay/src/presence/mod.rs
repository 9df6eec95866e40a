// Presence and typing: ephemeral UI hints, last-write-wins, never persisted
// and never queried over the wire.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use taskhub_common::{
    protocol::events::{PresenceOffline, PresenceUpdate, ServerEvent, TypingStart, TypingStop},
    types::{PresenceStatus, ResourceId, RoomName, UserId},
};
use tracing::debug;

use crate::fanout::FanOut;
use crate::registry::{ConnectionId, ConnectionRegistry};

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct PresenceSettings {
    pub typing_timeout: Duration,
    pub idle_after: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self { typing_timeout: DEFAULT_TYPING_TIMEOUT, idle_after: DEFAULT_IDLE_AFTER }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PresenceKey {
    user_id: UserId,
    workspace_id: ResourceId,
}

#[derive(Debug)]
struct PresenceEntry {
    location: String,
    status: PresenceStatus,
    last_updated_at: DateTime<Utc>,
    connections: HashSet<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TypingKey {
    task_id: ResourceId,
    user_id: UserId,
}

#[derive(Debug)]
struct TypingState {
    user_name: String,
    connection_id: ConnectionId,
    started_at: DateTime<Utc>,
}

/// What one `sweep` pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub typing_expired: usize,
    pub went_idle: usize,
}

#[derive(Debug)]
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<FanOut>,
    presence: DashMap<PresenceKey, PresenceEntry>,
    typing: DashMap<TypingKey, TypingState>,
    typing_timeout: TimeDelta,
    idle_after: TimeDelta,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<FanOut>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            registry,
            fanout,
            presence: DashMap::new(),
            typing: DashMap::new(),
            typing_timeout: to_time_delta(settings.typing_timeout),
            idle_after: to_time_delta(settings.idle_after),
        }
    }

    /// Record that `user_id` is active at `location` and tell the workspace,
    /// excluding every connection of that user.
    pub fn set_active(
        &self,
        connection_id: ConnectionId,
        user_id: &UserId,
        workspace_id: &ResourceId,
        location: &str,
    ) -> usize {
        let now = Utc::now();
        let key = PresenceKey { user_id: user_id.clone(), workspace_id: workspace_id.clone() };
        {
            let mut entry = self.presence.entry(key).or_insert_with(|| PresenceEntry {
                location: String::new(),
                status: PresenceStatus::Active,
                last_updated_at: now,
                connections: HashSet::new(),
            });
            entry.location = location.to_string();
            entry.status = PresenceStatus::Active;
            entry.last_updated_at = now;
            entry.connections.insert(connection_id);
        }

        let mut excluded = self.registry.lookup_connections(user_id);
        excluded.insert(connection_id);

        let update = PresenceUpdate {
            user_id: user_id.clone(),
            workspace_id: workspace_id.clone(),
            location: location.to_string(),
            status: PresenceStatus::Active,
            last_updated_at: now,
        };
        self.fanout.publish_excluding(
            &RoomName::Workspace(workspace_id.clone()),
            ServerEvent::Presence(update),
            &excluded,
        )
    }

    pub fn start_typing(&self, connection_id: ConnectionId, typing: TypingStart) -> usize {
        let key = TypingKey { task_id: typing.task_id.clone(), user_id: typing.user_id.clone() };
        self.typing.insert(
            key,
            TypingState {
                user_name: typing.user_name.clone(),
                connection_id,
                started_at: Utc::now(),
            },
        );

        let room = RoomName::Task(typing.task_id.clone());
        self.fanout.publish(&room, ServerEvent::Typing(typing), Some(connection_id))
    }

    /// Clear typing state and broadcast the stop even when none was recorded.
    pub fn stop_typing(&self, connection_id: ConnectionId, stop: TypingStop) -> usize {
        self.typing
            .remove(&TypingKey { task_id: stop.task_id.clone(), user_id: stop.user_id.clone() });

        let room = RoomName::Task(stop.task_id.clone());
        self.fanout.publish(&room, ServerEvent::StoppedTyping(stop), Some(connection_id))
    }

    /// Expire stale typing state and mark unrefreshed presence idle.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let typing_cutoff = cutoff(now, self.typing_timeout);
        let stale_typing: Vec<TypingKey> = self
            .typing
            .iter()
            .filter(|state| state.started_at <= typing_cutoff)
            .map(|state| state.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for key in stale_typing {
            let removed =
                self.typing.remove_if(&key, |_, state| state.started_at <= typing_cutoff);
            if let Some((key, _)) = removed {
                report.typing_expired += 1;
                self.publish_stopped_typing(key, None);
            }
        }

        let idle_cutoff = cutoff(now, self.idle_after);
        let mut idle_updates = Vec::new();
        for mut entry in self.presence.iter_mut() {
            if entry.status == PresenceStatus::Active && entry.last_updated_at <= idle_cutoff {
                entry.status = PresenceStatus::Idle;
                idle_updates.push(PresenceUpdate {
                    user_id: entry.key().user_id.clone(),
                    workspace_id: entry.key().workspace_id.clone(),
                    location: entry.location.clone(),
                    status: PresenceStatus::Idle,
                    last_updated_at: entry.last_updated_at,
                });
            }
        }

        report.went_idle = idle_updates.len();
        for update in idle_updates {
            let room = RoomName::Workspace(update.workspace_id.clone());
            self.fanout.publish(&room, ServerEvent::Presence(update), None);
        }

        if report != SweepReport::default() {
            debug!(
                typing_expired = report.typing_expired,
                went_idle = report.went_idle,
                "presence sweep"
            );
        }
        report
    }

    /// Drop everything `connection_id` contributed. Presence entries left
    /// with no contributor are removed and announced as offline.
    pub fn release_connection(&self, connection_id: ConnectionId) {
        let contributed: Vec<PresenceKey> = self
            .presence
            .iter()
            .filter(|entry| entry.connections.contains(&connection_id))
            .map(|entry| entry.key().clone())
            .collect();

        for key in contributed {
            let went_offline = match self.presence.entry(key) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().connections.remove(&connection_id);
                    if entry.get().connections.is_empty() {
                        let (key, _) = entry.remove_entry();
                        Some(key)
                    } else {
                        None
                    }
                }
                Entry::Vacant(_) => None,
            };

            if let Some(key) = went_offline {
                let room = RoomName::Workspace(key.workspace_id.clone());
                let offline =
                    PresenceOffline { user_id: key.user_id, workspace_id: key.workspace_id };
                self.fanout.publish(&room, ServerEvent::Offline(offline), None);
            }
        }

        let typed: Vec<TypingKey> = self
            .typing
            .iter()
            .filter(|state| state.connection_id == connection_id)
            .map(|state| state.key().clone())
            .collect();
        for key in typed {
            if let Some((key, _)) =
                self.typing.remove_if(&key, |_, state| state.connection_id == connection_id)
            {
                self.publish_stopped_typing(key, None);
            }
        }
    }

    /// Presence entries for one workspace, ordered by user. Diagnostics only.
    pub fn snapshot(&self, workspace_id: &ResourceId) -> Vec<PresenceUpdate> {
        let mut entries: Vec<PresenceUpdate> = self
            .presence
            .iter()
            .filter(|entry| &entry.key().workspace_id == workspace_id)
            .map(|entry| PresenceUpdate {
                user_id: entry.key().user_id.clone(),
                workspace_id: entry.key().workspace_id.clone(),
                location: entry.location.clone(),
                status: entry.status,
                last_updated_at: entry.last_updated_at,
            })
            .collect();
        entries.sort_by(|left, right| left.user_id.cmp(&right.user_id));
        entries
    }

    pub fn typing_in(&self, task_id: &ResourceId) -> Vec<(UserId, String)> {
        let mut typers: Vec<_> = self
            .typing
            .iter()
            .filter(|state| &state.key().task_id == task_id)
            .map(|state| (state.key().user_id.clone(), state.user_name.clone()))
            .collect();
        typers.sort();
        typers
    }

    fn publish_stopped_typing(&self, key: TypingKey, exclude: Option<ConnectionId>) {
        let room = RoomName::Task(key.task_id.clone());
        let stop = TypingStop { task_id: key.task_id, user_id: key.user_id };
        self.fanout.publish(&room, ServerEvent::StoppedTyping(stop), exclude);
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn cutoff(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
