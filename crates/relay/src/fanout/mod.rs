// Messaging fan-out: deliver one event to a room or to every connection of
// a user. Fire-and-forget and at-most-once; no acknowledgement or retry.

use std::{collections::HashSet, sync::Arc};

use taskhub_common::{protocol::events::ServerEvent, types::RoomName, types::UserId};
use tracing::debug;

use crate::metrics;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::rooms::RoomManager;

#[derive(Debug)]
pub struct FanOut {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
}

impl FanOut {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomManager>) -> Self {
        Self { registry, rooms }
    }

    /// Deliver to every member of `room`, skipping `exclude`.
    pub fn publish(
        &self,
        room: &RoomName,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let excluded: HashSet<ConnectionId> = exclude.into_iter().collect();
        self.publish_excluding(room, event, &excluded)
    }

    /// Deliver to every member of `room` not in `excluded`.
    pub fn publish_excluding(
        &self,
        room: &RoomName,
        event: ServerEvent,
        excluded: &HashSet<ConnectionId>,
    ) -> usize {
        let event_name = event.name();
        let delivered = self
            .rooms
            .with_members(room, |members| {
                members
                    .iter()
                    .filter(|(id, _)| !excluded.contains(id))
                    .filter(|(_, handle)| handle.send(event.clone()))
                    .count()
            })
            .unwrap_or(0);

        if delivered == 0 {
            debug!(room = %room, event = event_name, "publish reached no connections");
        }
        metrics::record_delivery(event_name, delivered);
        delivered
    }

    /// Deliver to every connection bound to `user_id`, skipping `exclude`.
    pub fn publish_to_user(
        &self,
        user_id: &UserId,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let event_name = event.name();
        let mut delivered = 0;
        self.registry.for_each_user_connection(user_id, |handle| {
            if Some(handle.id()) != exclude && handle.send(event.clone()) {
                delivered += 1;
            }
        });

        if delivered == 0 {
            debug!(user_id = %user_id, event = event_name, "user has no reachable connections");
        }
        metrics::record_delivery(event_name, delivered);
        delivered
    }

    /// Deliver to exactly one connection.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let event_name = event.name();
        let delivered = self.registry.send_to(id, event);
        metrics::record_delivery(event_name, usize::from(delivered));
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_common::protocol::events::{CommentAdd, DmTypingNotice};
    use taskhub_common::types::ResourceId;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        fanout: FanOut,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::default());
        let rooms = Arc::new(RoomManager::new(Arc::clone(&registry)));
        let fanout = FanOut::new(Arc::clone(&registry), Arc::clone(&rooms));
        Harness { registry, rooms, fanout }
    }

    fn connect(harness: &Harness) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (harness.registry.connect(tx), rx)
    }

    fn room(raw: &str) -> RoomName {
        raw.parse().unwrap()
    }

    fn user(raw: &str) -> UserId {
        UserId::new(raw).unwrap()
    }

    fn comment(n: u32) -> ServerEvent {
        ServerEvent::CommentAdded(CommentAdd {
            task_id: ResourceId::new("42").unwrap(),
            comment: serde_json::json!({ "n": n }),
            user_id: user("u1"),
        })
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn publish_skips_the_excluded_sender() {
        let h = harness();
        let (x, mut x_rx) = connect(&h);
        let (y, mut y_rx) = connect(&h);
        h.rooms.join(x, room("task:42")).unwrap();
        h.rooms.join(y, room("task:42")).unwrap();

        let delivered = h.fanout.publish(&room("task:42"), comment(1), Some(y));

        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut x_rx).len(), 1);
        assert!(drain(&mut y_rx).is_empty());
    }

    #[test]
    fn publish_never_reaches_non_members() {
        let h = harness();
        let (member, mut member_rx) = connect(&h);
        let (_outsider, mut outsider_rx) = connect(&h);
        h.rooms.join(member, room("project:p1")).unwrap();

        h.fanout.publish(&room("project:p1"), comment(1), None);

        assert_eq!(drain(&mut member_rx).len(), 1);
        assert!(drain(&mut outsider_rx).is_empty());
    }

    #[test]
    fn publish_to_missing_room_is_a_noop() {
        let h = harness();
        assert_eq!(h.fanout.publish(&room("task:nobody"), comment(1), None), 0);
    }

    #[test]
    fn publish_preserves_order_per_connection() {
        let h = harness();
        let (x, mut x_rx) = connect(&h);
        h.rooms.join(x, room("task:42")).unwrap();

        for n in 0..10 {
            h.fanout.publish(&room("task:42"), comment(n), None);
        }

        assert_eq!(comment_numbers(&mut x_rx), (0..10).collect::<Vec<_>>());
    }

    fn comment_numbers(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<u64> {
        drain(rx)
            .into_iter()
            .map(|event| match event {
                ServerEvent::CommentAdded(payload) => payload.comment["n"].as_u64().unwrap(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect()
    }

    #[test]
    fn concurrent_publishers_are_seen_in_one_order_by_every_member() {
        const PER_PUBLISHER: u32 = 500;

        let h = harness();
        let (x, mut x_rx) = connect(&h);
        let (y, mut y_rx) = connect(&h);
        h.rooms.join(x, room("task:42")).unwrap();
        h.rooms.join(y, room("task:42")).unwrap();

        std::thread::scope(|scope| {
            for publisher in [1_000, 2_000] {
                let fanout = &h.fanout;
                scope.spawn(move || {
                    for n in 0..PER_PUBLISHER {
                        fanout.publish(&room("task:42"), comment(publisher + n), None);
                    }
                });
            }
        });

        let seen_by_x = comment_numbers(&mut x_rx);
        let seen_by_y = comment_numbers(&mut y_rx);
        assert_eq!(seen_by_x.len(), 2 * PER_PUBLISHER as usize);
        assert_eq!(seen_by_x, seen_by_y);

        for publisher in [1_000u64, 2_000] {
            let sent = publisher..publisher + u64::from(PER_PUBLISHER);
            let own: Vec<u64> =
                seen_by_x.iter().copied().filter(|n| sent.contains(n)).collect();
            assert_eq!(own, sent.collect::<Vec<_>>());
        }
    }

    #[test]
    fn publish_to_user_reaches_every_bound_connection() {
        let h = harness();
        let (tab_a, mut tab_a_rx) = connect(&h);
        let (tab_b, mut tab_b_rx) = connect(&h);
        let (_other, mut other_rx) = connect(&h);
        h.registry.bind(tab_a, &user("u2")).unwrap();
        h.registry.bind(tab_b, &user("u2")).unwrap();

        let event =
            ServerEvent::DmTyping(DmTypingNotice { user_id: user("u1"), is_typing: true });
        assert_eq!(h.fanout.publish_to_user(&user("u2"), event.clone(), None), 2);
        assert_eq!(h.fanout.publish_to_user(&user("u2"), event, Some(tab_a)), 1);

        assert_eq!(drain(&mut tab_a_rx).len(), 1);
        assert_eq!(drain(&mut tab_b_rx).len(), 2);
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn disconnecting_member_receives_nothing_after_close() {
        let h = harness();
        let (x, mut x_rx) = connect(&h);
        h.rooms.join(x, room("task:42")).unwrap();

        // Registry removal happens before room cleanup; the stale member
        // entry must already be unreachable.
        h.registry.begin_disconnect(x).unwrap();
        assert_eq!(h.fanout.publish(&room("task:42"), comment(1), None), 0);
        assert!(drain(&mut x_rx).is_empty());
    }
}
