// Two-party call signaling. One guarded session per unordered user pair;
// transitions and their deliveries for a pair happen under that pair's map
// entry, so both parties observe them in order. Terminal sessions are
// retired from the index immediately.

mod session;

pub use session::{CallSession, CallState, EndFlags, PairKey};

use std::sync::Arc;

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use taskhub_common::{
    protocol::events::{CallAnswered, CallEnded, CallRejected, IncomingCall, ServerEvent},
    types::{CallType, UserId},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::fanout::FanOut;
use crate::metrics;
use crate::registry::ConnectionId;

/// Display details the caller attaches to `call:incoming`.
#[derive(Debug, Clone, Default)]
pub struct CallerProfile {
    pub name: Option<String>,
    pub avatar: Option<String>,
}

/// Handle for a freshly created ringing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingingCall {
    pub key: PairKey,
    pub session_id: Uuid,
    /// Callee connections that were rung.
    pub rung: usize,
}

#[derive(Debug)]
pub struct CallSignaling {
    fanout: Arc<FanOut>,
    sessions: DashMap<PairKey, CallSession>,
}

impl CallSignaling {
    pub fn new(fanout: Arc<FanOut>) -> Self {
        Self { fanout, sessions: DashMap::new() }
    }

    pub fn initiate(
        &self,
        connection: ConnectionId,
        caller: &UserId,
        callee: &UserId,
        call_type: CallType,
        profile: CallerProfile,
        signal: Value,
    ) -> Result<RingingCall, RelayError> {
        if caller == callee {
            return Err(RelayError::new(
                ErrorCode::InvalidCallTransition,
                "a user cannot call themselves",
            ));
        }

        let key = PairKey::new(caller, callee);
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    pair = %key,
                    state = existing.get().state.as_str(),
                    "initiate refused, pair already has a live call"
                );
                Err(RelayError::from_code(ErrorCode::CallAlreadyActive))
            }
            Entry::Vacant(vacant) => {
                let session =
                    CallSession::ring(caller.clone(), callee.clone(), call_type, connection);
                let incoming = ServerEvent::CallIncoming(IncomingCall {
                    from: caller.clone(),
                    from_name: profile.name,
                    from_avatar: profile.avatar,
                    call_type,
                    signal,
                });
                let rung = self.deliver(&session, callee, incoming);
                let session_id = session.id;
                vacant.insert(session);

                info!(
                    pair = %key,
                    session_id = %session_id,
                    caller = %caller,
                    callee = %callee,
                    rung,
                    "call ringing"
                );
                Ok(RingingCall { key, session_id, rung })
            }
        }
    }

    /// Callee `callee` answers `caller` from `connection`.
    pub fn answer(
        &self,
        connection: ConnectionId,
        callee: &UserId,
        caller: &UserId,
        signal: Value,
    ) -> Result<(), RelayError> {
        let key = PairKey::new(callee, caller);
        let mut session = self.sessions.get_mut(&key).ok_or_else(|| no_session("answer"))?;
        if &session.caller != caller {
            return Err(no_session("answer"));
        }

        session.answer(callee, connection, Utc::now()).inspect_err(|error| {
            debug!(pair = %key, error = %error, "answer ignored");
        })?;

        let answered = ServerEvent::CallAnswered(CallAnswered { from: callee.clone(), signal });
        self.deliver(&session, caller, answered);
        info!(pair = %key, session_id = %session.id, "call connected");
        Ok(())
    }

    pub fn reject(&self, callee: &UserId, caller: &UserId) -> Result<CallSession, RelayError> {
        let key = PairKey::new(callee, caller);
        let Entry::Occupied(mut entry) = self.sessions.entry(key.clone()) else {
            return Err(no_session("reject"));
        };
        if &entry.get().caller != caller {
            return Err(no_session("reject"));
        }

        entry.get_mut().reject(callee, Utc::now())?;
        let rejected = ServerEvent::CallRejected(CallRejected { from: callee.clone() });
        self.deliver(entry.get(), caller, rejected);

        let session = entry.remove();
        self.retired(&session, "rejected by callee");
        Ok(session)
    }

    /// `party` hangs up on `other`.
    pub fn end(
        &self,
        party: &UserId,
        other: &UserId,
        flags: EndFlags,
    ) -> Result<CallSession, RelayError> {
        let key = PairKey::new(party, other);
        let Entry::Occupied(mut entry) = self.sessions.entry(key) else {
            return Err(no_session("end"));
        };

        let state = entry.get_mut().end(flags, Utc::now())?;
        self.notify_ended(entry.get(), party, other);
        // Both sides learn about an unanswered call, each with its own outcome.
        if state == CallState::NoAnswer {
            self.notify_ended(entry.get(), other, party);
        }

        let session = entry.remove();
        self.retired(&session, "ended by party");
        Ok(session)
    }

    /// Forward an ICE candidate or renegotiation to `to` while the pair has a
    /// live session.
    pub fn relay(
        &self,
        from: &UserId,
        to: &UserId,
        event: ServerEvent,
    ) -> Result<usize, RelayError> {
        let key = PairKey::new(from, to);
        let session = self.sessions.get(&key).ok_or_else(|| no_session(event.name()))?;
        Ok(self.deliver(&session, to, event))
    }

    /// Retire every live session that depended on a closed connection. The
    /// remaining party is told as if `user_id` had hung up.
    pub fn handle_disconnect(
        &self,
        connection: ConnectionId,
        user_id: &UserId,
        user_still_connected: bool,
    ) -> Vec<CallSession> {
        let candidates: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().contains(user_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut retired = Vec::new();
        for key in candidates {
            let Entry::Occupied(mut entry) = self.sessions.entry(key) else {
                continue;
            };
            if !entry.get().depends_on(user_id, connection, user_still_connected) {
                continue;
            }

            let other = entry.get().counterpart(user_id).clone();
            if entry.get_mut().end(EndFlags::default(), Utc::now()).is_err() {
                continue;
            }
            self.notify_ended(entry.get(), user_id, &other);

            let session = entry.remove();
            self.retired(&session, "party disconnected");
            retired.push(session);
        }
        retired
    }

    /// Retire a session that is still ringing as `no-answer`. A timer armed
    /// for an older session on the same pair is a no-op.
    pub fn expire_ringing(&self, key: &PairKey, session_id: Uuid) -> Option<CallSession> {
        let Entry::Occupied(mut entry) = self.sessions.entry(key.clone()) else {
            return None;
        };
        if entry.get().id != session_id || entry.get().state != CallState::Ringing {
            return None;
        }

        let flags = EndFlags { no_answer: true, missed: false };
        entry.get_mut().end(flags, Utc::now()).ok()?;
        let (caller, callee) = (entry.get().caller.clone(), entry.get().callee.clone());
        self.notify_ended(entry.get(), &caller, &callee);
        self.notify_ended(entry.get(), &callee, &caller);

        let session = entry.remove();
        self.retired(&session, "ring timeout");
        Some(session)
    }

    pub fn session(&self, a: &UserId, b: &UserId) -> Option<CallSession> {
        self.sessions.get(&PairKey::new(a, b)).map(|session| session.clone())
    }

    pub fn active_sessions(&self) -> Vec<CallSession> {
        let mut sessions: Vec<_> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(CallSession::key);
        sessions
    }

    /// Tell `recipient` that `from` ended the session.
    fn notify_ended(&self, session: &CallSession, from: &UserId, recipient: &UserId) {
        let ended = ServerEvent::CallEnded(CallEnded {
            from: from.clone(),
            outcome: session.outcome_for(recipient),
            duration_secs: session.duration_secs(),
        });
        self.deliver(session, recipient, ended);
    }

    /// The caller is reached on the connection that placed the call. The
    /// callee is reached on every connection until one answers, then only on
    /// the answering one.
    fn deliver(&self, session: &CallSession, recipient: &UserId, event: ServerEvent) -> usize {
        if recipient == &session.caller {
            usize::from(self.fanout.send_to(session.caller_connection, event))
        } else {
            match session.callee_connection {
                Some(connection) => usize::from(self.fanout.send_to(connection, event)),
                None => self.fanout.publish_to_user(recipient, event, None),
            }
        }
    }

    fn retired(&self, session: &CallSession, reason: &str) {
        metrics::record_call_outcome(session.outcome_for(&session.caller));
        info!(
            pair = %session.key(),
            session_id = %session.id,
            state = session.state.as_str(),
            duration_secs = session.duration_secs(),
            reason,
            "call retired"
        );
    }
}

fn no_session(action: &str) -> RelayError {
    RelayError::new(ErrorCode::InvalidCallTransition, format!("no live call for {action}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::rooms::RoomManager;
    use serde_json::json;
    use taskhub_common::{
        protocol::events::{RelayedIceCandidate, ServerEvent},
        types::CallOutcome,
    };
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        calls: CallSignaling,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::default());
        let rooms = Arc::new(RoomManager::new(Arc::clone(&registry)));
        let fanout = Arc::new(FanOut::new(Arc::clone(&registry), rooms));
        Harness { registry, calls: CallSignaling::new(fanout) }
    }

    fn tab(h: &Harness, user_id: &str) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = h.registry.connect(tx);
        h.registry.bind(id, &user(user_id)).unwrap();
        (id, rx)
    }

    fn user(raw: &str) -> UserId {
        UserId::new(raw).unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn ring(h: &Harness, conn: ConnectionId) -> RingingCall {
        h.calls
            .initiate(
                conn,
                &user("u1"),
                &user("u2"),
                CallType::Audio,
                CallerProfile { name: Some("Ann".into()), avatar: None },
                json!({ "type": "offer", "sdp": "v=0" }),
            )
            .unwrap()
    }

    fn single_ended(events: Vec<ServerEvent>) -> CallEnded {
        match events.as_slice() {
            [ServerEvent::CallEnded(ended)] => ended.clone(),
            other => panic!("expected one call:ended, got {other:?}"),
        }
    }

    #[test]
    fn callee_tabs_all_ring_and_only_one_answer_applies() {
        let h = harness();
        let (caller, mut caller_rx) = tab(&h, "u1");
        let (tab_a, mut tab_a_rx) = tab(&h, "u2");
        let (tab_b, mut tab_b_rx) = tab(&h, "u2");

        let ringing = ring(&h, caller);
        assert_eq!(ringing.rung, 2);
        for rx in [&mut tab_a_rx, &mut tab_b_rx] {
            let events = drain(rx);
            let [ServerEvent::CallIncoming(incoming)] = events.as_slice() else {
                panic!("expected call:incoming, got {events:?}");
            };
            assert_eq!(incoming.from, user("u1"));
            assert_eq!(incoming.from_name.as_deref(), Some("Ann"));
            assert_eq!(incoming.call_type, CallType::Audio);
        }

        h.calls.answer(tab_a, &user("u2"), &user("u1"), json!({ "type": "answer" })).unwrap();
        let err = h
            .calls
            .answer(tab_b, &user("u2"), &user("u1"), json!({ "type": "answer" }))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCallTransition);

        let events = drain(&mut caller_rx);
        assert_eq!(events.len(), 1, "caller should see exactly one answer");
        assert!(
            matches!(&events[0], ServerEvent::CallAnswered(answered) if answered.from == user("u2"))
        );

        let session = h.calls.session(&user("u1"), &user("u2")).unwrap();
        assert_eq!(session.state, CallState::Connected);
        assert_eq!(session.callee_connection, Some(tab_a));
    }

    #[test]
    fn second_initiate_for_the_pair_is_refused() {
        let h = harness();
        let (caller, _caller_rx) = tab(&h, "u1");
        let (callee, _callee_rx) = tab(&h, "u2");
        ring(&h, caller);

        let err = h
            .calls
            .initiate(
                callee,
                &user("u2"),
                &user("u1"),
                CallType::Video,
                CallerProfile::default(),
                Value::Null,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CallAlreadyActive);
        assert_eq!(h.calls.active_sessions().len(), 1);
    }

    #[test]
    fn self_calls_are_invalid() {
        let h = harness();
        let (conn, _rx) = tab(&h, "u1");
        let err = h
            .calls
            .initiate(
                conn,
                &user("u1"),
                &user("u1"),
                CallType::Audio,
                CallerProfile::default(),
                Value::Null,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCallTransition);
    }

    #[test]
    fn no_answer_retires_the_session_and_allows_a_new_call() {
        let h = harness();
        let (caller, mut caller_rx) = tab(&h, "u1");
        let (_callee, mut callee_rx) = tab(&h, "u2");
        ring(&h, caller);
        drain(&mut callee_rx);

        let session = h
            .calls
            .end(&user("u1"), &user("u2"), EndFlags { no_answer: true, missed: false })
            .unwrap();
        assert_eq!(session.state, CallState::NoAnswer);
        assert!(h.calls.session(&user("u1"), &user("u2")).is_none());

        let ended = single_ended(drain(&mut callee_rx));
        assert_eq!(ended.from, user("u1"));
        assert_eq!(ended.outcome, CallOutcome::Missed);
        let ended = single_ended(drain(&mut caller_rx));
        assert_eq!(ended.from, user("u2"));
        assert_eq!(ended.outcome, CallOutcome::NoAnswer);
        assert_eq!(ended.duration_secs, None);

        ring(&h, caller);
        assert_eq!(h.calls.active_sessions().len(), 1);
    }

    #[test]
    fn reject_blocks_a_later_answer() {
        let h = harness();
        let (caller, mut caller_rx) = tab(&h, "u1");
        let (callee, _callee_rx) = tab(&h, "u2");
        ring(&h, caller);

        h.calls.reject(&user("u2"), &user("u1")).unwrap();
        assert!(h.calls.answer(callee, &user("u2"), &user("u1"), Value::Null).is_err());
        assert!(h.calls.reject(&user("u2"), &user("u1")).is_err());

        let events = drain(&mut caller_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::CallRejected(rejected)] if rejected.from == user("u2")
        ));
    }

    #[test]
    fn caller_cannot_reject_their_own_call() {
        let h = harness();
        let (caller, _caller_rx) = tab(&h, "u1");
        ring(&h, caller);

        let err = h.calls.reject(&user("u1"), &user("u2")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCallTransition);
        assert!(h.calls.session(&user("u1"), &user("u2")).is_some());
    }

    #[test]
    fn hanging_up_a_connected_call_reports_duration() {
        let h = harness();
        let (caller, mut caller_rx) = tab(&h, "u1");
        let (callee, _callee_rx) = tab(&h, "u2");
        ring(&h, caller);
        h.calls.answer(callee, &user("u2"), &user("u1"), Value::Null).unwrap();
        drain(&mut caller_rx);

        h.calls.end(&user("u2"), &user("u1"), EndFlags::default()).unwrap();
        let ended = single_ended(drain(&mut caller_rx));
        assert_eq!(ended.from, user("u2"));
        assert_eq!(ended.outcome, CallOutcome::Ended);
        assert!(ended.duration_secs.is_some());

        let err = h.calls.end(&user("u2"), &user("u1"), EndFlags::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCallTransition);
    }

    #[test]
    fn dropped_caller_socket_ends_connected_call_for_callee() {
        let h = harness();
        let (caller, _caller_rx) = tab(&h, "u1");
        let (callee, mut callee_rx) = tab(&h, "u2");
        ring(&h, caller);
        h.calls.answer(callee, &user("u2"), &user("u1"), Value::Null).unwrap();
        drain(&mut callee_rx);

        let dropped = h.registry.begin_disconnect(caller).unwrap();
        let retired = h.calls.handle_disconnect(caller, &user("u1"), dropped.user_still_connected);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].state, CallState::Ended);

        let ended = single_ended(drain(&mut callee_rx));
        assert_eq!(ended.from, user("u1"));
        assert_eq!(ended.outcome, CallOutcome::Ended);

        // Disconnect cleanup runs once; a repeat finds nothing.
        assert!(h.calls.handle_disconnect(caller, &user("u1"), false).is_empty());
    }

    #[test]
    fn callee_dropping_while_ringing_is_missed_for_caller() {
        let h = harness();
        let (caller, mut caller_rx) = tab(&h, "u1");
        let (callee, _callee_rx) = tab(&h, "u2");
        ring(&h, caller);

        let dropped = h.registry.begin_disconnect(callee).unwrap();
        assert!(!dropped.user_still_connected);
        h.calls.handle_disconnect(callee, &user("u2"), dropped.user_still_connected);

        let ended = single_ended(drain(&mut caller_rx));
        assert_eq!(ended.from, user("u2"));
        assert_eq!(ended.outcome, CallOutcome::Missed);
        assert!(h.calls.session(&user("u1"), &user("u2")).is_none());
    }

    #[test]
    fn closing_one_ringing_callee_tab_keeps_the_call() {
        let h = harness();
        let (caller, _caller_rx) = tab(&h, "u1");
        let (tab_a, _tab_a_rx) = tab(&h, "u2");
        let (_tab_b, _tab_b_rx) = tab(&h, "u2");
        ring(&h, caller);

        let dropped = h.registry.begin_disconnect(tab_a).unwrap();
        assert!(dropped.user_still_connected);
        assert!(h.calls.handle_disconnect(tab_a, &user("u2"), true).is_empty());
        assert_eq!(h.calls.session(&user("u1"), &user("u2")).unwrap().state, CallState::Ringing);
    }

    #[test]
    fn ice_candidates_need_a_live_session() {
        let h = harness();
        let (caller, _caller_rx) = tab(&h, "u1");
        let (callee, mut callee_rx) = tab(&h, "u2");

        let candidate = |from: &str| {
            ServerEvent::CallIceCandidate(RelayedIceCandidate {
                from: user(from),
                candidate: json!({ "candidate": "candidate:1 1 UDP 1 10.0.0.1 9 typ host" }),
            })
        };
        let err = h.calls.relay(&user("u1"), &user("u2"), candidate("u1")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCallTransition);

        ring(&h, caller);
        h.calls.answer(callee, &user("u2"), &user("u1"), Value::Null).unwrap();
        drain(&mut callee_rx);

        assert_eq!(h.calls.relay(&user("u1"), &user("u2"), candidate("u1")).unwrap(), 1);
        assert_eq!(drain(&mut callee_rx).len(), 1);
    }

    #[test]
    fn ring_timeout_only_expires_its_own_session() {
        let h = harness();
        let (caller, mut caller_rx) = tab(&h, "u1");
        let (_callee, mut callee_rx) = tab(&h, "u2");

        let first = ring(&h, caller);
        h.calls.end(&user("u1"), &user("u2"), EndFlags::default()).unwrap();
        let second = ring(&h, caller);
        drain(&mut caller_rx);
        drain(&mut callee_rx);

        assert!(h.calls.expire_ringing(&first.key, first.session_id).is_none());
        assert!(h.calls.session(&user("u1"), &user("u2")).is_some());

        let expired = h.calls.expire_ringing(&second.key, second.session_id).unwrap();
        assert_eq!(expired.state, CallState::NoAnswer);
        assert_eq!(single_ended(drain(&mut caller_rx)).outcome, CallOutcome::NoAnswer);
        assert_eq!(single_ended(drain(&mut callee_rx)).outcome, CallOutcome::Missed);
    }
}
