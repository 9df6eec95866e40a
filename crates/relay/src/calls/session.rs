use std::fmt;

use chrono::{DateTime, Utc};
use taskhub_common::types::{CallOutcome, CallType, UserId};
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::registry::ConnectionId;

/// Canonical key for an unordered pair of users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey(UserId, UserId);

impl PairKey {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        &self.0 == user_id || &self.1 == user_id
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Connected,
    Ended,
    Rejected,
    NoAnswer,
    Missed,
}

impl CallState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::NoAnswer => "no-answer",
            Self::Missed => "missed",
        }
    }

    pub const fn is_live(self) -> bool {
        matches!(self, Self::Ringing | Self::Connected)
    }
}

/// Flags carried by `call:end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndFlags {
    pub missed: bool,
    pub no_answer: bool,
}

/// Signaling record of one call between two users.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallType,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub caller_connection: ConnectionId,
    pub callee_connection: Option<ConnectionId>,
}

impl CallSession {
    pub fn ring(
        caller: UserId,
        callee: UserId,
        call_type: CallType,
        caller_connection: ConnectionId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller,
            callee,
            call_type,
            state: CallState::Ringing,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            caller_connection,
            callee_connection: None,
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(&self.caller, &self.callee)
    }

    pub fn counterpart(&self, user_id: &UserId) -> &UserId {
        if user_id == &self.caller {
            &self.callee
        } else {
            &self.caller
        }
    }

    /// Ringing -> connected, by the callee only.
    pub fn answer(
        &mut self,
        by: &UserId,
        connection: ConnectionId,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        if self.state != CallState::Ringing || by != &self.callee {
            return Err(self.invalid("answer"));
        }
        self.state = CallState::Connected;
        self.answered_at = Some(now);
        self.callee_connection = Some(connection);
        Ok(())
    }

    /// Ringing -> rejected, by the callee only.
    pub fn reject(&mut self, by: &UserId, now: DateTime<Utc>) -> Result<(), RelayError> {
        if self.state != CallState::Ringing || by != &self.callee {
            return Err(self.invalid("reject"));
        }
        self.retire(CallState::Rejected, now);
        Ok(())
    }

    /// Hang up from either side. An unanswered call becomes `no-answer` when
    /// flagged, otherwise `missed`; a connected call becomes `ended`.
    pub fn end(&mut self, flags: EndFlags, now: DateTime<Utc>) -> Result<CallState, RelayError> {
        let next = match self.state {
            CallState::Ringing if flags.no_answer => CallState::NoAnswer,
            CallState::Ringing => CallState::Missed,
            CallState::Connected => CallState::Ended,
            _ => return Err(self.invalid("end")),
        };
        self.retire(next, now);
        Ok(next)
    }

    /// Whether closing `connection` of `user_id` should end this session.
    pub fn depends_on(
        &self,
        user_id: &UserId,
        connection: ConnectionId,
        user_still_connected: bool,
    ) -> bool {
        if user_id == &self.caller {
            connection == self.caller_connection || !user_still_connected
        } else if user_id == &self.callee {
            self.callee_connection == Some(connection) || !user_still_connected
        } else {
            false
        }
    }

    /// The outcome `recipient` is told about once the session is terminal.
    pub fn outcome_for(&self, recipient: &UserId) -> CallOutcome {
        match self.state {
            CallState::NoAnswer if recipient == &self.caller => CallOutcome::NoAnswer,
            CallState::NoAnswer | CallState::Missed => CallOutcome::Missed,
            CallState::Rejected => CallOutcome::Rejected,
            CallState::Ended | CallState::Ringing | CallState::Connected => CallOutcome::Ended,
        }
    }

    /// Whole seconds between answer and hang-up for an ended call.
    pub fn duration_secs(&self) -> Option<i64> {
        if self.state != CallState::Ended {
            return None;
        }
        let answered_at = self.answered_at?;
        let ended_at = self.ended_at?;
        Some((ended_at - answered_at).num_seconds().max(0))
    }

    fn retire(&mut self, state: CallState, now: DateTime<Utc>) {
        self.state = state;
        self.ended_at = Some(now);
    }

    fn invalid(&self, action: &str) -> RelayError {
        RelayError::new(
            ErrorCode::InvalidCallTransition,
            format!("cannot {action} a call that is {}", self.state.as_str()),
        )
    }
}
