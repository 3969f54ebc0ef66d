//! Cancellable scheduled callbacks.
//!
//! Timers are plain data: the agency asks the queue for everything due at
//! "now" and dispatches each one to the owning session. A session cancels its
//! pending timer on every transition; the handle it keeps is also compared on
//! dispatch so a timer that somehow survived is dropped, never delivered.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::message::{Recipient, SessionId};

/// `at + by`, saturating at the last representable instant.
///
/// Deadlines are built from wire fields, so the sum must never panic.
pub(crate) fn after(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a timer means to the session that armed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Manager: bid collection window over
    AnnounceClose,
    /// Manager: closed but nothing granted in time
    GrantWait,
    /// Manager: a granted contractor missed its report deadline
    Report(Recipient),
    /// Contractor: no grant or rejection for our bid
    BidWait,
    /// Contractor: grant deadline passed without a final report
    GrantExpire,
    /// Contractor: final report never acknowledged
    AckWait,
    /// Requester: no reply in time
    RequestTimeout,
    /// Retry wrapper: backoff elapsed, start the next attempt
    RetryDelay,
}

/// Identifies one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle {
    deadline: DateTime<Utc>,
    seq: u64,
}

impl TimerHandle {
    /// When the timer fires
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }
}

/// A timer that came due
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    /// Handle it was armed with
    pub handle: TimerHandle,
    /// Owning session
    pub session_id: SessionId,
    /// Meaning
    pub kind: TimerKind,
}

/// Deadline-ordered timer queue
#[derive(Debug, Default)]
pub struct TimerQueue {
    seq: u64,
    timers: BTreeMap<TimerHandle, (SessionId, TimerKind)>,
}

impl TimerQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `session_id` at `deadline`
    pub fn arm(
        &mut self,
        session_id: &SessionId,
        kind: TimerKind,
        deadline: DateTime<Utc>,
    ) -> TimerHandle {
        self.seq += 1;
        let handle = TimerHandle {
            deadline,
            seq: self.seq,
        };
        self.timers.insert(handle, (session_id.clone(), kind));
        handle
    }

    /// Cancel a timer; false if it already fired or was cancelled
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle).is_some()
    }

    /// Cancel every timer owned by a session
    pub fn cancel_session(&mut self, session_id: &SessionId) -> usize {
        let before = self.timers.len();
        self.timers.retain(|_, (owner, _)| owner != session_id);
        before - self.timers.len()
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Expired> {
        let (handle, _) = self.timers.first_key_value()?;
        if handle.deadline > now {
            return None;
        }
        self.timers
            .pop_first()
            .map(|(handle, (session_id, kind))| Expired {
                handle,
                session_id,
                kind,
            })
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.keys().next().map(|h| h.deadline)
    }

    /// Timers armed by one session
    pub fn pending_for(&self, session_id: &SessionId) -> usize {
        self.timers.values().filter(|(owner, _)| owner == session_id).count()
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timer is armed
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let s = SessionId::new("s");
        queue.arm(&s, TimerKind::RequestTimeout, at(10));
        queue.arm(&s, TimerKind::AnnounceClose, at(5));
        assert_eq!(queue.next_deadline(), Some(at(5)));

        assert!(queue.pop_due(at(4)).is_none());
        assert_eq!(queue.pop_due(at(10)).unwrap().kind, TimerKind::AnnounceClose);
        assert_eq!(queue.pop_due(at(10)).unwrap().kind, TimerKind::RequestTimeout);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_deadline_keeps_arm_order() {
        let mut queue = TimerQueue::new();
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        queue.arm(&a, TimerKind::BidWait, at(1));
        queue.arm(&b, TimerKind::BidWait, at(1));
        assert_eq!(queue.pop_due(at(1)).unwrap().session_id, a);
        assert_eq!(queue.pop_due(at(1)).unwrap().session_id, b);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut queue = TimerQueue::new();
        let s = SessionId::new("s");
        let handle = queue.arm(&s, TimerKind::GrantWait, at(3));
        assert!(queue.cancel(handle));
        assert!(!queue.cancel(handle));
        assert!(queue.pop_due(at(100)).is_none());
    }

    #[test]
    fn test_cancel_session() {
        let mut queue = TimerQueue::new();
        let s = SessionId::new("s");
        let other = SessionId::new("o");
        queue.arm(&s, TimerKind::BidWait, at(1));
        queue.arm(&s, TimerKind::AckWait, at(2));
        queue.arm(&other, TimerKind::AckWait, at(2));
        assert_eq!(queue.pending_for(&s), 2);
        assert_eq!(queue.cancel_session(&s), 2);
        assert_eq!(queue.len(), 1);
    }
}
