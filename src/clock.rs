//! Injected time and id sources.
//!
//! Protocol steps never read the wall clock or generate ids directly; they go
//! through these traits (and through the recorder) so that a replayed agency
//! reaches exactly the same state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::message::SessionId;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Shared between agencies in tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Jump to `to`
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Wall time anchored at creation, advanced by tokio's clock.
///
/// Follows `tokio::time::pause()`/`advance()`, so runtime tests can skip
/// through timeouts instantly.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

/// Stand-in for deadlines a tokio `Instant` cannot represent.
const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86_400 * 365 * 30);

impl TokioClock {
    /// Anchor at the current time
    pub fn new() -> Self {
        Self {
            origin_wall: Utc::now(),
            origin: tokio::time::Instant::now(),
        }
    }

    /// Tokio instant corresponding to a wall-clock deadline
    pub fn instant_at(&self, deadline: DateTime<Utc>) -> tokio::time::Instant {
        match (deadline - self.origin_wall).to_std() {
            Ok(offset) => self
                .origin
                .checked_add(offset)
                .unwrap_or_else(|| self.origin + FAR_FUTURE),
            Err(_) => self.origin,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.origin.elapsed();
        self.origin_wall + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
    }
}

/// Source of fresh session ids
pub trait IdSource: Send {
    /// Next globally unique id
    fn next_id(&mut self) -> SessionId;
}

/// Random v4 UUIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIds;

impl IdSource for UuidIds {
    fn next_id(&mut self) -> SessionId {
        SessionId::new(uuid::Uuid::new_v4().to_string())
    }
}

/// `prefix-1`, `prefix-2`, ... for tests and readable simulations
#[derive(Debug, Clone)]
pub struct SequentialIds {
    prefix: String,
    next: u64,
}

impl SequentialIds {
    /// Ids start at `{prefix}-1`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&mut self) -> SessionId {
        let id = SessionId::new(format!("{}-{}", self.prefix, self.next));
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::default();
        let other = clock.clone();
        clock.advance(Duration::seconds(5));
        assert_eq!(other.now(), DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(5));
    }

    #[test]
    fn test_sequential_ids() {
        let mut ids = SequentialIds::new("mgr");
        assert_eq!(ids.next_id().as_str(), "mgr-1");
        assert_eq!(ids.next_id().as_str(), "mgr-2");
    }

    #[test]
    fn test_uuid_ids_unique() {
        let mut ids = UuidIds;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now();
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        assert_eq!(clock.now() - start, Duration::seconds(3));
        assert_eq!(
            clock.instant_at(start + Duration::seconds(3)),
            tokio::time::Instant::now()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_clamps_far_deadlines() {
        let clock = TokioClock::new();
        let far = clock.instant_at(DateTime::<Utc>::MAX_UTC);
        assert!(far > tokio::time::Instant::now());
        assert_eq!(clock.instant_at(DateTime::<Utc>::MIN_UTC), tokio::time::Instant::now());
    }
}
