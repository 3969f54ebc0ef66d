//! Everything a session step may touch besides its own state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::channel::Channel;
use crate::clock::{Clock, IdSource};
use crate::config::AgencyConfig;
use crate::error::{FleetError, Result};
use crate::message::{Message, Recipient, SessionId};
use crate::recorder::{record, Recorder};
use crate::timer::{self, TimerQueue};

/// Side-effect boundary of the engine.
///
/// Session ids, clock reads and posts all go through the recorder so a
/// replayed agency sees exactly what the original run saw.
pub(crate) struct Env {
    pub(crate) address: Recipient,
    pub(crate) config: AgencyConfig,
    pub(crate) timers: TimerQueue,
    channel: Arc<dyn Channel>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdSource>,
    recorder: Box<dyn Recorder>,
    now: DateTime<Utc>,
}

impl Env {
    pub(crate) fn new(
        address: Recipient,
        config: AgencyConfig,
        channel: Arc<dyn Channel>,
        clock: Arc<dyn Clock>,
        ids: Box<dyn IdSource>,
        recorder: Box<dyn Recorder>,
    ) -> Self {
        let now = clock.now();
        Self {
            address,
            config,
            timers: TimerQueue::new(),
            channel,
            clock,
            ids,
            recorder,
            now,
        }
    }

    /// Read the clock once for the step about to run.
    pub(crate) fn begin_step(&mut self) -> DateTime<Utc> {
        let clock = Arc::clone(&self.clock);
        self.now = record(self.recorder.as_mut(), "now", || Ok(clock.now())).unwrap_or_else(
            |err| {
                tracing::error!(error = %err, "Recorder failed on clock read, using live clock");
                clock.now()
            },
        );
        self.now
    }

    /// Deadline `by` from now, saturating instead of overflowing.
    pub(crate) fn after(&self, by: Duration) -> DateTime<Utc> {
        timer::after(self.now, by)
    }

    /// Time of the current step
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn new_session_id(&mut self) -> SessionId {
        let ids = &mut self.ids;
        let mut fallback = None;
        let id = record(self.recorder.as_mut(), "session_id", || {
            let id = ids.next_id();
            fallback = Some(id.clone());
            Ok(id)
        });
        match id {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "Recorder failed on id allocation, using live id");
                fallback.unwrap_or_else(|| self.ids.next_id())
            },
        }
    }

    /// Post one copy of `message` to `recipient`; returns the delivery count.
    pub(crate) fn post(&mut self, recipient: &Recipient, mut message: Message) -> Result<usize> {
        message.receiver = recipient.clone();
        let channel = Arc::clone(&self.channel);
        // failures are journaled too, replay must see the same outcome
        let delivered = record(self.recorder.as_mut(), "post", || {
            Ok(channel.post(recipient, &message).map_err(|e| match e {
                FleetError::Channel(reason) => reason,
                other => other.to_string(),
            }))
        })
        .and_then(|result: std::result::Result<usize, String>| {
            result.map_err(FleetError::Channel)
        });
        match &delivered {
            Ok(count) => tracing::trace!(
                session_id = %message.session_id,
                kind = message.kind(),
                to = %recipient,
                delivered = count,
                "Posted"
            ),
            Err(err) => tracing::warn!(
                session_id = %message.session_id,
                kind = message.kind(),
                to = %recipient,
                error = %err,
                "Post failed"
            ),
        }
        delivered
    }
}
