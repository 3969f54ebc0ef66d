//! Side-effect recording for deterministic replay.
//!
//! Every side effect a protocol step performs (allocating a session id,
//! reading the clock, posting a message) goes through a [`Recorder`]. The
//! strategy is picked when the agency is built:
//!
//! | Strategy        | Runs the effect | Keeps a journal | Use                 |
//! |-----------------|-----------------|-----------------|---------------------|
//! | [`PassThrough`] | yes             | no              | production          |
//! | [`Journal`]     | yes             | yes             | capture for restart |
//! | [`Replay`]      | no              | consumes one    | crash recovery      |
//!
//! During replay the channel is never touched; posts resolve to whatever the
//! original run observed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FleetError, Result};

/// One recorded side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Effect name, e.g. "now" or "post"
    pub effect: String,
    /// Value the effect produced
    pub value: Value,
}

/// Strategy for running side effects
pub trait Recorder: Send {
    /// Run (or replay) `effect`, returning its value.
    fn call(&mut self, effect: &str, live: &mut dyn FnMut() -> Result<Value>) -> Result<Value>;
}

/// Run a typed side effect through a recorder.
pub fn record<T, F>(recorder: &mut dyn Recorder, effect: &str, f: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T>,
{
    let mut f = Some(f);
    let value = recorder.call(effect, &mut || {
        let f = f
            .take()
            .ok_or_else(|| FleetError::Replay(format!("effect {effect} invoked twice")))?;
        Ok(serde_json::to_value(f()?)?)
    })?;
    Ok(serde_json::from_value(value)?)
}

/// Runs every effect, remembers nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Recorder for PassThrough {
    fn call(&mut self, _effect: &str, live: &mut dyn FnMut() -> Result<Value>) -> Result<Value> {
        live()
    }
}

/// Runs every effect and keeps what it produced.
///
/// Clones share the same entries, so a caller can keep one clone while the
/// agency owns the other.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Journal {
    /// Empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries captured so far
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().clone()
    }

    /// Take the captured entries, leaving the journal empty
    pub fn take(&self) -> Vec<Entry> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl Recorder for Journal {
    fn call(&mut self, effect: &str, live: &mut dyn FnMut() -> Result<Value>) -> Result<Value> {
        let value = live()?;
        self.entries.lock().push(Entry {
            effect: effect.to_string(),
            value: value.clone(),
        });
        Ok(value)
    }
}

/// Feeds a captured journal back without running any effect
#[derive(Debug, Clone, Default)]
pub struct Replay {
    entries: VecDeque<Entry>,
}

impl Replay {
    /// Replay `entries` in order
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Entries not consumed yet
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl Recorder for Replay {
    fn call(&mut self, effect: &str, _live: &mut dyn FnMut() -> Result<Value>) -> Result<Value> {
        let entry = self
            .entries
            .pop_front()
            .ok_or_else(|| FleetError::Replay(format!("journal exhausted at {effect}")))?;
        if entry.effect != effect {
            return Err(FleetError::Replay(format!(
                "expected {}, replaying {effect}",
                entry.effect
            )));
        }
        Ok(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through_runs_effect() {
        let mut recorder = PassThrough;
        let value: u32 = record(&mut recorder, "answer", || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_journal_then_replay() {
        let mut journal = Journal::new();
        let shared = journal.clone();
        let a: String = record(&mut journal, "id", || Ok("s-1".to_string())).unwrap();
        let b: usize = record(&mut journal, "post", || Ok(3)).unwrap();
        assert_eq!((a.as_str(), b), ("s-1", 3));
        assert_eq!(shared.entries().len(), 2);

        let mut replay = Replay::new(shared.take());
        let mut ran = false;
        let a: String = record(&mut replay, "id", || {
            ran = true;
            Ok("other".to_string())
        })
        .unwrap();
        assert_eq!(a, "s-1");
        assert!(!ran);
        assert_eq!(replay.remaining(), 1);
    }

    #[test]
    fn test_replay_mismatch() {
        let mut replay = Replay::new(vec![Entry {
            effect: "now".into(),
            value: Value::Null,
        }]);
        let result: Result<usize> = record(&mut replay, "post", || Ok(1));
        assert!(matches!(result, Err(FleetError::Replay(_))));

        let result: Result<usize> = record(&mut replay, "post", || Ok(1));
        assert!(matches!(result, Err(FleetError::Replay(_))));
    }
}
