//! Contract protocol, initiating side.
//!
//! ```text
//!   [Initiated] --announce--> [Announced] --all answered / timeout--> [Closed]
//!                                                                      |    |
//!                                       grant_wait elapsed, no grant   |    | grant
//!                                                 [Expired] <----------+    v
//!                                                                     [Granted]
//!                                        all reported / all defected  |    | report deadline
//!                                         [Completed] / [Cancelled] <-+    +--> [Aborted]
//! ```
//!
//! `cancel()` leads to `Cancelled` from any live state; a broken contract
//! (announcing twice, granting someone who never bid) leads to `Wtf`.

use std::collections::HashSet;

use chrono::Duration;
use serde_json::Value;

use super::session::{RoleKind, Session, SessionCore, StateMachine};
use crate::agency::Env;
use crate::error::{Outcome, ProtocolFailure, Result};
use crate::message::{
    pick_best, Acknowledgement, Announcement, Bid, Body, Cancellation, Grant, Message,
    ProtocolType, Recipient, Rejection, SessionId,
};
use crate::timer::{after, Expired, TimerHandle, TimerKind};

/// Business hooks of a contract manager.
pub trait Manager: Send {
    /// Build the announcement with [`ManagerContext::announce`].
    fn initiate(&mut self, ctx: &mut ManagerContext) -> anyhow::Result<()>;

    /// A bid arrived while announced.
    fn bid(&mut self, _bid: &Message) {}

    /// A contractor refused while announced.
    fn refused(&mut self, _refusal: &Message) {}

    /// Bidding is over. Grant winners with [`ManagerContext::grant`];
    /// the default grants the single best bid.
    fn closed(&mut self, bids: &[Message], ctx: &mut ManagerContext) -> anyhow::Result<()> {
        if let Some(best) = pick_best(bids, 1).first() {
            ctx.grant_best(best);
        }
        Ok(())
    }

    /// A granted contractor reported progress.
    fn update_report(&mut self, _report: &Message) {}

    /// Every granted contractor finished; at least one final report.
    fn completed(&mut self, reports: &[Message]) -> anyhow::Result<Value> {
        Ok(Value::Array(
            reports.iter().filter_map(|r| r.payload().cloned()).collect(),
        ))
    }

    /// Closed without any grant.
    fn expired(&mut self) {}

    /// Cancelled locally (`None`) or every contractor defected.
    fn cancelled(&mut self, _cancellation: Option<&Message>) {}

    /// A contractor missed its report deadline.
    fn aborted(&mut self) {}
}

/// Manager states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// Created, nothing sent
    Initiated,
    /// Announcement out, collecting bids
    Announced,
    /// Bidding over, deciding
    Closed,
    /// Grants out, waiting for reports
    Granted,
    /// Closed without a grant
    Expired,
    /// Reports received
    Completed,
    /// Cancelled locally or by every contractor
    Cancelled,
    /// A report deadline passed or a hook failed
    Aborted,
    /// Contract violated
    Wtf,
}

impl StateMachine for ManagerState {
    fn can_become(self, next: Self) -> bool {
        use ManagerState::*;
        match (self, next) {
            (Initiated, Announced) | (Announced, Closed) | (Closed, Granted | Expired) => true,
            (Granted, Completed) => true,
            (state, Cancelled | Aborted | Wtf) => !state.is_terminal(),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Expired | Self::Completed | Self::Cancelled | Self::Aborted | Self::Wtf
        )
    }
}

/// Collects what a manager hook wants done.
#[derive(Debug, Default)]
pub struct ManagerContext {
    actions: Vec<ManagerAction>,
}

#[derive(Debug)]
enum ManagerAction {
    Announce(Value),
    Grant(Recipient, Grant),
    Reject(Recipient, Value),
    Cancel(String),
}

impl ManagerContext {
    /// Broadcast the announcement to the session's recipients.
    pub fn announce(&mut self, payload: Value) {
        self.actions.push(ManagerAction::Announce(payload));
    }

    /// Grant the contractor that sent `bid`.
    pub fn grant(&mut self, bid: &Message, grant: Grant) {
        self.actions
            .push(ManagerAction::Grant(bid.sender.clone(), grant));
    }

    /// Grant the best offer of `bid`; false if it has none.
    pub fn grant_best(&mut self, bid: &Message) -> bool {
        match bid.as_bid().and_then(Bid::best_offer) {
            Some((index, _)) => {
                self.grant(bid, Grant::new(index));
                true
            },
            None => false,
        }
    }

    /// Reject the contractor that sent `bid`.
    pub fn reject(&mut self, bid: &Message, payload: Value) {
        self.actions
            .push(ManagerAction::Reject(bid.sender.clone(), payload));
    }

    /// Cancel the whole contract.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.actions.push(ManagerAction::Cancel(reason.into()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assignment {
    Pending,
    Reported,
    Defected,
    Cancelled,
}

struct Granted {
    contractor: Recipient,
    grant: Grant,
    status: Assignment,
    timer: Option<TimerHandle>,
}

/// A running contract, manager side.
pub(crate) struct ManagerSession {
    core: SessionCore,
    role: Box<dyn Manager>,
    state: ManagerState,
    recipients: Vec<Recipient>,
    expected: usize,
    responded: HashSet<Recipient>,
    /// Arrival order, one per contractor
    bids: Vec<Message>,
    refusals: Vec<Message>,
    rejected: HashSet<Recipient>,
    granted: Vec<Granted>,
    reports: Vec<Message>,
    defections: Vec<Message>,
    outcome: Option<Outcome>,
}

impl ManagerSession {
    pub(crate) fn start(
        env: &mut Env,
        session_id: SessionId,
        protocol_id: String,
        role: Box<dyn Manager>,
        recipients: Vec<Recipient>,
    ) -> Self {
        let core = SessionCore::new(
            env,
            session_id,
            protocol_id,
            ProtocolType::Contract,
            RoleKind::Manager,
        );
        let mut session = Self {
            core,
            role,
            state: ManagerState::Initiated,
            recipients,
            expected: 0,
            responded: HashSet::new(),
            bids: Vec::new(),
            refusals: Vec::new(),
            rejected: HashSet::new(),
            granted: Vec::new(),
            reports: Vec::new(),
            defections: Vec::new(),
            outcome: None,
        };

        let mut ctx = ManagerContext::default();
        match session.role.initiate(&mut ctx) {
            Ok(()) => session.apply(env, ctx),
            Err(err) => session.fail(env, &err),
        }
        if session.state == ManagerState::Initiated {
            session.wtf(env, "initiate() did not announce");
        }
        session
    }

    fn apply(&mut self, env: &mut Env, ctx: ManagerContext) {
        let mut grants = Vec::new();
        let mut cancel = None;
        for action in ctx.actions {
            if self.state.is_terminal() {
                return;
            }
            match action {
                ManagerAction::Announce(payload) => self.announce(env, payload),
                ManagerAction::Grant(to, grant) => grants.push((to, grant)),
                ManagerAction::Reject(to, payload) => self.reject(env, &to, payload),
                ManagerAction::Cancel(reason) => cancel = Some(reason),
            }
        }
        if !grants.is_empty() && !self.state.is_terminal() {
            if let Err(err) = self.grant(env, grants) {
                self.wtf(env, &err.to_string());
            }
        }
        if let Some(reason) = cancel {
            if !self.state.is_terminal() {
                // state checked above, cannot fail
                let _ = self.cancel(env, &reason);
            }
        }
    }

    fn announce(&mut self, env: &mut Env, payload: Value) {
        if !self.core.transition(&mut self.state, ManagerState::Announced) {
            self.wtf(env, "announce() outside of initiate()");
            return;
        }
        let deadline = env.after(env.config.announce_timeout());
        let announcement = Message::new(
            self.core.id.clone(),
            self.core.protocol_id.clone(),
            env.address.clone(),
            env.address.clone(),
            Body::Announcement(Announcement::new(payload)),
        )
        .with_expiration(deadline);

        for recipient in self.recipients.clone() {
            // failed posts are logged by the env; they just never answer
            if let Ok(delivered) = env.post(&recipient, announcement.clone()) {
                self.expected += delivered;
            }
        }
        tracing::info!(
            session_id = %self.core.id,
            protocol_id = %self.core.protocol_id,
            expected = self.expected,
            "Announced"
        );

        self.core.arm(env, TimerKind::AnnounceClose, deadline);
        if self.expected == 0 {
            self.close(env);
        }
    }

    fn collect(&mut self, env: &mut Env, message: Message) {
        if !self.responded.insert(message.sender.clone()) {
            tracing::debug!(
                session_id = %self.core.id,
                from = %message.sender,
                "Duplicate response ignored"
            );
            return;
        }
        match message.as_bid().map(|bid| bid.offers.is_empty()) {
            Some(true) => {
                tracing::warn!(session_id = %self.core.id, from = %message.sender, "Bid without offers ignored");
            },
            Some(false) => {
                self.role.bid(&message);
                self.bids.push(message);
            },
            None => {
                self.role.refused(&message);
                self.refusals.push(message);
            },
        }
        if self.responded.len() >= self.expected {
            self.close(env);
        }
    }

    fn close(&mut self, env: &mut Env) {
        self.core.cancel_timer(env);
        if !self.core.transition(&mut self.state, ManagerState::Closed) {
            return;
        }
        tracing::info!(
            session_id = %self.core.id,
            bids = self.bids.len(),
            refusals = self.refusals.len(),
            expected = self.expected,
            "Closed"
        );

        let mut ctx = ManagerContext::default();
        match self.role.closed(&self.bids, &mut ctx) {
            Ok(()) => self.apply(env, ctx),
            Err(err) => {
                self.fail(env, &err);
                return;
            },
        }

        if self.state == ManagerState::Closed {
            if self.bids.is_empty() {
                self.expire(env);
            } else {
                let deadline = env.after(env.config.grant_wait());
                self.core.arm(env, TimerKind::GrantWait, deadline);
            }
        }
    }

    /// Why `grants` cannot be honoured, if they cannot.
    fn grant_violation(&self, grants: &[(Recipient, Grant)]) -> Option<String> {
        let mut seen = HashSet::new();
        for (to, grant) in grants {
            let Some(bid) = self
                .bids
                .iter()
                .find(|b| &b.sender == to)
                .and_then(Message::as_bid)
            else {
                return Some(format!("grant to {to}, who did not bid"));
            };
            if grant.bid_index >= bid.offers.len() {
                return Some(format!(
                    "grant to {to} references offer {} of {}",
                    grant.bid_index,
                    bid.offers.len()
                ));
            }
            if self.rejected.contains(to) {
                return Some(format!("grant to {to}, who was rejected"));
            }
            if !seen.insert(to) {
                return Some(format!("{to} granted twice"));
            }
        }
        None
    }

    pub(crate) fn grant(&mut self, env: &mut Env, grants: Vec<(Recipient, Grant)>) -> Result<()> {
        if self.state != ManagerState::Closed {
            return Err(self.core.invalid(self.state, "grant"));
        }
        if grants.is_empty() {
            return Ok(());
        }
        if let Some(violation) = self.grant_violation(&grants) {
            self.wtf(env, &violation);
            return Ok(());
        }

        self.core.cancel_timer(env);
        self.core.transition(&mut self.state, ManagerState::Granted);
        let now = env.now();
        for (to, grant) in grants {
            let deadline = after(now, report_window(env, &grant));
            let message = Message::new(
                self.core.id.clone(),
                self.core.protocol_id.clone(),
                env.address.clone(),
                to.clone(),
                Body::Grant(grant.clone()),
            )
            .with_expiration(deadline);
            // an undelivered grant surfaces as a missed report deadline
            let _ = env.post(&to, message);
            let timer = env
                .timers
                .arm(&self.core.id, TimerKind::Report(to.clone()), deadline);
            self.granted.push(Granted {
                contractor: to,
                grant,
                status: Assignment::Pending,
                timer: Some(timer),
            });
        }

        let losers: Vec<Recipient> = self
            .bids
            .iter()
            .map(|b| b.sender.clone())
            .filter(|s| !self.granted.iter().any(|g| &g.contractor == s))
            .collect();
        for loser in losers {
            self.reject(env, &loser, Value::Null);
        }
        tracing::info!(
            session_id = %self.core.id,
            granted = self.granted.len(),
            "Granted"
        );
        Ok(())
    }

    fn reject(&mut self, env: &mut Env, to: &Recipient, payload: Value) {
        if !self.bids.iter().any(|b| &b.sender == to) {
            tracing::warn!(session_id = %self.core.id, to = %to, "Reject of a non-bidder ignored");
            return;
        }
        if !self.rejected.insert(to.clone()) {
            return;
        }
        let message = Message::new(
            self.core.id.clone(),
            self.core.protocol_id.clone(),
            env.address.clone(),
            to.clone(),
            Body::Rejection(Rejection { payload }),
        );
        let _ = env.post(to, message);
    }

    fn reject_remaining(&mut self, env: &mut Env) {
        let bidders: Vec<Recipient> = self.bids.iter().map(|b| b.sender.clone()).collect();
        for bidder in bidders {
            self.reject(env, &bidder, Value::Null);
        }
    }

    fn pending(&self, contractor: &Recipient) -> Option<usize> {
        self.granted
            .iter()
            .position(|g| &g.contractor == contractor && g.status == Assignment::Pending)
    }

    fn on_update(&mut self, env: &mut Env, message: Message) {
        let Some(idx) = self.pending(&message.sender) else {
            self.core.unexpected(self.state, &message);
            return;
        };
        self.role.update_report(&message);

        let deadline = env.after(report_window(env, &self.granted[idx].grant));
        if let Some(handle) = self.granted[idx].timer.take() {
            env.timers.cancel(handle);
        }
        let timer = env.timers.arm(
            &self.core.id,
            TimerKind::Report(message.sender.clone()),
            deadline,
        );
        self.granted[idx].timer = Some(timer);
    }

    fn on_resolution(&mut self, env: &mut Env, message: Message) {
        let Some(idx) = self.pending(&message.sender) else {
            tracing::debug!(
                session_id = %self.core.id,
                from = %message.sender,
                kind = message.kind(),
                "Report from a resolved contractor ignored"
            );
            return;
        };
        if let Some(handle) = self.granted[idx].timer.take() {
            env.timers.cancel(handle);
        }
        if matches!(message.body, Body::FinalReport(_)) {
            self.granted[idx].status = Assignment::Reported;
            self.reports.push(message);
        } else {
            tracing::info!(session_id = %self.core.id, from = %message.sender, "Contractor defected");
            self.granted[idx].status = Assignment::Defected;
            self.defections.push(message);
        }
        self.check_resolved(env);
    }

    fn check_resolved(&mut self, env: &mut Env) {
        if self.granted.iter().any(|g| g.status == Assignment::Pending) {
            return;
        }
        self.core.cancel_timer(env);

        if self.reports.is_empty() {
            self.core.transition(&mut self.state, ManagerState::Cancelled);
            let reason = self
                .defections
                .last()
                .and_then(Message::as_cancellation)
                .map(|c| c.reason.clone())
                .unwrap_or_else(|| "every contractor defected".to_string());
            self.role.cancelled(self.defections.last());
            self.outcome = Some(Err(ProtocolFailure::Cancelled(reason)));
            return;
        }

        for report in &self.reports {
            let ack = Message::new(
                self.core.id.clone(),
                self.core.protocol_id.clone(),
                env.address.clone(),
                report.sender.clone(),
                Body::Acknowledgement(Acknowledgement::default()),
            );
            let _ = env.post(&report.sender, ack);
        }

        match self.role.completed(&self.reports) {
            Ok(value) => {
                self.core.transition(&mut self.state, ManagerState::Completed);
                tracing::info!(
                    session_id = %self.core.id,
                    reports = self.reports.len(),
                    "Completed"
                );
                self.outcome = Some(Ok(value));
            },
            Err(err) => {
                tracing::error!(session_id = %self.core.id, error = %format!("{err:#}"), "completed() failed");
                self.core.transition(&mut self.state, ManagerState::Aborted);
                self.outcome = Some(Err(ProtocolFailure::from_hook(&err)));
            },
        }
    }

    fn on_report_timeout(&mut self, env: &mut Env, timer: &Expired) {
        let Some(slot) = self
            .granted
            .iter_mut()
            .find(|g| g.timer == Some(timer.handle) && g.status == Assignment::Pending)
        else {
            tracing::warn!(session_id = %self.core.id, kind = ?timer.kind, "Stale timer ignored");
            return;
        };
        slot.timer = None;
        tracing::info!(
            session_id = %self.core.id,
            contractor = %slot.contractor,
            "Report deadline missed"
        );
        self.abort(env, ProtocolFailure::Expired, "report deadline missed");
    }

    /// Post a cancellation to every contractor still working.
    fn cancel_pending(&mut self, env: &mut Env, reason: &str) {
        for idx in 0..self.granted.len() {
            if self.granted[idx].status != Assignment::Pending {
                continue;
            }
            if let Some(handle) = self.granted[idx].timer.take() {
                env.timers.cancel(handle);
            }
            self.granted[idx].status = Assignment::Cancelled;
            let to = self.granted[idx].contractor.clone();
            let message = Message::new(
                self.core.id.clone(),
                self.core.protocol_id.clone(),
                env.address.clone(),
                to.clone(),
                Body::Cancellation(Cancellation::new(reason)),
            );
            let _ = env.post(&to, message);
        }
    }

    fn expire(&mut self, env: &mut Env) {
        self.core.cancel_timer(env);
        self.core.transition(&mut self.state, ManagerState::Expired);
        self.reject_remaining(env);
        tracing::info!(session_id = %self.core.id, bids = self.bids.len(), "Expired without grant");
        self.role.expired();
        self.outcome = Some(Err(ProtocolFailure::Expired));
    }

    fn abort(&mut self, env: &mut Env, failure: ProtocolFailure, reason: &str) {
        self.core.cancel_timer(env);
        self.cancel_pending(env, reason);
        if self.state != ManagerState::Granted {
            self.reject_remaining(env);
        }
        self.core.transition(&mut self.state, ManagerState::Aborted);
        self.role.aborted();
        self.outcome = Some(Err(failure));
    }

    fn fail(&mut self, env: &mut Env, err: &anyhow::Error) {
        tracing::error!(
            session_id = %self.core.id,
            state = ?self.state,
            error = %format!("{err:#}"),
            "Manager hook failed"
        );
        self.abort(env, ProtocolFailure::from_hook(err), "manager failed");
    }

    fn wtf(&mut self, env: &mut Env, reason: &str) {
        tracing::error!(session_id = %self.core.id, state = ?self.state, reason, "Manager broke the protocol");
        self.core.cancel_timer(env);
        self.cancel_pending(env, "protocol violation");
        self.core.transition(&mut self.state, ManagerState::Wtf);
        self.outcome = Some(Err(ProtocolFailure::InvariantViolation(reason.to_string())));
    }
}

/// How long a contractor may go without reporting.
pub(crate) fn report_window(env: &Env, grant: &Grant) -> Duration {
    grant
        .update_report
        .map(crate::config::secs)
        .unwrap_or_else(|| env.config.grant_timeout())
}

impl Session for ManagerSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_message(&mut self, env: &mut Env, message: Message) {
        self.core.touch(env);
        match (self.state, &message.body) {
            (ManagerState::Announced, Body::Bid(_) | Body::Refusal(_)) => {
                self.collect(env, message);
            },
            (ManagerState::Closed | ManagerState::Granted, Body::Bid(_) | Body::Refusal(_)) => {
                tracing::debug!(
                    session_id = %self.core.id,
                    from = %message.sender,
                    "Late response ignored"
                );
            },
            (ManagerState::Granted, Body::UpdateReport(_)) => self.on_update(env, message),
            (ManagerState::Granted, Body::FinalReport(_) | Body::Cancellation(_)) => {
                self.on_resolution(env, message);
            },
            (state, _) => self.core.unexpected(state, &message),
        }
    }

    fn on_timer(&mut self, env: &mut Env, timer: Expired) {
        self.core.touch(env);
        if matches!(timer.kind, TimerKind::Report(_)) {
            self.on_report_timeout(env, &timer);
            return;
        }
        if !self.core.claim(&timer) {
            return;
        }
        match (self.state, &timer.kind) {
            (ManagerState::Announced, TimerKind::AnnounceClose) => self.close(env),
            (ManagerState::Closed, TimerKind::GrantWait) => self.expire(env),
            (state, kind) => {
                tracing::warn!(session_id = %self.core.id, state = ?state, kind = ?kind, "Timer does not apply");
            },
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.state)
    }

    fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    fn cancel(&mut self, env: &mut Env, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.core.invalid(self.state, "cancel"));
        }
        self.core.cancel_timer(env);
        if self.state == ManagerState::Granted {
            self.cancel_pending(env, reason);
        } else {
            self.reject_remaining(env);
        }
        self.core.transition(&mut self.state, ManagerState::Cancelled);
        tracing::info!(session_id = %self.core.id, reason, "Cancelled");
        self.role.cancelled(None);
        self.outcome = Some(Err(ProtocolFailure::Cancelled(reason.to_string())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_moves_backward() {
        use ManagerState::*;
        assert!(Initiated.can_become(Announced));
        assert!(Closed.can_become(Granted));
        assert!(!Granted.can_become(Announced));
        assert!(!Closed.can_become(Announced));
        assert!(!Completed.can_become(Cancelled));
        assert!(Granted.can_become(Cancelled));
    }

    #[test]
    fn test_terminal_states() {
        use ManagerState::*;
        for state in [Expired, Completed, Cancelled, Aborted, Wtf] {
            assert!(state.is_terminal(), "{state:?}");
        }
        for state in [Initiated, Announced, Closed, Granted] {
            assert!(!state.is_terminal(), "{state:?}");
        }
    }

    #[test]
    fn test_context_grant_best() {
        let bid = Message::new(
            "s".into(),
            "p",
            Recipient::agent("eu", "c"),
            Recipient::agent("eu", "m"),
            Body::Bid(Bid::new(vec![
                crate::message::Offer::new(9, Value::Null),
                crate::message::Offer::new(1, Value::Null),
            ])),
        );
        let mut ctx = ManagerContext::default();
        assert!(ctx.grant_best(&bid));
        match &ctx.actions[0] {
            ManagerAction::Grant(to, grant) => {
                assert_eq!(to, &Recipient::agent("eu", "c"));
                assert_eq!(grant.bid_index, 1);
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
