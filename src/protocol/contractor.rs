//! Contract protocol, participating side.
//!
//! A contractor session is opened by an incoming announcement for a
//! registered contractor interest. `announced()` must either bid or refuse,
//! exactly once; anything else is a broken contract and nothing is sent.

use serde_json::Value;

use super::manager::report_window;
use super::session::{RoleKind, Session, SessionCore, StateMachine};
use crate::agency::Env;
use crate::error::{Outcome, Result};
use crate::message::{
    Bid, Body, Cancellation, FinalReport, Grant, Message, ProtocolType, Recipient, Refusal,
    UpdateReport,
};
use crate::timer::{after, Expired, TimerKind};

/// Business hooks of a contractor.
pub trait Contractor: Send {
    /// Decide on an announcement: call exactly one of
    /// [`ContractorContext::bid`] or [`ContractorContext::refuse`].
    fn announced(&mut self, announcement: &Message, ctx: &mut ContractorContext)
        -> anyhow::Result<()>;

    /// Our bid won. Report now through `ctx`, or later through the agency.
    fn granted(&mut self, grant: &Message, ctx: &mut ContractorContext) -> anyhow::Result<()>;

    /// Our bid lost.
    fn rejected(&mut self, _rejection: &Message) {}

    /// No decision on our bid, or our grant ran out before a final report.
    fn expired(&mut self) {}

    /// The manager called the job off.
    fn cancelled(&mut self, _cancellation: &Message) {}

    /// The manager confirmed our final report.
    fn acknowledged(&mut self, _acknowledgement: &Message) {}

    /// The final report was never acknowledged.
    fn aborted(&mut self) {}
}

/// Contractor states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractorState {
    /// Announcement received
    Announced,
    /// Bid sent
    Bid,
    /// Refusal sent
    Refused,
    /// Working on the job
    Granted,
    /// Bid lost
    Rejected,
    /// Bid or grant ran out
    Expired,
    /// Final report sent, waiting for acknowledgement
    Completed,
    /// Final report acknowledged
    Acknowledged,
    /// Manager cancelled
    Cancelled,
    /// We gave up on the job
    Defected,
    /// Acknowledgement never came
    Aborted,
    /// Contract violated
    Wtf,
}

impl StateMachine for ContractorState {
    fn can_become(self, next: Self) -> bool {
        use ContractorState::*;
        match (self, next) {
            (Announced, Bid | Refused) => true,
            (Bid, Granted | Rejected | Expired) => true,
            (Granted, Completed | Defected | Expired) => true,
            (Completed, Acknowledged) => true,
            (state, Cancelled | Aborted | Wtf) => !state.is_terminal(),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::Announced | Self::Bid | Self::Granted | Self::Completed
        )
    }
}

/// Collects what a contractor hook wants done.
#[derive(Debug, Default)]
pub struct ContractorContext {
    actions: Vec<ContractorAction>,
}

#[derive(Debug)]
enum ContractorAction {
    Bid(Bid),
    Refuse(Value),
    UpdateReport(Value),
    FinalReport(Value),
    Defect(String),
}

impl ContractorContext {
    /// Answer the announcement with `bid`.
    pub fn bid(&mut self, bid: Bid) {
        self.actions.push(ContractorAction::Bid(bid));
    }

    /// Decline the announcement.
    pub fn refuse(&mut self, payload: Value) {
        self.actions.push(ContractorAction::Refuse(payload));
    }

    /// Report progress on a granted job.
    pub fn update_report(&mut self, payload: Value) {
        self.actions.push(ContractorAction::UpdateReport(payload));
    }

    /// Deliver the job result.
    pub fn final_report(&mut self, payload: Value) {
        self.actions.push(ContractorAction::FinalReport(payload));
    }

    /// Give up on a granted job.
    pub fn defect(&mut self, reason: impl Into<String>) {
        self.actions.push(ContractorAction::Defect(reason.into()));
    }

    fn decisions(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, ContractorAction::Bid(_) | ContractorAction::Refuse(_)))
            .count()
    }
}

/// A running contract, contractor side.
pub(crate) struct ContractorSession {
    core: SessionCore,
    role: Box<dyn Contractor>,
    state: ContractorState,
    manager: Recipient,
    grant: Option<Grant>,
}

impl ContractorSession {
    pub(crate) fn start(env: &mut Env, role: Box<dyn Contractor>, announcement: &Message) -> Self {
        let core = SessionCore::new(
            env,
            announcement.session_id.clone(),
            announcement.protocol_id.clone(),
            ProtocolType::Contract,
            RoleKind::Contractor,
        );
        let mut session = Self {
            core,
            role,
            state: ContractorState::Announced,
            manager: announcement.sender.clone(),
            grant: None,
        };

        let mut ctx = ContractorContext::default();
        match session.role.announced(announcement, &mut ctx) {
            Err(err) => session.fail(env, &err),
            Ok(()) if ctx.decisions() != 1 => {
                session.wtf(&format!(
                    "announced() made {} bid/refuse decisions, expected one",
                    ctx.decisions()
                ));
            },
            Ok(()) => {
                session.apply(env, ctx);
                if session.state == ContractorState::Bid {
                    let closes = announcement
                        .expiration_time
                        .unwrap_or_else(|| env.after(env.config.announce_timeout()));
                    let deadline = after(closes, env.config.grant_wait());
                    session.core.arm(env, TimerKind::BidWait, deadline);
                }
            },
        }
        session
    }

    fn apply(&mut self, env: &mut Env, ctx: ContractorContext) {
        for action in ctx.actions {
            if self.state.is_terminal() {
                return;
            }
            let result = match action {
                ContractorAction::Bid(bid) => self.send_bid(env, bid),
                ContractorAction::Refuse(payload) => self.refuse(env, payload),
                ContractorAction::UpdateReport(payload) => self.update_report(env, payload),
                ContractorAction::FinalReport(payload) => self.final_report(env, payload),
                ContractorAction::Defect(reason) => self.defect(env, &reason),
            };
            if let Err(err) = result {
                self.wtf(&err.to_string());
            }
        }
    }

    fn send(&self, env: &mut Env, body: Body) {
        let message = Message::new(
            self.core.id.clone(),
            self.core.protocol_id.clone(),
            env.address.clone(),
            self.manager.clone(),
            body,
        );
        // a lost message surfaces as a timeout on either side
        let _ = env.post(&self.manager, message);
    }

    fn send_bid(&mut self, env: &mut Env, bid: Bid) -> Result<()> {
        if self.state != ContractorState::Announced {
            return Err(self.core.invalid(self.state, "bid"));
        }
        if bid.offers.is_empty() {
            self.wtf("bid without offers");
            return Ok(());
        }
        self.send(env, Body::Bid(bid));
        self.core.transition(&mut self.state, ContractorState::Bid);
        Ok(())
    }

    fn refuse(&mut self, env: &mut Env, payload: Value) -> Result<()> {
        if self.state != ContractorState::Announced {
            return Err(self.core.invalid(self.state, "refuse"));
        }
        self.send(env, Body::Refusal(Refusal { payload }));
        self.core.transition(&mut self.state, ContractorState::Refused);
        tracing::debug!(session_id = %self.core.id, "Refused");
        Ok(())
    }

    pub(crate) fn update_report(&mut self, env: &mut Env, payload: Value) -> Result<()> {
        if self.state != ContractorState::Granted {
            return Err(self.core.invalid(self.state, "update_report"));
        }
        self.send(env, Body::UpdateReport(UpdateReport { payload }));
        // the manager restarts our window on every update
        if let Some(grant) = &self.grant {
            let deadline = env.after(report_window(env, grant));
            self.core.arm(env, TimerKind::GrantExpire, deadline);
        }
        Ok(())
    }

    pub(crate) fn final_report(&mut self, env: &mut Env, payload: Value) -> Result<()> {
        if self.state != ContractorState::Granted {
            return Err(self.core.invalid(self.state, "final_report"));
        }
        self.send(env, Body::FinalReport(FinalReport { payload }));
        self.core.transition(&mut self.state, ContractorState::Completed);
        let deadline = env.after(env.config.ack_timeout());
        self.core.arm(env, TimerKind::AckWait, deadline);
        tracing::info!(session_id = %self.core.id, "Final report sent");
        Ok(())
    }

    pub(crate) fn defect(&mut self, env: &mut Env, reason: &str) -> Result<()> {
        if self.state != ContractorState::Granted {
            return Err(self.core.invalid(self.state, "defect"));
        }
        self.core.cancel_timer(env);
        self.send(env, Body::Cancellation(Cancellation::new(reason)));
        self.core.transition(&mut self.state, ContractorState::Defected);
        tracing::info!(session_id = %self.core.id, reason, "Defected");
        Ok(())
    }

    fn on_grant(&mut self, env: &mut Env, message: Message) {
        let Some(grant) = message.as_grant().cloned() else {
            return;
        };
        self.core.transition(&mut self.state, ContractorState::Granted);
        let deadline = message
            .expiration_time
            .unwrap_or_else(|| env.after(report_window(env, &grant)));
        self.core.arm(env, TimerKind::GrantExpire, deadline);
        self.grant = Some(grant);
        tracing::info!(session_id = %self.core.id, manager = %self.manager, "Granted");

        let mut ctx = ContractorContext::default();
        match self.role.granted(&message, &mut ctx) {
            Ok(()) => self.apply(env, ctx),
            Err(err) => self.fail(env, &err),
        }
    }

    /// Hook failure: fall back to the nearest failure state.
    fn fail(&mut self, env: &mut Env, err: &anyhow::Error) {
        tracing::error!(
            session_id = %self.core.id,
            state = ?self.state,
            error = %format!("{err:#}"),
            "Contractor hook failed"
        );
        let reason = format!("{err:#}");
        match self.state {
            ContractorState::Announced => {
                let _ = self.refuse(env, Value::String(reason));
            },
            ContractorState::Granted => {
                let _ = self.defect(env, &reason);
            },
            _ => {
                self.core.cancel_timer(env);
                self.core.transition(&mut self.state, ContractorState::Aborted);
            },
        }
    }

    fn wtf(&mut self, reason: &str) {
        tracing::error!(session_id = %self.core.id, state = ?self.state, reason, "Contractor broke the protocol");
        self.core.transition(&mut self.state, ContractorState::Wtf);
    }
}

impl Session for ContractorSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_message(&mut self, env: &mut Env, message: Message) {
        self.core.touch(env);
        if message.sender != self.manager {
            self.core.unexpected(self.state, &message);
            return;
        }
        match (self.state, &message.body) {
            (ContractorState::Bid, Body::Grant(_)) => self.on_grant(env, message),
            (ContractorState::Bid, Body::Rejection(_)) => {
                self.core.cancel_timer(env);
                self.core.transition(&mut self.state, ContractorState::Rejected);
                self.role.rejected(&message);
            },
            (
                ContractorState::Bid | ContractorState::Granted | ContractorState::Completed,
                Body::Cancellation(_),
            ) => {
                self.core.cancel_timer(env);
                self.core.transition(&mut self.state, ContractorState::Cancelled);
                tracing::info!(session_id = %self.core.id, "Cancelled by manager");
                self.role.cancelled(&message);
            },
            (ContractorState::Completed, Body::Acknowledgement(_)) => {
                self.core.cancel_timer(env);
                self.core.transition(&mut self.state, ContractorState::Acknowledged);
                self.role.acknowledged(&message);
            },
            (state, _) => self.core.unexpected(state, &message),
        }
    }

    fn on_timer(&mut self, env: &mut Env, timer: Expired) {
        self.core.touch(env);
        if !self.core.claim(&timer) {
            return;
        }
        match (self.state, &timer.kind) {
            (ContractorState::Bid, TimerKind::BidWait)
            | (ContractorState::Granted, TimerKind::GrantExpire) => {
                tracing::info!(session_id = %self.core.id, state = ?self.state, "Expired");
                self.core.transition(&mut self.state, ContractorState::Expired);
                self.role.expired();
            },
            (ContractorState::Completed, TimerKind::AckWait) => {
                tracing::warn!(session_id = %self.core.id, "Final report never acknowledged");
                self.core.transition(&mut self.state, ContractorState::Aborted);
                self.role.aborted();
            },
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
        None
    }

    /// Local cancellation of a granted job is a defection.
    fn cancel(&mut self, env: &mut Env, reason: &str) -> Result<()> {
        self.defect(env, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ContractorState::*;
        assert!(Announced.can_become(Bid));
        assert!(Bid.can_become(Granted));
        assert!(Completed.can_become(Cancelled));
        assert!(!Granted.can_become(Bid));
        assert!(!Acknowledged.can_become(Cancelled));
        assert!(!Refused.can_become(Bid));
    }

    #[test]
    fn test_completed_is_not_terminal() {
        assert!(!ContractorState::Completed.is_terminal());
        assert!(ContractorState::Defected.is_terminal());
        assert!(ContractorState::Wtf.is_terminal());
    }

    #[test]
    fn test_context_counts_decisions() {
        let mut ctx = ContractorContext::default();
        assert_eq!(ctx.decisions(), 0);
        ctx.bid(Bid::single(1, Value::Null));
        ctx.update_report(Value::Null);
        assert_eq!(ctx.decisions(), 1);
        ctx.refuse(Value::Null);
        assert_eq!(ctx.decisions(), 2);
    }
}
