//! Protocol roles and their session state machines.
//!
//! Business code implements one small trait per role; the engine owns the
//! state machine around it and calls the hooks at the right transitions.
//!
//! | Protocol     | Initiating role | Interested role | Terminal outcome          |
//! |--------------|-----------------|-----------------|---------------------------|
//! | Contract     | [`Manager`]     | [`Contractor`]  | `completed()` value       |
//! | Request      | [`Requester`]   | [`Replier`]     | `got_reply()` value       |
//! | Notification | (agency)        | [`Listener`]    | none                      |
//!
//! Hooks never touch the transport. They record what they want done on a
//! context (`announce`, `grant`, `bid`, `reply`...) and the session applies
//! it after the hook returns, so every side effect goes through the agency's
//! recorder.
//!
//! ## Invariants
//!
//! - A session never moves backward; every state enum carries its own
//!   transition table ([`StateMachine`]).
//! - Each session has at most one pending main timer, cancelled on every
//!   transition.
//! - Initiators always end with an [`Outcome`](crate::error::Outcome).

mod contractor;
mod manager;
mod notification;
mod request;
mod retry;
mod session;

pub use contractor::{Contractor, ContractorContext, ContractorState};
pub use manager::{Manager, ManagerContext, ManagerState};
pub use notification::Listener;
pub use request::{
    Replier, ReplierState, ReplyContext, RequestContext, Requester, RequesterState,
};
pub use retry::{Initiator, RetryState, RetryingProtocol};
pub use session::{RoleKind, SessionInfo, StateMachine};

pub(crate) use contractor::ContractorSession;
pub(crate) use manager::ManagerSession;
pub(crate) use notification::deliver;
pub(crate) use request::{ReplierSession, RequesterSession};
pub(crate) use retry::RetrySession;
pub(crate) use session::Session;
