//! # Fleet - contract and request protocols for cooperating agents
//!
//! Agents in a fleet delegate work to each other through a small set of
//! conversational protocols. This crate is the protocol engine: it turns
//! business hooks into complete, timeout-guarded conversations.
//!
//! ## Protocols
//!
//! | Protocol     | Shape                                                | Initiator outcome      |
//! |--------------|------------------------------------------------------|------------------------|
//! | Contract     | announce → bid/refuse → grant/reject → report → ack  | `Manager::completed`   |
//! | Request      | request → first response                             | `Requester::got_reply` |
//! | Notification | one way                                              | none                   |
//!
//! Any initiating protocol can be wrapped in a [`RetryingProtocol`], which
//! re-resolves its candidates and backs off between attempts.
//!
//! ## Architecture
//!
//! ```text
//!  agent code ──AgentHandle──> AgentRuntime (tokio task)
//!                                   │ single consumer
//!                                   v
//!                                Agency ──> sessions (state machines)
//!                                   │          │ hooks
//!                                   │          v
//!                                   │     Manager / Contractor / Requester / ...
//!                                   v
//!                        Recorder ──> Clock, IdSource, Channel
//! ```
//!
//! The [`Agency`] is sans-IO: it is stepped with inbound messages, timer
//! advances and commands, and every side effect passes through a
//! [`Recorder`](recorder::Recorder) so a journal can be replayed
//! deterministically. [`AgentRuntime`] is the tokio loop around it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet::{Agency, Interest, MemoryBus, Recipient, Registry};
//!
//! let bus = MemoryBus::new();
//! let me = Recipient::agent("eu", "planner");
//! let inbox = bus.connect(me.clone());
//! let mut agency = Agency::builder(me)
//!     .channel(std::sync::Arc::new(bus.clone()))
//!     .build()?;
//!
//! let handle = agency.initiate_manager(
//!     "render",
//!     MyManager::default(),
//!     vec![Recipient::broadcast("render", "eu")],
//! );
//! // feed inbox messages to agency.on_message(), call agency.advance() on deadlines
//! let outcome = handle.notify_finish().await;
//! ```

pub mod agency;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod interest;
pub mod message;
pub mod protocol;
pub mod recorder;
pub mod runtime;
pub mod timer;

// Re-exports for convenience
pub use agency::{Agency, AgencyBuilder, SessionHandle};
pub use channel::{Channel, MemoryBus};
pub use clock::{Clock, ManualClock, SequentialIds, SystemClock, TokioClock, UuidIds};
pub use config::{AgencyConfig, Config, RetryConfig};
pub use error::{FleetError, Outcome, ProtocolFailure, Result};
pub use interest::{Interest, InterestKind, Registry};
pub use message::{Body, Message, ProtocolType, Recipient, SessionId};
pub use protocol::{
    Contractor, ContractorContext, Initiator, Listener, Manager, ManagerContext, Replier,
    ReplyContext, RequestContext, Requester, RetryingProtocol, SessionInfo,
};
pub use recorder::{Journal, PassThrough, Replay};
pub use runtime::{AgentHandle, AgentRuntime};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
