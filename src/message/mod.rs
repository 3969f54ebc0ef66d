//! Protocol messages exchanged between agents.
//!
//! A [`Message`] is the only thing that crosses the process boundary. Every
//! message carries the correlation `session_id`, the `protocol_id` it belongs
//! to, the sender's reply address and a typed [`Body`].
//!
//! ## Contract protocol
//!
//! ```text
//! Manager                          Contractor(s)
//!    |                                 |
//!    |------- ANNOUNCEMENT ----------->|   broadcast to interested agents
//!    |<------ BID / REFUSAL -----------|
//!    |                                 |
//!    |------- GRANT ------------------>|   winners
//!    |------- REJECTION -------------->|   everybody else
//!    |<------ UPDATE_REPORT* ----------|
//!    |<------ FINAL_REPORT ------------|   or CANCELLATION (defect)
//!    |------- ACKNOWLEDGEMENT -------->|
//! ```
//!
//! ## Request protocol
//!
//! ```text
//! Requester                        Replier
//!    |------- REQUEST ---------------->|
//!    |<------ RESPONSE ----------------|
//! ```

mod bid;
mod body;
mod recipient;

pub use bid::pick_best;
pub use body::{
    Acknowledgement, Announcement, Bid, Body, Cancellation, FinalReport, Grant, Notification,
    Offer, Refusal, Rejection, RequestMessage, ResponseMessage, UpdateReport,
};
pub use recipient::{Recipient, RoutingKey};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Correlation id of one protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Protocol family a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Announce / bid / grant / report negotiation.
    Contract,
    /// One-to-one request and reply.
    Request,
    /// One-way notification.
    Notification,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Contract => "Contract",
            Self::Request => "Request",
            Self::Notification => "Notification",
        };
        f.write_str(name)
    }
}

/// Protocol message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id, unique per protocol instance
    pub session_id: SessionId,
    /// Protocol identifier (e.g. "allocate-resource")
    pub protocol_id: String,
    /// Protocol family
    pub protocol_type: ProtocolType,
    /// Reply address of the sending agent
    pub sender: Recipient,
    /// Address this copy was posted to
    pub receiver: Recipient,
    /// Absolute deadline after which the message is stale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    /// Typed body
    pub body: Body,
}

impl Message {
    /// Create a message; the protocol type follows from the body.
    pub fn new(
        session_id: SessionId,
        protocol_id: impl Into<String>,
        sender: Recipient,
        receiver: Recipient,
        body: Body,
    ) -> Self {
        Self {
            session_id,
            protocol_id: protocol_id.into(),
            protocol_type: body.protocol_type(),
            sender,
            receiver,
            expiration_time: None,
            body,
        }
    }

    /// Set the expiration time
    pub fn with_expiration(mut self, expiration_time: DateTime<Utc>) -> Self {
        self.expiration_time = Some(expiration_time);
        self
    }

    /// Whether the message's deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|t| t <= now)
    }

    /// Whether this message opens a new session on the receiving side.
    pub fn is_first_message(&self) -> bool {
        matches!(
            self.body,
            Body::Announcement(_) | Body::Request(_) | Body::Notification(_)
        )
    }

    /// Short body name for logging
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get the bid body
    pub fn as_bid(&self) -> Option<&Bid> {
        match &self.body {
            Body::Bid(bid) => Some(bid),
            _ => None,
        }
    }

    /// Get the grant body
    pub fn as_grant(&self) -> Option<&Grant> {
        match &self.body {
            Body::Grant(grant) => Some(grant),
            _ => None,
        }
    }

    /// Get the cancellation body
    pub fn as_cancellation(&self) -> Option<&Cancellation> {
        match &self.body {
            Body::Cancellation(cancellation) => Some(cancellation),
            _ => None,
        }
    }

    /// Application payload carried by the body, if the body has one.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.body.payload()
    }
}
