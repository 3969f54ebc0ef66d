//! Message bodies for every protocol step.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolType;

/// Typed message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    /// Manager → contractors: call for bids
    Announcement(Announcement),
    /// Contractor → manager: one or more offers
    Bid(Bid),
    /// Manager → contractor: bid not selected
    Rejection(Rejection),
    /// Manager → contractor: bid selected
    Grant(Grant),
    /// Either side: stop the job
    Cancellation(Cancellation),
    /// Manager → contractor: final report received
    Acknowledgement(Acknowledgement),
    /// Contractor → manager: will not bid
    Refusal(Refusal),
    /// Contractor → manager: progress on a long job
    UpdateReport(UpdateReport),
    /// Contractor → manager: job done
    FinalReport(FinalReport),
    /// Requester → replier
    Request(RequestMessage),
    /// Replier → requester
    Response(ResponseMessage),
    /// One-way notification
    Notification(Notification),
}

impl Body {
    /// Protocol family of this body
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            Self::Request(_) | Self::Response(_) => ProtocolType::Request,
            Self::Notification(_) => ProtocolType::Notification,
            _ => ProtocolType::Contract,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announcement(_) => "announcement",
            Self::Bid(_) => "bid",
            Self::Rejection(_) => "rejection",
            Self::Grant(_) => "grant",
            Self::Cancellation(_) => "cancellation",
            Self::Acknowledgement(_) => "acknowledgement",
            Self::Refusal(_) => "refusal",
            Self::UpdateReport(_) => "update_report",
            Self::FinalReport(_) => "final_report",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }

    /// Application payload, for bodies that carry one.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Announcement(b) => Some(&b.payload),
            Self::Rejection(b) => Some(&b.payload),
            Self::Grant(b) => Some(&b.payload),
            Self::Acknowledgement(b) => Some(&b.payload),
            Self::Refusal(b) => Some(&b.payload),
            Self::UpdateReport(b) => Some(&b.payload),
            Self::FinalReport(b) => Some(&b.payload),
            Self::Request(b) => Some(&b.payload),
            Self::Response(b) => Some(&b.payload),
            Self::Notification(b) => Some(&b.payload),
            Self::Bid(_) | Self::Cancellation(_) => None,
        }
    }
}

/// Call for bids
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// What is being contracted
    #[serde(default)]
    pub payload: Value,
}

impl Announcement {
    /// Create an announcement
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

/// One competing offer inside a bid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Ordering key; lower wins
    pub cost: i64,
    /// Offer details
    #[serde(default)]
    pub payload: Value,
}

impl Offer {
    /// Create an offer
    pub fn new(cost: i64, payload: Value) -> Self {
        Self { cost, payload }
    }
}

/// Contractor's answer to an announcement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    /// Offers, at least one
    pub offers: Vec<Offer>,
}

impl Bid {
    /// Create a bid
    pub fn new(offers: Vec<Offer>) -> Self {
        Self { offers }
    }

    /// Single-offer bid
    pub fn single(cost: i64, payload: Value) -> Self {
        Self::new(vec![Offer::new(cost, payload)])
    }
}

/// Bid not selected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Optional explanation
    #[serde(default)]
    pub payload: Value,
}

/// Bid selected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Index of the granted offer in the contractor's bid
    pub bid_index: usize,
    /// Expect an update report at least every this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_report: Option<u64>,
    /// Grant details
    #[serde(default)]
    pub payload: Value,
}

impl Grant {
    /// Grant the offer at `bid_index`
    pub fn new(bid_index: usize) -> Self {
        Self {
            bid_index,
            ..Self::default()
        }
    }

    /// Request periodic update reports
    pub fn with_update_report(mut self, period_secs: u64) -> Self {
        self.update_report = Some(period_secs);
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Stop the job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    /// Why
    pub reason: String,
}

impl Cancellation {
    /// Create a cancellation
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Final report received
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Optional payload
    #[serde(default)]
    pub payload: Value,
}

/// Will not bid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refusal {
    /// Optional explanation
    #[serde(default)]
    pub payload: Value,
}

/// Progress report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Progress details
    #[serde(default)]
    pub payload: Value,
}

/// Job result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    /// Result details
    #[serde(default)]
    pub payload: Value,
}

/// Request body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Request details
    #[serde(default)]
    pub payload: Value,
}

impl RequestMessage {
    /// Create a request body
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

/// Response body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Response details
    #[serde(default)]
    pub payload: Value,
}

/// Notification body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification details
    #[serde(default)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_kinds() {
        let body = Body::UpdateReport(UpdateReport {
            payload: json!({"progress": 40}),
        });
        assert_eq!(body.kind(), "update_report");
        assert_eq!(body.protocol_type(), ProtocolType::Contract);
        assert_eq!(body.payload(), Some(&json!({"progress": 40})));

        let body = Body::Response(ResponseMessage::default());
        assert_eq!(body.protocol_type(), ProtocolType::Request);
        assert!(Body::Bid(Bid::single(1, json!(null))).payload().is_none());
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let body: Body = serde_json::from_str(r#"{"kind":"refusal"}"#).unwrap();
        assert_eq!(body, Body::Refusal(Refusal::default()));
    }
}
