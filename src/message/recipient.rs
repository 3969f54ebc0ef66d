//! Routing addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a message goes: one agent, or every agent bound to a protocol in a shard.
///
/// This is a routing address, resolved by the channel, never a network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    /// A single agent
    Agent {
        /// Shard the agent lives in
        shard: String,
        /// Agent key, stable within the shard
        key: String,
    },
    /// All agents with a public interest in `protocol_id` on `shard`
    Broadcast {
        /// Protocol the listeners are bound to
        protocol_id: String,
        /// Shard scope
        shard: String,
    },
}

impl Recipient {
    /// Address a single agent
    pub fn agent(shard: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Agent {
            shard: shard.into(),
            key: key.into(),
        }
    }

    /// Address every listener of a protocol in a shard
    pub fn broadcast(protocol_id: impl Into<String>, shard: impl Into<String>) -> Self {
        Self::Broadcast {
            protocol_id: protocol_id.into(),
            shard: shard.into(),
        }
    }

    /// Shard this address is scoped to
    pub fn shard(&self) -> &str {
        match self {
            Self::Agent { shard, .. } | Self::Broadcast { shard, .. } => shard,
        }
    }

    /// Whether this is a broadcast address
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast { .. })
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent { shard, key } => write!(f, "{key}@{shard}"),
            Self::Broadcast { protocol_id, shard } => write!(f, "*{protocol_id}@{shard}"),
        }
    }
}

/// Key a listener binds to in order to receive broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Routing key of a protocol within a shard
    pub fn for_protocol(protocol_id: &str, shard: &str) -> Self {
        Self(format!("{shard}.{protocol_id}"))
    }

    /// Routing key a broadcast recipient resolves through; `None` for agents.
    pub fn of(recipient: &Recipient) -> Option<Self> {
        match recipient {
            Recipient::Broadcast { protocol_id, shard } => {
                Some(Self::for_protocol(protocol_id, shard))
            },
            Recipient::Agent { .. } => None,
        }
    }

    /// Borrow the raw key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Recipient::agent("eu", "host-1").to_string(), "host-1@eu");
        assert_eq!(
            Recipient::broadcast("allocate", "eu").to_string(),
            "*allocate@eu"
        );
    }

    #[test]
    fn test_routing_key() {
        let broadcast = Recipient::broadcast("allocate", "eu");
        assert_eq!(
            RoutingKey::of(&broadcast),
            Some(RoutingKey::for_protocol("allocate", "eu"))
        );
        assert_eq!(RoutingKey::of(&Recipient::agent("eu", "host-1")), None);
        assert_eq!(broadcast.shard(), "eu");
        assert!(broadcast.is_broadcast());
    }
}
