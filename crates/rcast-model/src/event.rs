use serde::{Deserialize, Serialize};

use crate::snapshot::XidSnapshot;
use crate::{EventSeq, NodeId};

/// The verbs an origin can announce. `Sync` carries bulk data work; the rest
/// are cluster configuration changes replayed on every node.
///
/// Unknown verbs are preserved verbatim so that a node running older code
/// forwards and commits events produced by a newer origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Sync,
    StoreNode,
    EnableNode,
    StorePath,
    StoreListen,
    StoreSet,
    SetAddTable,
    SubscribeSet,
    EnableSubscription,
    Other(String),
}

impl EventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "SYNC" => Self::Sync,
            "STORE_NODE" => Self::StoreNode,
            "ENABLE_NODE" => Self::EnableNode,
            "STORE_PATH" => Self::StorePath,
            "STORE_LISTEN" => Self::StoreListen,
            "STORE_SET" => Self::StoreSet,
            "SET_ADD_TABLE" => Self::SetAddTable,
            "SUBSCRIBE_SET" => Self::SubscribeSet,
            "ENABLE_SUBSCRIPTION" => Self::EnableSubscription,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Sync => "SYNC",
            Self::StoreNode => "STORE_NODE",
            Self::EnableNode => "ENABLE_NODE",
            Self::StorePath => "STORE_PATH",
            Self::StoreListen => "STORE_LISTEN",
            Self::StoreSet => "STORE_SET",
            Self::SetAddTable => "SET_ADD_TABLE",
            Self::SubscribeSet => "SUBSCRIBE_SET",
            Self::EnableSubscription => "ENABLE_SUBSCRIPTION",
            Self::Other(s) => s,
        }
    }
}

/// One event record as delivered by a listener.
///
/// `provider` is the node the listener selected this event from, which is
/// not necessarily the origin. The timestamp and snapshot components are
/// origin-formatted strings passed through to SQL unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub provider: NodeId,
    pub origin: NodeId,
    pub seqno: EventSeq,
    pub timestamp: String,
    pub snapshot: XidSnapshot,
    pub ev_type: EventType,
    pub data: [Option<String>; 8],
}

impl Event {
    /// Payload argument by 1-based position, as the configuration verbs
    /// reference them.
    pub fn arg(&self, n: usize) -> Option<&str> {
        debug_assert!((1..=8).contains(&n));
        self.data[n - 1].as_deref()
    }

    /// Payload argument parsed as a node/set id. Configuration events carry
    /// well-formed ids from the origin; a malformed one is a protocol error
    /// surfaced by the caller.
    pub fn int_arg(&self, n: usize) -> anyhow::Result<i32> {
        let raw = self
            .arg(n)
            .ok_or_else(|| anyhow::anyhow!("event {} missing argument {}", self.ev_type.as_str(), n))?;
        raw.trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("event {} argument {} not an id: {:?}", self.ev_type.as_str(), n, raw))
    }
}

/// Acknowledgement that `received` has processed events from `origin` up to
/// `seqno`. Only the highest seqno per (origin, received) pair matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirm {
    pub origin: NodeId,
    pub received: NodeId,
    pub seqno: EventSeq,
    pub timestamp: String,
}
