//! Protocol message envelope and per-type payloads.
//!
//! Every message carries the logical endpoints of the protocol action
//! (`src`, `dst`) and the one-hop link endpoints (`sender`, `next_hop`).
//! A `next_hop` of [`BROADCAST`] asks the fabric to deliver a copy to every
//! peer sharing a subnet with the sender.

use crate::types::{NodeId, PathId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Next-hop value requesting subnet broadcast.
pub const BROADCAST: NodeId = 0;

/// On-the-wire message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    SetupReq = 2,
    Setup = 3,
    SetupFail = 4,
    Teardown = 5,
    Data = 6,
}

impl MessageType {
    /// The wire code for this message type.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = common::Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::SetupReq),
            3 => Ok(MessageType::Setup),
            4 => Ok(MessageType::SetupFail),
            5 => Ok(MessageType::Teardown),
            6 => Ok(MessageType::Data),
            other => Err(common::Error::other(format!(
                "unknown message type code: {other}"
            ))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Hello => write!(f, "HELLO"),
            MessageType::SetupReq => write!(f, "SETUP_REQ"),
            MessageType::Setup => write!(f, "SETUP"),
            MessageType::SetupFail => write!(f, "SETUP_FAIL"),
            MessageType::Teardown => write!(f, "TEARDOWN"),
            MessageType::Data => write!(f, "DATA"),
        }
    }
}

/// Type-tagged message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Periodic beacon carrying the sender's neighbor-table view.
    Hello {
        active: bool,
        linked_active: Vec<NodeId>,
        linked_inactive: Vec<NodeId>,
        pending: Vec<NodeId>,
    },
    /// Request to establish a path toward `dst`, entering via `proxy`.
    SetupReq { proxy: NodeId, vset: Vec<NodeId> },
    /// Path establishment travelling from the terminal back to the requester.
    Setup {
        path_id: PathId,
        proxy: NodeId,
        vset: Vec<NodeId>,
    },
    /// Negative reply to a setup request.
    SetupFail { proxy: NodeId, vset: Vec<NodeId> },
    /// Removal of an established path, forwarded hop by hop.
    Teardown {
        path_id: PathId,
        endpoint: NodeId,
        vset: Vec<NodeId>,
    },
    /// Application data routed along established paths.
    Data { payload: Vec<u8> },
}

impl Payload {
    /// The message type this payload belongs to.
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::Hello { .. } => MessageType::Hello,
            Payload::SetupReq { .. } => MessageType::SetupReq,
            Payload::Setup { .. } => MessageType::Setup,
            Payload::SetupFail { .. } => MessageType::SetupFail,
            Payload::Teardown { .. } => MessageType::Teardown,
            Payload::Data { .. } => MessageType::Data,
        }
    }
}

/// Message envelope delivered through the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Logical originator of the protocol action.
    pub src: NodeId,
    /// Logical destination; 0 for broadcast messages.
    pub dst: NodeId,
    /// One-hop sender (the previous hop).
    pub sender: NodeId,
    /// One-hop target; [`BROADCAST`] for subnet broadcast.
    pub next_hop: NodeId,
    /// Type-tagged payload.
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_round_trip() {
        for kind in [
            MessageType::Hello,
            MessageType::SetupReq,
            MessageType::Setup,
            MessageType::SetupFail,
            MessageType::Teardown,
            MessageType::Data,
        ] {
            assert_eq!(MessageType::try_from(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_type_code_rejected() {
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(7).is_err());
        assert!(MessageType::try_from(255).is_err());
    }

    #[test]
    fn test_payload_kind() {
        let payload = Payload::Teardown {
            path_id: 7,
            endpoint: 42,
            vset: vec![],
        };
        assert_eq!(payload.kind(), MessageType::Teardown);
        assert_eq!(payload.kind().code(), 5);
    }
}
