//! Wire-facing message types for the client and peer RPC surfaces.
//!
//! The RPC framework marshals these however it likes; the core only
//! defines the fields and the response code conventions:
//!
//! - client codes: `0` ok, `1` not found, `-1` failure, `-2` not leader
//!   (with the believed leader address attached)
//! - peer codes: `0` accepted, `-1` term conflict or log mismatch,
//!   `-2` the follower's log is ahead of the leader's view

use serde::{Deserialize, Serialize};

use crate::config::NodeAddr;

pub mod code {
    pub const OK: i32 = 0;
    pub const NOT_FOUND: i32 = 1;
    pub const FAILURE: i32 = -1;
    pub const NOT_LEADER: i32 = -2;

    pub const ACCEPTED: i32 = 0;
    pub const MISMATCH: i32 = -1;
    pub const LOG_AHEAD: i32 = -2;
}

/// The mutation kind a log entry carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put,
    Delete,
}

/// One replicated log record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub op: Op,
    pub term: u64,
    /// 1-based position assigned by the leader that created the entry.
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u32,
    pub last_log_index: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    /// `0` granted, `-1` denied.
    pub code: i32,
}

impl VoteResponse {
    pub fn granted(&self) -> bool {
        self.code == code::OK
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub leader_id: u32,
    pub term: u64,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// Empty for a heartbeat.
    pub entries: Vec<Entry>,
    pub commit_index: u64,
}

impl AppendRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub code: i32,
    /// The responder's last log index, a hint for leader backtracking.
    pub last_log_index: u64,
}

/// Outcome of a client mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    pub code: i32,
    pub leader: Option<NodeAddr>,
}

impl PutResponse {
    pub fn ok() -> Self {
        Self {
            code: code::OK,
            leader: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            code: code::FAILURE,
            leader: None,
        }
    }

    pub fn not_leader(leader: Option<NodeAddr>) -> Self {
        match leader {
            Some(addr) => Self {
                code: code::NOT_LEADER,
                leader: Some(addr),
            },
            // Without a redirect target the client can only retry blind.
            None => Self::failure(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }
}

/// Outcome of a client read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub code: i32,
    pub value: Vec<u8>,
    pub leader: Option<NodeAddr>,
}

impl GetResponse {
    pub fn found(value: Vec<u8>) -> Self {
        Self {
            code: code::OK,
            value,
            leader: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            code: code::NOT_FOUND,
            value: Vec::new(),
            leader: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            code: code::FAILURE,
            value: Vec::new(),
            leader: None,
        }
    }

    pub fn not_leader(leader: Option<NodeAddr>) -> Self {
        Self {
            code: code::NOT_LEADER,
            value: Vec::new(),
            leader,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }
}
