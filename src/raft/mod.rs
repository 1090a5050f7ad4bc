//! Raft replication: sequences client mutations through an elected
//! leader and applies committed entries to the storage engine.
//!
//! The pieces, leaves first:
//!
//! - [`message`]: the client and peer RPC payloads with their code
//!   conventions
//! - [`transport`]: the `PeerClient` seam the RPC framework implements,
//!   plus leader-side per-follower state
//! - [`log`]: the bounded replicated log and its apply worker
//! - [`node`]: the consensus state machine, election timer and per-peer
//!   shippers
//!
//! The crate deliberately owns no sockets. A deployment implements
//! `PeerClient` over its RPC stack, routes inbound peer calls to
//! `Node::handle_request_vote` / `Node::handle_append_entries`, and
//! routes client calls to `Node::put` / `Node::delete` / `Node::get`.

pub mod log;
pub mod message;
pub mod node;
pub mod transport;

pub use log::{RaftLog, LOG_CAPACITY};
pub use message::{
    code, AppendRequest, AppendResponse, Entry, GetResponse, Op, PutResponse, VoteRequest,
    VoteResponse,
};
pub use node::{Node, Role};
pub use transport::{Peer, PeerClient};
