//! The seam between the consensus core and the RPC framework.
//!
//! The node never touches a socket: it calls `PeerClient` methods and the
//! surrounding process wires those to whatever transport it uses.
//! Implementations must enforce a per-call deadline (2 seconds by
//! convention) and surface expiry as `Error::Timeout`; the shippers treat
//! any error as "retry on the next cycle".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::NodeAddr;
use crate::error::Result;
use crate::raft::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};

/// Outbound RPC surface toward one peer.
pub trait PeerClient: Send + Sync {
    fn request_vote(&self, request: &VoteRequest) -> Result<VoteResponse>;
    fn append_entries(&self, request: &AppendRequest) -> Result<AppendResponse>;
}

/// Leader-side view of one follower.
///
/// `match_index <= next_index - 1` holds whenever this node is leader;
/// both are reset on every election win.
pub struct Peer {
    pub addr: NodeAddr,
    pub client: Arc<dyn PeerClient>,
    next_index: AtomicU64,
    match_index: AtomicU64,
    last_contact_ms: AtomicU64,
}

impl Peer {
    pub fn new(addr: NodeAddr, client: Arc<dyn PeerClient>) -> Self {
        Self {
            addr,
            client,
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            last_contact_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.addr.id
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    pub fn set_next_index(&self, index: u64) {
        self.next_index.store(index, Ordering::SeqCst);
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::SeqCst)
    }

    pub fn set_match_index(&self, index: u64) {
        self.match_index.store(index, Ordering::SeqCst);
    }

    /// Records a successful round-trip to this peer.
    pub fn touch(&self) {
        self.last_contact_ms.store(now_ms(), Ordering::SeqCst);
    }

    pub fn last_contact_ms(&self) -> u64 {
        self.last_contact_ms.load(Ordering::SeqCst)
    }

    /// Resets replication bookkeeping for a fresh leadership term.
    pub fn reset(&self, next_index: u64) {
        self.next_index.store(next_index, Ordering::SeqCst);
        self.match_index.store(0, Ordering::SeqCst);
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_bookkeeping() {
        struct NullClient;
        impl PeerClient for NullClient {
            fn request_vote(&self, _request: &VoteRequest) -> Result<VoteResponse> {
                Err(crate::error::Error::Timeout)
            }
            fn append_entries(&self, _request: &AppendRequest) -> Result<AppendResponse> {
                Err(crate::error::Error::Timeout)
            }
        }

        let peer = Peer::new(
            NodeAddr {
                id: 2,
                host: "10.0.0.2".to_string(),
                port: 7002,
            },
            Arc::new(NullClient),
        );

        assert_eq!(peer.id(), 2);
        assert_eq!(peer.next_index(), 1);
        assert_eq!(peer.match_index(), 0);

        peer.set_next_index(5);
        peer.set_match_index(4);
        assert!(peer.match_index() <= peer.next_index() - 1);

        peer.reset(8);
        assert_eq!(peer.next_index(), 8);
        assert_eq!(peer.match_index(), 0);

        assert_eq!(peer.last_contact_ms(), 0);
        peer.touch();
        assert!(peer.last_contact_ms() > 0);
    }
}
