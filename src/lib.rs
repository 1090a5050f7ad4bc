//! emberkv is a replicated ordered key-value store built from two
//! engines: a log-structured merge-tree storage engine and a Raft
//! replication layer that sequences client mutations through a leader
//! and applies committed entries to that engine.
//!
//! # Architecture
//!
//! ```text
//!  client ──► raft::Node (leader) ──► RaftLog ──► peers (majority)
//!                                        │
//!                                  apply worker
//!                                        ▼
//!                                       Db
//!                  ┌─────────────────────┼─────────────────────┐
//!                  ▼                     ▼                     ▼
//!          Active Memtable      Frozen Memtables        Manifest tip
//!            (SkipMap)            (flush queue)        ┌───────────┐
//!                                       │              │ Level 0   │
//!                                 flush worker         │ Level 1   │
//!                                       ▼              │  ...      │
//!                                  SSTs on disk ◄──────┴───────────┘
//!                                                      compaction
//! ```
//!
//! Transport, process lifecycle and configuration loading are external
//! collaborators: the crate exposes RPC handlers and the
//! [`raft::PeerClient`] seam, and consumes plain config structs.

pub mod bloom;
pub mod cache;
pub mod compression;
pub mod config;
pub mod db;
pub mod error;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod pool;
pub mod raft;
pub mod sstable;

pub use config::{BlockCacheConfig, ClusterConfig, CompressionConfig, DbConfig, NodeAddr, RaftConfig};
pub use db::{Db, DbStats};
pub use error::{Error, Result};
pub use raft::{Node, RaftLog};
