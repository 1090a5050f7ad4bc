use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::compression::Codec;
use crate::error::{Error, Result};

/// Identity and endpoint of one cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding SSTs, the manifest and the replicated-log metadata
    pub dir: PathBuf,

    /// Maximum active memtable size before freezing (default: 3MiB)
    pub memtable_max_size: usize,

    /// Target data block size for SST writers (default: 4KiB)
    pub block_size: usize,

    /// Compression settings for SST data blocks
    pub compression: CompressionConfig,

    /// Block cache settings
    pub block_cache: BlockCacheConfig,

    /// Whether to attach a block cache to opened SSTs (default: true)
    pub enable_block_cache: bool,
}

impl DbConfig {
    /// Create a new config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memtable_max_size: 3 * 1024 * 1024,
            block_size: 4096,
            compression: CompressionConfig::default(),
            block_cache: BlockCacheConfig::default(),
            enable_block_cache: true,
        }
    }

    /// Set maximum memtable size
    pub fn memtable_max_size(mut self, size: usize) -> Self {
        self.memtable_max_size = size;
        self
    }

    /// Set the target SST data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Configure compression
    pub fn compression(mut self, config: CompressionConfig) -> Self {
        self.compression = config;
        self
    }

    /// Configure the block cache
    pub fn block_cache(mut self, config: BlockCacheConfig) -> Self {
        self.block_cache = config;
        self
    }

    /// Enable or disable the block cache
    pub fn enable_block_cache(mut self, enabled: bool) -> Self {
        self.enable_block_cache = enabled;
        self
    }
}

/// Compression settings for SST data blocks.
///
/// When `enabled` is false, tables are written in the plain block form with
/// no flags byte; readers must be opened with the same setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub codec: Codec,
    pub enabled: bool,
    /// Payloads smaller than this are stored raw even when enabled
    pub min_size_to_compress: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Lz4,
            enabled: false,
            min_size_to_compress: 64,
        }
    }
}

impl CompressionConfig {
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn min_size_to_compress(mut self, size: usize) -> Self {
        self.min_size_to_compress = size;
        self
    }

    /// Whether a payload of the given size should be run through the codec
    pub fn should_compress(&self, len: usize) -> bool {
        self.enabled && self.codec != Codec::None && len >= self.min_size_to_compress
    }
}

/// Block cache sizing and admission settings.
#[derive(Debug, Clone)]
pub struct BlockCacheConfig {
    /// Maximum cached bytes (default: 256MiB)
    pub max_capacity: usize,

    /// Reference block size for the utilization check (default: 4KiB)
    pub min_block_size: usize,

    /// Blocks larger than this are never cached (default: 64KiB)
    pub max_block_size: usize,

    /// Maximum number of cached blocks, 0 = unlimited
    pub max_block_count: usize,

    /// Reject blocks whose size / min_block_size falls below this
    pub min_utilization: f64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 256 * 1024 * 1024,
            min_block_size: 4096,
            max_block_size: 64 * 1024,
            max_block_count: 0,
            min_utilization: 0.5,
        }
    }
}

impl BlockCacheConfig {
    pub fn max_capacity(mut self, bytes: usize) -> Self {
        self.max_capacity = bytes;
        self
    }

    pub fn min_block_size(mut self, bytes: usize) -> Self {
        self.min_block_size = bytes;
        self
    }

    pub fn max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn max_block_count(mut self, count: usize) -> Self {
        self.max_block_count = count;
        self
    }

    pub fn min_utilization(mut self, ratio: f64) -> Self {
        self.min_utilization = ratio;
        self
    }
}

/// Timing and batching knobs for the Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Leader heartbeat interval (default: 1s)
    pub heartbeat_interval: Duration,

    /// Base election timeout; the effective timeout is randomized per term
    /// in [timeout, 1.5 * timeout] (default: 5s)
    pub election_timeout: Duration,

    /// Maximum entries shipped in one AppendEntries call (default: 64)
    pub max_batch_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            election_timeout: Duration::from_secs(5),
            max_batch_entries: 64,
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn max_batch_entries(mut self, max: usize) -> Self {
        self.max_batch_entries = max;
        self
    }
}

/// The cluster roster: every peer plus the local node's identity.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// All other cluster members
    pub peers: Vec<NodeAddr>,
    /// This node
    pub local: NodeAddr,
}

impl ClusterConfig {
    /// Load a roster from the plain-text config format: the member count on
    /// the first line, one `id host port` triple per member, then a final
    /// triple naming the local node.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut tokens = text.split_whitespace();

        let count: usize = tokens
            .next()
            .ok_or_else(|| Error::Corruption("cluster config is empty".to_string()))?
            .parse()
            .map_err(|_| Error::Corruption("bad member count in cluster config".to_string()))?;

        let mut members = Vec::with_capacity(count + 1);
        for _ in 0..count + 1 {
            let (id, host, port) = tokens.next_tuple().ok_or_else(|| {
                Error::Corruption("truncated member entry in cluster config".to_string())
            })?;
            members.push(NodeAddr {
                id: id.parse().map_err(|_| {
                    Error::Corruption(format!("bad node id {id:?} in cluster config"))
                })?,
                host: host.to_string(),
                port: port.parse().map_err(|_| {
                    Error::Corruption(format!("bad port {port:?} in cluster config"))
                })?,
            });
        }

        let local = match members.pop() {
            Some(local) => local,
            None => {
                return Err(Error::Corruption(
                    "cluster config names no local node".to_string(),
                ))
            }
        };
        let peers = members.into_iter().filter(|m| m.id != local.id).collect();
        Ok(Self { peers, local })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::new("/tmp/emberkv");
        assert_eq!(config.dir, PathBuf::from("/tmp/emberkv"));
        assert_eq!(config.memtable_max_size, 3 * 1024 * 1024);
        assert_eq!(config.block_size, 4096);
        assert!(!config.compression.enabled);
        assert!(config.enable_block_cache);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test")
            .memtable_max_size(512)
            .block_size(1024)
            .enable_block_cache(false)
            .compression(
                CompressionConfig::default()
                    .codec(Codec::Snappy)
                    .enabled(true)
                    .min_size_to_compress(32),
            );

        assert_eq!(config.memtable_max_size, 512);
        assert_eq!(config.block_size, 1024);
        assert!(!config.enable_block_cache);
        assert_eq!(config.compression.codec, Codec::Snappy);
        assert!(config.compression.should_compress(32));
        assert!(!config.compression.should_compress(31));
    }

    #[test]
    fn test_raft_config_defaults() {
        let config = RaftConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.election_timeout, Duration::from_secs(5));
        assert_eq!(config.max_batch_entries, 64);
    }

    #[test]
    fn test_cluster_config_load() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("raft.cfg");
        fs::write(
            &path,
            "3\n1 10.0.0.1 7001\n2 10.0.0.2 7002\n3 10.0.0.3 7003\n2 10.0.0.2 7002\n",
        )
        .expect("failed to write config");

        let cluster = ClusterConfig::load(&path).expect("failed to load config");
        assert_eq!(cluster.local.id, 2);
        assert_eq!(cluster.local.host, "10.0.0.2");
        assert_eq!(cluster.local.port, 7002);
        assert_eq!(cluster.peers.len(), 2);
        assert!(cluster.peers.iter().all(|p| p.id != 2));
    }

    #[test]
    fn test_cluster_config_truncated() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("raft.cfg");
        fs::write(&path, "2\n1 10.0.0.1 7001\n").expect("failed to write config");

        assert!(matches!(
            ClusterConfig::load(&path),
            Err(Error::Corruption(_))
        ));
    }
}
