use serde_derive::Deserialize;

use crate::error::Result;

/// Configuration for a single cluster node.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Address the RPC server binds, as `host:port`. Also the node's id in
    /// the replication protocol.
    pub bind_addr: String,
    /// Path of the node's SQLite backing file.
    pub db_path: String,
    /// Comma-separated `host:port` peers, excluding this node.
    pub peers: String,
}

impl NodeConfig {
    /// Loads defaults, then the given file, then `FEATHERCHAT_*` environment
    /// overrides.
    pub fn new(file: &str) -> Result<Self> {
        let c = config::Config::builder()
            .set_default("bind_addr", "127.0.0.1:50051")?
            .set_default("db_path", "chat.db")?
            .set_default("peers", String::new())?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("FEATHERCHAT"));

        Ok(c.build()?.try_deserialize()?)
    }

    /// The peer list as individual addresses.
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Configuration for a leader-aware client.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// Comma-separated `host:port` cluster endpoints.
    pub cluster: String,
    pub username: String,
}

impl ClientConfig {
    pub fn new(file: &str) -> Result<Self> {
        let c = config::Config::builder()
            .set_default("cluster", "127.0.0.1:50051")?
            .set_default("username", String::new())?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("FEATHERCHAT_CLIENT"));

        Ok(c.build()?.try_deserialize()?)
    }

    pub fn cluster_addrs(&self) -> Vec<String> {
        self.cluster
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
