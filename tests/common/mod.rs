//! Shared cluster harness for the integration tests: real nodes on loopback
//! sockets with per-node SQLite files in a temp directory.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::task::JoinHandle;

use featherchat::error::Result;
use featherchat::{serve, ChatClient, ChatStore, NodeConfig};

const ELECTION_DEADLINE: Duration = Duration::from_secs(15);

pub struct Cluster {
    pub addrs: Vec<String>,
    db_paths: Vec<String>,
    tasks: Vec<JoinHandle<Result<()>>>,
    // Holds the node databases for the duration of the test.
    _dir: TempDir,
}

impl Cluster {
    pub async fn start(size: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let addrs: Vec<String> = (0..size)
            .map(|_| {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
            })
            .collect();

        let mut db_paths = Vec::new();
        let mut tasks = Vec::new();
        for (i, addr) in addrs.iter().enumerate() {
            let db_path = dir
                .path()
                .join(format!("node{}.db", i))
                .to_string_lossy()
                .into_owned();
            let peers = addrs
                .iter()
                .filter(|peer| *peer != addr)
                .cloned()
                .collect::<Vec<_>>()
                .join(",");
            let config = NodeConfig {
                bind_addr: addr.clone(),
                db_path: db_path.clone(),
                peers,
            };
            db_paths.push(db_path);
            tasks.push(tokio::spawn(serve(config)));
        }

        Cluster { addrs, db_paths, tasks, _dir: dir }
    }

    /// Polls every node until one reports a leader that is not `exclude`.
    pub async fn wait_for_leader(&self, exclude: Option<&str>) -> String {
        let deadline = Instant::now() + ELECTION_DEADLINE;
        loop {
            for addr in &self.addrs {
                if Some(addr.as_str()) == exclude {
                    continue;
                }
                let probe = ChatClient::new(vec![addr.clone()], "probe").unwrap();
                if let Ok(leader) = probe.get_leader().await {
                    if !leader.is_empty() && leader != "Unknown" && Some(leader.as_str()) != exclude {
                        return leader;
                    }
                }
            }
            assert!(Instant::now() < deadline, "no leader elected within the deadline");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Stops one node. Dropping its serve future closes the listener and
    /// cancels its replication loops with it.
    pub fn kill(&mut self, addr: &str) {
        let index = self.addrs.iter().position(|a| a == addr).unwrap();
        self.tasks[index].abort();
    }

    /// A second connection to one node's backing file, for assertions.
    pub fn store(&self, addr: &str) -> ChatStore {
        let index = self.addrs.iter().position(|a| a == addr).unwrap();
        ChatStore::open(&self.db_paths[index]).unwrap()
    }

    pub fn client(&self, username: &str) -> Arc<ChatClient> {
        Arc::new(ChatClient::new(self.addrs.clone(), username).unwrap())
    }
}
