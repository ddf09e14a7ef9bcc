//! Leader election and log-less primary-backup replication.
//!
//! Every node runs one `ReplicationManager`. Followers watch for heartbeats
//! and call elections on a randomized timeout; the leader emits heartbeats
//! and pushes each durable mutation to all alive peers, committing only when
//! a majority of the alive-set (snapshotted at call start) acknowledges.
//! The "log" is the store itself: indices only order commits, no entries are
//! kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::proto::chat::chat_service_client::ChatServiceClient;
use crate::proto::chat::replication_message::Content;
use crate::proto::chat::{
    AccountReplication, Deletion, Heartbeat, MessageReplication, ReplicationMessage,
    ReplicationResponse, ReplicationType, VoteRequest, VoteResponse,
};
use crate::storage::{now_secs, ChatStore};

/// The interval between leader heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
/// The minimum election timeout, in milliseconds.
pub const MIN_ELECTION_TIMEOUT_MS: u64 = 1_000;
/// The maximum election timeout, in milliseconds.
pub const MAX_ELECTION_TIMEOUT_MS: u64 = 2_000;
/// How long a vote solicitation may wait for each peer.
const VOTE_RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// How long heartbeat and replication calls may wait for each peer.
const PEER_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// The local node's replication role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Liveness bookkeeping for one peer.
#[derive(Clone, Debug)]
pub struct ReplicaInfo {
    pub addr: String,
    pub is_alive: bool,
    pub last_heartbeat: Instant,
}

/// Per-node replication state machine.
///
/// Lock acquisition order is fixed: role, term, voted_for, leader, replicas.
/// None of the locks is ever held across an await point.
pub struct ReplicationManager {
    self_id: String,
    store: Arc<ChatStore>,

    role: Mutex<Role>,
    term: Mutex<u64>,
    voted_for: Mutex<Option<String>>,
    leader: Mutex<Option<String>>,
    replicas: Mutex<HashMap<String, ReplicaInfo>>,

    last_log_index: AtomicU64,
    last_log_term: AtomicU64,
    commit_index: AtomicU64,

    election_in_progress: AtomicBool,
    /// Set by heartbeats and granted votes to preempt the election timer.
    election_reset: Notify,
}

impl ReplicationManager {
    /// Creates the manager without spawning its background tasks; peers are
    /// assumed alive until an RPC to them fails.
    pub fn new(self_id: impl Into<String>, peers: Vec<String>, store: Arc<ChatStore>) -> Arc<Self> {
        let self_id = self_id.into();
        let replicas = peers
            .into_iter()
            .filter(|addr| !addr.is_empty() && *addr != self_id)
            .map(|addr| {
                let info = ReplicaInfo {
                    addr: addr.clone(),
                    is_alive: true,
                    last_heartbeat: Instant::now(),
                };
                (addr, info)
            })
            .collect();

        Arc::new(Self {
            self_id,
            store,
            role: Mutex::new(Role::Follower),
            term: Mutex::new(0),
            voted_for: Mutex::new(None),
            leader: Mutex::new(None),
            replicas: Mutex::new(replicas),
            last_log_index: AtomicU64::new(0),
            last_log_term: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            election_in_progress: AtomicBool::new(false),
            election_reset: Notify::new(),
        })
    }

    /// Drives the election timer and the heartbeat emitter until the future
    /// is dropped. Neither loop ever exits on error; cancelling this future
    /// on node shutdown cancels both.
    pub async fn run(self: Arc<Self>) {
        info!(
            "replication started on {} with {} peers",
            self.self_id,
            self.replicas.lock().len()
        );
        let election = Arc::clone(&self).election_loop();
        let heartbeats = Arc::clone(&self).heartbeat_loop();
        futures::join!(election, heartbeats);
    }

    /// Detached variant of [`run`](Self::run) for callers without a
    /// surrounding future to tie the loops to.
    pub fn start(self: &Arc<Self>) {
        let rm = Arc::clone(self);
        tokio::spawn(rm.run());
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        *self.term.lock()
    }

    /// The last known leader endpoint, ours included.
    pub fn leader_endpoint(&self) -> Option<String> {
        self.leader.lock().clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    /// Test hook: assume leadership immediately, skipping the election.
    #[cfg(test)]
    pub(crate) fn force_leader(&self) {
        *self.role.lock() = Role::Leader;
        *self.leader.lock() = Some(self.self_id.clone());
    }

    fn alive_peers(&self) -> Vec<String> {
        self.replicas
            .lock()
            .values()
            .filter(|info| info.is_alive)
            .map(|info| info.addr.clone())
            .collect()
    }

    fn mark_peer(&self, addr: &str, alive: bool) {
        if let Some(info) = self.replicas.lock().get_mut(addr) {
            info.is_alive = alive;
            if alive {
                info.last_heartbeat = Instant::now();
            }
        }
    }

    /// Adopts a higher term seen on the wire and reverts to follower.
    fn step_down(&self, new_term: u64) {
        {
            let mut role = self.role.lock();
            let mut term = self.term.lock();
            if new_term < *term {
                return;
            }
            *role = Role::Follower;
            *term = new_term;
            *self.voted_for.lock() = None;
            *self.leader.lock() = None;
        }
        self.election_reset.notify_one();
        info!("{} stepped down to follower at term {}", self.self_id, new_term);
    }

    fn envelope(&self, rtype: ReplicationType, term: u64, content: Option<Content>) -> ReplicationMessage {
        ReplicationMessage {
            r#type: rtype as i32,
            term,
            server_id: self.self_id.clone(),
            timestamp: now_secs(),
            content,
        }
    }

    /// Election timer: waits a fresh randomized timeout each round, starting
    /// an election unless a heartbeat or granted vote preempted it.
    async fn election_loop(self: Arc<Self>) {
        loop {
            let timeout = Duration::from_millis(
                rand::thread_rng().gen_range(MIN_ELECTION_TIMEOUT_MS..MAX_ELECTION_TIMEOUT_MS),
            );
            tokio::select! {
                _ = self.election_reset.notified() => continue,
                _ = tokio::time::sleep(timeout) => {}
            }
            if self.role() != Role::Follower {
                continue;
            }
            if self.election_in_progress.swap(true, Ordering::SeqCst) {
                continue;
            }
            self.run_election().await;
            self.election_in_progress.store(false, Ordering::SeqCst);
        }
    }

    /// One candidacy: bump the term, vote for ourselves, and solicit votes
    /// from every alive peer in parallel.
    async fn run_election(&self) {
        let term = {
            let mut role = self.role.lock();
            let mut term = self.term.lock();
            *role = Role::Candidate;
            *term += 1;
            *self.voted_for.lock() = Some(self.self_id.clone());
            *term
        };

        let alive = self.alive_peers();
        let alive_count = 1 + alive.len();
        let needed = alive_count / 2 + 1;
        let mut votes = 1usize;
        debug!(
            "{} starting election for term {}: {} alive, {} votes needed",
            self.self_id, term, alive_count, needed
        );

        if votes >= needed {
            self.become_leader(term).await;
            return;
        }

        let request = self.envelope(
            ReplicationType::RequestVote,
            term,
            Some(Content::VoteRequest(VoteRequest {
                last_log_term: self.last_log_term.load(Ordering::SeqCst),
                last_log_index: self.last_log_index.load(Ordering::SeqCst),
            })),
        );

        let mut calls: FuturesUnordered<_> = alive
            .into_iter()
            .map(|addr| {
                let request = request.clone();
                async move {
                    let result = call_peer(&addr, request, VOTE_RPC_TIMEOUT).await;
                    (addr, result)
                }
            })
            .collect();

        while let Some((addr, result)) = calls.next().await {
            match result {
                Ok(response) => {
                    self.mark_peer(&addr, true);
                    if response.term > term {
                        self.step_down(response.term);
                        return;
                    }
                    if let Some(Content::VoteResponse(VoteResponse { vote_granted: true })) =
                        response.content
                    {
                        votes += 1;
                        debug!("{} vote granted by {}: {}/{}", self.self_id, addr, votes, needed);
                    }
                    if votes >= needed {
                        let still_candidate = {
                            let role = self.role.lock();
                            let current = self.term.lock();
                            *role == Role::Candidate && *current == term
                        };
                        if still_candidate {
                            self.become_leader(term).await;
                        }
                        return;
                    }
                }
                Err(err) => {
                    warn!("{} vote request to {} failed: {}", self.self_id, addr, err);
                    self.mark_peer(&addr, false);
                }
            }
        }

        let mut role = self.role.lock();
        if *role == Role::Candidate {
            *role = Role::Follower;
            info!(
                "{} election for term {} failed with {}/{} votes",
                self.self_id, term, votes, needed
            );
        }
    }

    async fn become_leader(&self, term: u64) {
        {
            let mut role = self.role.lock();
            *role = Role::Leader;
            *self.leader.lock() = Some(self.self_id.clone());
        }
        info!("{} elected leader for term {}", self.self_id, term);
        // Assert leadership right away instead of waiting out a tick.
        self.broadcast_heartbeat().await;
    }

    /// Heartbeat emitter: a no-op unless this node currently leads.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.role() != Role::Leader {
                continue;
            }
            self.broadcast_heartbeat().await;
        }
    }

    /// One heartbeat round. Stepping down happens here when a peer knows a
    /// higher term or when acks fall below the majority of the alive-set.
    async fn broadcast_heartbeat(&self) {
        let term = self.current_term();
        let alive = self.alive_peers();
        let alive_count = 1 + alive.len();
        let request = self.envelope(
            ReplicationType::Heartbeat,
            term,
            Some(Content::Heartbeat(Heartbeat {
                commit_index: self.commit_index.load(Ordering::SeqCst),
            })),
        );

        let mut acks = 1usize;
        let mut calls: FuturesUnordered<_> = alive
            .into_iter()
            .map(|addr| {
                let request = request.clone();
                async move {
                    let result = call_peer(&addr, request, PEER_RPC_TIMEOUT).await;
                    (addr, result)
                }
            })
            .collect();

        while let Some((addr, result)) = calls.next().await {
            match result {
                Ok(response) => {
                    if response.term > term {
                        self.step_down(response.term);
                        return;
                    }
                    self.mark_peer(&addr, true);
                    acks += 1;
                }
                Err(err) => {
                    debug!("{} heartbeat to {} failed: {}", self.self_id, addr, err);
                    self.mark_peer(&addr, false);
                }
            }
        }

        let needed = alive_count / 2 + 1;
        if acks < needed {
            warn!(
                "{} sees {}/{} heartbeat acks, needed {}; stepping down",
                self.self_id, acks, alive_count, needed
            );
            let mut role = self.role.lock();
            if *role == Role::Leader {
                *role = Role::Follower;
                *self.leader.lock() = None;
            }
        }
    }

    /// Replicates a stored message to the alive followers.
    pub async fn replicate_message(
        &self,
        message_id: i64,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<()> {
        let body = Content::MessageReplication(MessageReplication {
            message_id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
        });
        self.replicate(ReplicationType::ReplicateMessage, body).await
    }

    /// Replicates an account creation to the alive followers.
    pub async fn replicate_account(&self, username: &str) -> Result<()> {
        let body = Content::AccountReplication(AccountReplication {
            username: username.to_string(),
        });
        self.replicate(ReplicationType::ReplicateAccount, body).await
    }

    pub async fn replicate_delete_messages(&self, username: &str, ids: &[i64]) -> Result<()> {
        let body = Content::Deletion(Deletion {
            username: username.to_string(),
            message_ids: ids.to_vec(),
        });
        self.replicate(ReplicationType::ReplicateDeleteMessages, body).await
    }

    pub async fn replicate_delete_account(&self, username: &str) -> Result<()> {
        let body = Content::Deletion(Deletion {
            username: username.to_string(),
            message_ids: vec![],
        });
        self.replicate(ReplicationType::ReplicateDeleteAccount, body).await
    }

    pub async fn replicate_mark_read(&self, username: &str, ids: &[i64]) -> Result<()> {
        let body = Content::Deletion(Deletion {
            username: username.to_string(),
            message_ids: ids.to_vec(),
        });
        self.replicate(ReplicationType::ReplicateMarkRead, body).await
    }

    /// Pushes one mutation to every alive peer and commits iff a majority of
    /// the alive-set snapshotted here acknowledges. The caller rolls back its
    /// local write on `Err`.
    async fn replicate(&self, rtype: ReplicationType, body: Content) -> Result<()> {
        if self.role() != Role::Leader {
            return Err(Error::NotLeader("replication attempted on a non-leader".into()));
        }
        let term = self.current_term();
        let alive = self.alive_peers();
        let alive_count = 1 + alive.len();
        let needed = alive_count / 2 + 1;
        let request = self.envelope(rtype, term, Some(body));

        let mut acks = 1usize;
        let mut calls: FuturesUnordered<_> = alive
            .into_iter()
            .map(|addr| {
                let request = request.clone();
                async move {
                    let result = call_peer(&addr, request, PEER_RPC_TIMEOUT).await;
                    (addr, result)
                }
            })
            .collect();

        while let Some((addr, result)) = calls.next().await {
            match result {
                Ok(response) => {
                    self.mark_peer(&addr, true);
                    if response.term > term {
                        self.step_down(response.term);
                        return Err(Error::NotLeader("deposed during replication".into()));
                    }
                    match response.content {
                        Some(Content::ReplicationResponse(ReplicationResponse {
                            success: true,
                            ..
                        })) => acks += 1,
                        _ => warn!(
                            "{} replication to {} rejected ({:?})",
                            self.self_id, addr, rtype
                        ),
                    }
                }
                Err(err) => {
                    error!("{} replication to {} failed: {}", self.self_id, addr, err);
                    self.mark_peer(&addr, false);
                }
            }
        }

        if acks < needed {
            return Err(Error::Replication(format!(
                "{} of {} alive nodes acknowledged, needed {}",
                acks, alive_count, needed
            )));
        }

        let index = self.last_log_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_log_term.store(term, Ordering::SeqCst);
        self.commit_index.store(index, Ordering::SeqCst);
        debug!("{} committed index {} at term {}", self.self_id, index, term);
        Ok(())
    }

    /// Follower-side entry point for every peer message. Term rules run
    /// first; heartbeats reset the election timer before any role logic.
    pub fn handle_replication(&self, message: ReplicationMessage) -> ReplicationMessage {
        {
            let mut role = self.role.lock();
            let mut term = self.term.lock();
            if message.term > *term {
                *term = message.term;
                *role = Role::Follower;
                *self.voted_for.lock() = None;
                drop(term);
                drop(role);
                self.election_reset.notify_one();
            } else if message.term < *term {
                let current = *term;
                return self.envelope(ReplicationType::ReplicationError, current, None);
            }
        }

        match ReplicationType::from_i32(message.r#type) {
            Some(ReplicationType::RequestVote) => self.handle_vote_request(message),
            Some(ReplicationType::Heartbeat) => self.handle_heartbeat(message),
            Some(ReplicationType::ReplicateMessage) => self.apply_message(message),
            Some(ReplicationType::ReplicateAccount) => self.apply_account(message),
            Some(ReplicationType::ReplicateDeleteMessages) => self.apply_deletion(message, Apply::DeleteMessages),
            Some(ReplicationType::ReplicateDeleteAccount) => self.apply_deletion(message, Apply::DeleteAccount),
            Some(ReplicationType::ReplicateMarkRead) => self.apply_deletion(message, Apply::MarkRead),
            _ => self.envelope(ReplicationType::ReplicationError, self.current_term(), None),
        }
    }

    fn handle_vote_request(&self, message: ReplicationMessage) -> ReplicationMessage {
        let request = match message.content {
            Some(Content::VoteRequest(request)) => request,
            _ => VoteRequest::default(),
        };
        let candidate = message.server_id;

        let granted = {
            let mut voted_for = self.voted_for.lock();
            let free = voted_for.is_none() || voted_for.as_deref() == Some(candidate.as_str());
            let log_ok = request.last_log_term > self.last_log_term.load(Ordering::SeqCst)
                || (request.last_log_term == self.last_log_term.load(Ordering::SeqCst)
                    && request.last_log_index >= self.last_log_index.load(Ordering::SeqCst));
            if free && log_ok {
                *voted_for = Some(candidate.clone());
                true
            } else {
                false
            }
        };
        if granted {
            self.election_reset.notify_one();
            debug!("{} granted vote to {} at term {}", self.self_id, candidate, message.term);
        }

        self.envelope(
            ReplicationType::VoteResponse,
            self.current_term(),
            Some(Content::VoteResponse(VoteResponse { vote_granted: granted })),
        )
    }

    fn handle_heartbeat(&self, message: ReplicationMessage) -> ReplicationMessage {
        self.election_reset.notify_one();
        {
            let mut role = self.role.lock();
            let term = self.term.lock();
            if message.term == *term && *role != Role::Follower {
                *role = Role::Follower;
                *self.voted_for.lock() = None;
            }
        }
        *self.leader.lock() = Some(message.server_id);

        self.envelope(ReplicationType::ReplicationSuccess, self.current_term(), None)
    }

    /// Stores a leader-assigned message verbatim. A row that already exists
    /// with the same participants counts as success so retries are harmless.
    fn apply_message(&self, message: ReplicationMessage) -> ReplicationMessage {
        let body = match message.content {
            Some(Content::MessageReplication(body)) => body,
            _ => return self.envelope(ReplicationType::ReplicationError, self.current_term(), None),
        };

        let success = match self.store.get_message(body.message_id) {
            Ok(Some(existing)) => {
                existing.sender == body.sender && existing.recipient == body.recipient
            }
            Ok(None) => match self.store.store_message(
                &body.sender,
                &body.recipient,
                &body.content,
                false,
                Some(body.message_id),
            ) {
                Ok(stored) => stored.is_some(),
                Err(err) => {
                    error!("{} failed to store replicated message: {}", self.self_id, err);
                    false
                }
            },
            Err(err) => {
                error!("{} failed to look up replicated message: {}", self.self_id, err);
                false
            }
        };

        self.replication_response(success, body.message_id)
    }

    /// Creates a replicated account with an empty verifier; an existing
    /// account is success.
    fn apply_account(&self, message: ReplicationMessage) -> ReplicationMessage {
        let body = match message.content {
            Some(Content::AccountReplication(body)) => body,
            _ => return self.envelope(ReplicationType::ReplicationError, self.current_term(), None),
        };

        let success = match self.store.user_exists(&body.username) {
            Ok(true) => true,
            Ok(false) => self.store.create_account(&body.username, "").unwrap_or_else(|err| {
                error!("{} failed to create replicated account: {}", self.self_id, err);
                false
            }),
            Err(err) => {
                error!("{} failed to check replicated account: {}", self.self_id, err);
                false
            }
        };

        self.replication_response(success, 0)
    }

    fn apply_deletion(&self, message: ReplicationMessage, apply: Apply) -> ReplicationMessage {
        let body = match message.content {
            Some(Content::Deletion(body)) => body,
            _ => return self.envelope(ReplicationType::ReplicationError, self.current_term(), None),
        };

        let result = match apply {
            Apply::DeleteMessages => self.store.delete_messages(&body.username, &body.message_ids),
            Apply::DeleteAccount => self.store.delete_account(&body.username),
            Apply::MarkRead => self.store.mark_messages_as_read(&body.username, &body.message_ids),
        };
        let success = result.unwrap_or_else(|err| {
            error!("{} failed to apply replicated deletion: {}", self.self_id, err);
            false
        });

        self.replication_response(success, 0)
    }

    fn replication_response(&self, success: bool, message_id: i64) -> ReplicationMessage {
        self.envelope(
            ReplicationType::ReplicationResponse,
            self.current_term(),
            Some(Content::ReplicationResponse(ReplicationResponse { success, message_id })),
        )
    }
}

enum Apply {
    DeleteMessages,
    DeleteAccount,
    MarkRead,
}

/// Dials a peer and performs one HandleReplication call, bounded by
/// `timeout` including connection establishment.
async fn call_peer(
    addr: &str,
    request: ReplicationMessage,
    timeout: Duration,
) -> Result<ReplicationMessage> {
    let call = async {
        let mut client = ChatServiceClient::connect(format!("http://{}", addr)).await?;
        let response = client.handle_replication(request).await?;
        Ok::<_, Error>(response.into_inner())
    };
    tokio::time::timeout(timeout, call).await?
}
