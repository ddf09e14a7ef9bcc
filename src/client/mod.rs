//! Leader-aware client library.
//!
//! Wraps the RPC surface behind methods that transparently follow
//! leadership: mutations retry across failovers, a background task keeps the
//! active endpoint pointed at the leader, and `subscribe` yields a `Session`
//! whose delivery stream re-establishes itself after migrations.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use crate::error::{Error, Result};
use crate::proto::chat::chat_message::Payload;
use crate::proto::chat::chat_service_client::ChatServiceClient;
use crate::proto::chat::{self as pb};
use crate::storage::now_secs;

/// How many times a mutation is retried across leader changes.
pub const RETRY_ATTEMPTS: usize = 3;
/// Pause between mutation retries, giving elections time to settle.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Cadence of the proactive leader poll.
pub const LEADER_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Bound on each unary call, connection included.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the local queue a `Session` buffers deliveries in.
const INCOMING_QUEUE_DEPTH: usize = 1024;

const SERVER_RECIPIENT: &str = "SERVER";

/// A client bound to one username and a static cluster list.
pub struct ChatClient {
    username: String,
    cluster: Vec<String>,
    /// The endpoint requests currently target; migrated on discovery.
    endpoint: RwLock<String>,
}

/// One live delivery subscription: the background stream task plus the local
/// queue it fills. Dropping the session cancels the task.
pub struct Session {
    pub username: String,
    incoming: mpsc::Receiver<pb::ChatMessage>,
    task: JoinHandle<()>,
}

impl Session {
    /// The next pushed message, or `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<pb::ChatMessage> {
        self.incoming.recv().await
    }

    pub fn try_recv(&mut self) -> Option<pb::ChatMessage> {
        self.incoming.try_recv().ok()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ChatClient {
    pub fn new(cluster: Vec<String>, username: impl Into<String>) -> Result<Self> {
        let cluster: Vec<String> = cluster.into_iter().filter(|addr| !addr.is_empty()).collect();
        let first = cluster
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidInput("cluster list must not be empty".into()))?;
        Ok(Self {
            username: username.into(),
            cluster,
            endpoint: RwLock::new(first),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The endpoint mutations currently target.
    pub fn current_endpoint(&self) -> String {
        self.endpoint.read().clone()
    }

    fn envelope(&self, recipient: &str, payload: Payload) -> pb::ChatMessage {
        pb::ChatMessage {
            sender: self.username.clone(),
            recipient: recipient.to_string(),
            timestamp: now_secs(),
            payload: Some(payload),
        }
    }

    /// The current endpoint first, then the rest of the cluster.
    fn discovery_candidates(&self) -> Vec<String> {
        let current = self.current_endpoint();
        let mut candidates = vec![current.clone()];
        candidates.extend(self.cluster.iter().filter(|addr| **addr != current).cloned());
        candidates
    }

    async fn dial(addr: &str) -> Result<ChatServiceClient<Channel>> {
        Ok(ChatServiceClient::connect(format!("http://{}", addr)).await?)
    }

    /// One unary call against one node, dispatched on the payload case.
    async fn call(&self, addr: &str, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let call = async {
            let mut client = Self::dial(addr).await?;
            let response = match &message.payload {
                Some(Payload::CreateAccount(_)) => client.create_account(message).await?,
                Some(Payload::Login(_)) => client.login(message).await?,
                Some(Payload::SendMessage(_)) => client.send_message(message).await?,
                Some(Payload::ReadConversation(_)) => client.read_conversation(message).await?,
                Some(Payload::ListAccounts(_)) => client.list_accounts(message).await?,
                Some(Payload::ListChatPartners(_)) => client.list_chat_partners(message).await?,
                Some(Payload::DeleteMessages(_)) => client.delete_messages(message).await?,
                Some(Payload::DeleteAccount(_)) => client.delete_account(message).await?,
                Some(Payload::MarkRead(_)) => client.mark_read(message).await?,
                Some(Payload::GetLeader(_)) => client.get_leader(message).await?,
                _ => return Err(Error::InvalidInput("not a unary request".into())),
            };
            Ok::<_, Error>(response.into_inner())
        };
        tokio::time::timeout(RPC_TIMEOUT, call).await?
    }

    fn error_text(response: &pb::ChatMessage) -> Option<&str> {
        match &response.payload {
            Some(Payload::Error(ack)) => Some(ack.text.as_str()),
            _ => None,
        }
    }

    /// Runs a mutation with leader rediscovery and bounded retries. An
    /// application-level ERROR that is not a leadership problem is returned
    /// to the caller untouched.
    async fn execute(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let mut last_error = Error::NotLeader("no attempt made".into());
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            let addr = self.current_endpoint();
            match self.call(&addr, message.clone()).await {
                Ok(response) => match Self::error_text(&response) {
                    Some(text) if text.contains("not leader") => {
                        debug!("{} is not the leader; rediscovering", addr);
                        last_error = Error::NotLeader(text.to_string());
                        let _ = self.discover_leader().await;
                    }
                    _ => return Ok(response),
                },
                Err(err) => {
                    warn!("request to {} failed: {}", addr, err);
                    last_error = err;
                    let _ = self.discover_leader().await;
                }
            }
        }
        Err(last_error)
    }

    /// Runs a read against the first node that answers.
    async fn execute_read(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let mut last_error = Error::Transport("no cluster node reachable".into());
        for addr in self.discovery_candidates() {
            match self.call(&addr, message.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!("read from {} failed: {}", addr, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Asks the given node who leads. `None` when the node answers but does
    /// not know.
    async fn leader_reported_by(&self, addr: &str) -> Result<Option<String>> {
        let response = self
            .call(addr, self.envelope(SERVER_RECIPIENT, Payload::GetLeader(pb::Empty {})))
            .await?;
        match response.payload {
            Some(Payload::Leader(info)) if !info.leader.is_empty() && info.leader != "Unknown" => {
                Ok(Some(info.leader))
            }
            _ => Ok(None),
        }
    }

    /// Health check: verifies the active endpoint answers RPCs at all, using
    /// a harmless one-row account listing as the probe.
    pub async fn connect(&self) -> Result<()> {
        let message = self.envelope(
            SERVER_RECIPIENT,
            Payload::ListAccounts(pb::AccountQuery { pattern: String::new(), page: 1 }),
        );
        self.call(&self.current_endpoint(), message).await.map(|_| ())
    }

    /// Finds the current leader, asking the active endpoint first and then
    /// every configured node, and migrates the active endpoint to it.
    pub async fn discover_leader(&self) -> Result<String> {
        for addr in self.discovery_candidates() {
            match self.leader_reported_by(&addr).await {
                Ok(Some(leader)) => {
                    if leader != self.current_endpoint() {
                        info!("leader is {}; migrating from {}", leader, self.current_endpoint());
                    }
                    *self.endpoint.write() = leader.clone();
                    return Ok(leader);
                }
                Ok(None) => debug!("{} does not know a leader", addr),
                Err(err) => debug!("leader lookup via {} failed: {}", addr, err),
            }
        }
        Err(Error::NotLeader("no cluster node reports a leader".into()))
    }

    /// Spawns the proactive poll that keeps the endpoint on the leader.
    pub fn spawn_leader_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEADER_POLL_INTERVAL).await;
                if let Err(err) = client.discover_leader().await {
                    warn!("leader poll failed: {}", err);
                }
            }
        })
    }

    pub async fn create_account(&self, password: &str) -> Result<()> {
        let message = self.envelope(
            SERVER_RECIPIENT,
            Payload::CreateAccount(pb::Credentials {
                username: self.username.clone(),
                password: password.to_string(),
            }),
        );
        expect_success(self.execute(message).await?)
    }

    /// Existence-only login. `Ok(false)` means the account does not exist
    /// and the caller should offer to create it.
    pub async fn login(&self, password: &str) -> Result<bool> {
        let message = self.envelope(
            SERVER_RECIPIENT,
            Payload::Login(pb::Credentials {
                username: self.username.clone(),
                password: password.to_string(),
            }),
        );
        let response = self.execute_read(message).await?;
        match Self::error_text(&response) {
            None => Ok(true),
            Some(text) if text.contains("does not exist") => Ok(false),
            Some(text) => Err(Error::Internal(text.to_string())),
        }
    }

    pub async fn send_message(&self, recipient: &str, text: &str) -> Result<()> {
        let message =
            self.envelope(recipient, Payload::SendMessage(pb::MessageText { text: text.to_string() }));
        expect_success(self.execute(message).await?)
    }

    pub async fn delete_messages(&self, ids: &[i64]) -> Result<()> {
        let message = self.envelope(
            SERVER_RECIPIENT,
            Payload::DeleteMessages(pb::MessageIds { message_ids: ids.to_vec() }),
        );
        expect_success(self.execute(message).await?)
    }

    pub async fn delete_account(&self) -> Result<()> {
        let message = self.envelope(SERVER_RECIPIENT, Payload::DeleteAccount(pb::Empty {}));
        expect_success(self.execute(message).await?)
    }

    pub async fn mark_read(&self, ids: &[i64]) -> Result<()> {
        let message =
            self.envelope(SERVER_RECIPIENT, Payload::MarkRead(pb::MessageIds { message_ids: ids.to_vec() }));
        expect_success(self.execute(message).await?)
    }

    pub async fn read_conversation(
        &self,
        partner: &str,
        offset: i64,
        limit: i64,
    ) -> Result<pb::ConversationPage> {
        let message = self.envelope(
            SERVER_RECIPIENT,
            Payload::ReadConversation(pb::ConversationRequest {
                partner: partner.to_string(),
                offset,
                limit,
            }),
        );
        let response = self.execute_read(message).await?;
        match response.payload {
            Some(Payload::Conversation(page)) => Ok(page),
            Some(Payload::Error(ack)) => Err(Error::Internal(ack.text)),
            other => Err(Error::Internal(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn list_accounts(&self, pattern: &str, page: u32) -> Result<pb::AccountPage> {
        let message = self.envelope(
            SERVER_RECIPIENT,
            Payload::ListAccounts(pb::AccountQuery { pattern: pattern.to_string(), page }),
        );
        let response = self.execute_read(message).await?;
        match response.payload {
            Some(Payload::Accounts(accounts)) => Ok(accounts),
            Some(Payload::Error(ack)) => Err(Error::Internal(ack.text)),
            other => Err(Error::Internal(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn list_chat_partners(&self) -> Result<pb::PartnerList> {
        let message = self.envelope(SERVER_RECIPIENT, Payload::ListChatPartners(pb::Empty {}));
        let response = self.execute_read(message).await?;
        match response.payload {
            Some(Payload::Partners(partners)) => Ok(partners),
            Some(Payload::Error(ack)) => Err(Error::Internal(ack.text)),
            other => Err(Error::Internal(format!("unexpected reply: {:?}", other))),
        }
    }

    /// Who the active endpoint believes leads, "Unknown" included.
    pub async fn get_leader(&self) -> Result<String> {
        let addr = self.current_endpoint();
        let response = self
            .call(&addr, self.envelope(SERVER_RECIPIENT, Payload::GetLeader(pb::Empty {})))
            .await?;
        match response.payload {
            Some(Payload::Leader(info)) => Ok(info.leader),
            other => Err(Error::Internal(format!("unexpected reply: {:?}", other))),
        }
    }

    async fn open_stream(&self, addr: &str) -> Result<tonic::Streaming<pb::ChatMessage>> {
        let mut client = Self::dial(addr).await?;
        let request = self.envelope(&self.username, Payload::ReadMessages(pb::Empty {}));
        let response = client.read_messages(request).await?;
        Ok(response.into_inner())
    }

    /// Opens the delivery subscription. The background task follows the
    /// leader: it reopens the stream when it ends, when the call fails, and
    /// when the active endpoint migrates away from the node it is on.
    pub fn subscribe(self: &Arc<Self>) -> Session {
        let client = Arc::clone(self);
        let username = self.username.clone();
        let (queue, incoming) = mpsc::channel(INCOMING_QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            loop {
                let _ = client.discover_leader().await;
                let addr = client.current_endpoint();
                match client.open_stream(&addr).await {
                    Ok(mut stream) => {
                        info!("delivery stream for {} open on {}", client.username, addr);
                        loop {
                            tokio::select! {
                                next = stream.message() => match next {
                                    Ok(Some(message)) => {
                                        if queue.send(message).await.is_err() {
                                            return;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(status) => {
                                        warn!("delivery stream on {} failed: {}", addr, status);
                                        break;
                                    }
                                },
                                _ = tokio::time::sleep(RETRY_BACKOFF) => {
                                    if client.current_endpoint() != addr {
                                        info!("leadership left {}; reopening stream", addr);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => warn!("could not open delivery stream on {}: {}", addr, err),
                }
                if queue.is_closed() {
                    return;
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        });

        Session { username, incoming, task }
    }
}

fn expect_success(response: pb::ChatMessage) -> Result<()> {
    match response.payload {
        Some(Payload::Success(_)) => Ok(()),
        Some(Payload::Error(ack)) => Err(Error::Internal(ack.text)),
        other => Err(Error::Internal(format!("unexpected reply: {:?}", other))),
    }
}
