//! The user-facing RPC service.
//!
//! Terminates client RPCs, forwards mutations to the leader, serves reads
//! from the local store, and fans live deliveries out to subscribed
//! recipients. One `ChatServer` per node, shared with tonic by cloning.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::proto::chat::chat_message::Payload;
use crate::proto::chat::chat_service_client::ChatServiceClient;
use crate::proto::chat::chat_service_server::{ChatService, ChatServiceServer};
use crate::proto::chat::{self as pb};
use crate::replication::ReplicationManager;
use crate::storage::{now_secs, ChatStore, MessageRow};

/// Bound on each subscriber's delivery queue; overflow closes that
/// subscription and the client reopens to re-drain.
pub const SUBSCRIPTION_QUEUE_DEPTH: usize = 1024;
/// Usernames per `ListAccounts` page.
pub const ACCOUNTS_PER_PAGE: u32 = 10;
/// Bound on concurrent requests per client connection.
const RPC_WORKERS: usize = 10;
/// How long a forwarded mutation may wait on the leader.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

const SERVER_SENDER: &str = "SERVER";

type SubscriberQueues = HashMap<String, Vec<mpsc::Sender<pb::ChatMessage>>>;

/// Which client mutations a follower may relay to the leader.
enum ForwardKind {
    CreateAccount,
    SendMessage,
    DeleteMessages,
    DeleteAccount,
    MarkRead,
}

/// Shared per-node service state behind the tonic server.
#[derive(Clone)]
pub struct ChatServer {
    self_id: String,
    store: Arc<ChatStore>,
    replication: Arc<ReplicationManager>,
    subscriptions: Arc<Mutex<SubscriberQueues>>,
}

/// Opens the store, starts replication, and serves RPCs until the process
/// exits. A store that cannot be opened aborts the node.
pub async fn serve(config: NodeConfig) -> Result<()> {
    let store = Arc::new(ChatStore::open(&config.db_path)?);
    let replication =
        ReplicationManager::new(config.bind_addr.clone(), config.peer_addrs(), Arc::clone(&store));

    let server = ChatServer::new(config.bind_addr.clone(), store, Arc::clone(&replication));
    let addr = config.bind_addr.parse()?;
    info!("chat service listening on {}", addr);
    let rpc = tonic::transport::Server::builder()
        .concurrency_limit_per_connection(RPC_WORKERS)
        .add_service(ChatServiceServer::new(server))
        .serve(addr);

    // The replication loops live exactly as long as the RPC server: dropping
    // this future on shutdown cancels them with it.
    tokio::select! {
        result = rpc => result?,
        _ = replication.run() => {}
    }
    Ok(())
}

impl ChatServer {
    pub fn new(
        self_id: String,
        store: Arc<ChatStore>,
        replication: Arc<ReplicationManager>,
    ) -> Self {
        Self {
            self_id,
            store,
            replication,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn reply(&self, recipient: &str, payload: Payload) -> pb::ChatMessage {
        pb::ChatMessage {
            sender: SERVER_SENDER.to_string(),
            recipient: recipient.to_string(),
            timestamp: now_secs(),
            payload: Some(payload),
        }
    }

    fn success(&self, recipient: &str, text: &str) -> pb::ChatMessage {
        self.reply(recipient, Payload::Success(pb::Ack { text: text.to_string() }))
    }

    fn failure(&self, recipient: &str, text: &str) -> pb::ChatMessage {
        self.reply(recipient, Payload::Error(pb::Ack { text: text.to_string() }))
    }

    /// Relays a mutation verbatim to the current leader. Any failure here is
    /// reported as a not-leader error so clients rediscover and retry.
    async fn forward_to_leader(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let kind = match &message.payload {
            Some(Payload::CreateAccount(_)) => ForwardKind::CreateAccount,
            Some(Payload::SendMessage(_)) => ForwardKind::SendMessage,
            Some(Payload::DeleteMessages(_)) => ForwardKind::DeleteMessages,
            Some(Payload::DeleteAccount(_)) => ForwardKind::DeleteAccount,
            Some(Payload::MarkRead(_)) => ForwardKind::MarkRead,
            _ => return Err(Error::Internal("request cannot be forwarded".into())),
        };
        let leader = match self.replication.leader_endpoint() {
            Some(leader) if leader != self.self_id => leader,
            _ => return Err(Error::NotLeader("no leader is known; retry".into())),
        };
        debug!("{} forwarding request to leader {}", self.self_id, leader);

        let call = async {
            let mut client = ChatServiceClient::connect(format!("http://{}", leader)).await?;
            let response = match kind {
                ForwardKind::CreateAccount => client.create_account(message).await?,
                ForwardKind::SendMessage => client.send_message(message).await?,
                ForwardKind::DeleteMessages => client.delete_messages(message).await?,
                ForwardKind::DeleteAccount => client.delete_account(message).await?,
                ForwardKind::MarkRead => client.mark_read(message).await?,
            };
            Ok::<_, Error>(response.into_inner())
        };
        match tokio::time::timeout(FORWARD_TIMEOUT, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(Error::NotLeader(format!("forwarding to {} failed: {}", leader, err))),
            Err(_) => Err(Error::NotLeader(format!("forwarding to {} timed out", leader))),
        }
    }

    /// Pushes a committed message to every live queue of its recipient.
    /// Full or closed queues are dropped, which ends those streams.
    fn deliver_local(&self, sender: &str, recipient: &str, text: &str, id: i64) -> bool {
        let push = pb::ChatMessage {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp: now_secs(),
            payload: Some(Payload::Delivery(pb::DeliveredMessage { id, text: text.to_string() })),
        };

        let mut subscriptions = self.subscriptions.lock();
        let queues = match subscriptions.get_mut(recipient) {
            Some(queues) => queues,
            None => return false,
        };
        let mut delivered = false;
        queues.retain(|queue| match queue.try_send(push.clone()) {
            Ok(()) => {
                delivered = true;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("subscription queue for {} overflowed; closing it", recipient);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if queues.is_empty() {
            subscriptions.remove(recipient);
        }
        delivered
    }

    async fn do_create_account(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let credentials = match &message.payload {
            Some(Payload::CreateAccount(credentials)) => credentials.clone(),
            _ => return Err(Error::InvalidInput("malformed CreateAccount request".into())),
        };
        let username = if credentials.username.is_empty() {
            message.sender.clone()
        } else {
            credentials.username.clone()
        };
        if username.is_empty() || credentials.password.is_empty() {
            return Err(Error::InvalidInput("username and password must not be empty".into()));
        }
        if !self.replication.is_leader() {
            return self.forward_to_leader(message).await;
        }

        if self.store.user_exists(&username)? {
            return Err(Error::InvalidInput("Username already exists".into()));
        }
        let verifier = bcrypt::hash(&credentials.password, bcrypt::DEFAULT_COST)?;
        if !self.store.create_account(&username, &verifier)? {
            return Err(Error::InvalidInput("Username already exists".into()));
        }

        if let Err(err) = self.replication.replicate_account(&username).await {
            if let Err(rollback) = self.store.delete_account(&username) {
                error!("rollback of account {} failed: {}", username, rollback);
            }
            return Err(err);
        }
        Ok(self.success(&username, "Account created successfully"))
    }

    fn do_login(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let credentials = match &message.payload {
            Some(Payload::Login(credentials)) => credentials.clone(),
            _ => return Err(Error::InvalidInput("malformed Login request".into())),
        };
        let username = if credentials.username.is_empty() {
            message.sender.clone()
        } else {
            credentials.username
        };
        if username.is_empty() {
            return Err(Error::InvalidInput("username must not be empty".into()));
        }

        // Existence-only: a missing account signals the client to offer
        // account creation instead.
        if !self.store.user_exists(&username)? {
            return Ok(self.failure(
                &username,
                "User does not exist. Account will be created automatically. Please set a password.",
            ));
        }
        Ok(self.success(&username, "Login successful"))
    }

    async fn do_send_message(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let text = match &message.payload {
            Some(Payload::SendMessage(body)) => body.text.clone(),
            _ => return Err(Error::InvalidInput("malformed SendMessage request".into())),
        };
        let sender = message.sender.clone();
        let recipient = message.recipient.clone();
        if sender.is_empty() || recipient.is_empty() {
            return Err(Error::InvalidInput("sender and recipient must not be empty".into()));
        }
        if !self.store.user_exists(&recipient)? {
            return Err(Error::NotFound(format!("Recipient {} does not exist", recipient)));
        }
        if !self.replication.is_leader() {
            return self.forward_to_leader(message).await;
        }

        let id = self
            .store
            .store_message(&sender, &recipient, &text, false, None)?
            .ok_or_else(|| Error::Internal("failed to store message".into()))?;

        if let Err(err) = self.replication.replicate_message(id, &sender, &recipient, &text).await {
            // The mutation is not committed; it must not survive locally.
            if let Err(rollback) = self.store.purge_message(id) {
                error!("rollback of message {} failed: {}", id, rollback);
            }
            return Err(err);
        }

        if self.deliver_local(&sender, &recipient, &text, id) {
            self.store.mark_message_as_delivered(id)?;
        }
        Ok(self.success(&sender, "Message sent successfully"))
    }

    async fn do_delete_messages(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let ids = match &message.payload {
            Some(Payload::DeleteMessages(body)) => body.message_ids.clone(),
            _ => return Err(Error::InvalidInput("malformed DeleteMessages request".into())),
        };
        let username = message.sender.clone();
        if username.is_empty() {
            return Err(Error::InvalidInput("sender must not be empty".into()));
        }
        if !self.replication.is_leader() {
            return self.forward_to_leader(message).await;
        }

        if !self.store.delete_messages(&username, &ids)? {
            return Err(Error::NotFound(format!("User {} does not exist", username)));
        }
        if let Err(err) = self.replication.replicate_delete_messages(&username, &ids).await {
            if let Err(rollback) = self.store.undelete_messages(&username, &ids) {
                error!("rollback of message deletion for {} failed: {}", username, rollback);
            }
            return Err(err);
        }
        Ok(self.success(&username, "Messages deleted successfully."))
    }

    async fn do_delete_account(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let username = message.sender.clone();
        if username.is_empty() {
            return Err(Error::InvalidInput("sender must not be empty".into()));
        }
        if !self.replication.is_leader() {
            return self.forward_to_leader(message).await;
        }

        if !self.store.delete_account(&username)? {
            return Err(Error::NotFound(format!("Account {} does not exist", username)));
        }
        if let Err(err) = self.replication.replicate_delete_account(&username).await {
            // The cascade cannot be undone; surface the inconsistency loudly.
            error!(
                "account {} deleted locally but not replicated: {}; state may diverge until retried",
                username, err
            );
            return Err(err);
        }
        Ok(self.success(&username, "Account deleted successfully."))
    }

    async fn do_mark_read(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let ids = match &message.payload {
            Some(Payload::MarkRead(body)) => body.message_ids.clone(),
            _ => return Err(Error::InvalidInput("malformed MarkRead request".into())),
        };
        let username = message.sender.clone();
        if username.is_empty() {
            return Err(Error::InvalidInput("sender must not be empty".into()));
        }
        if !self.replication.is_leader() {
            return self.forward_to_leader(message).await;
        }

        if !self.store.mark_messages_as_read(&username, &ids)? {
            return Err(Error::NotFound("Failed to update read status".into()));
        }
        // No rollback here: read flags are monotonic, and un-reading them
        // would break that. A failed round leaves the leader ahead until the
        // next mark-read converges.
        self.replication.replicate_mark_read(&username, &ids).await?;
        Ok(self.success(&username, "Read status updated successfully."))
    }

    fn do_read_conversation(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let request = match &message.payload {
            Some(Payload::ReadConversation(request)) => request.clone(),
            _ => return Err(Error::InvalidInput("malformed ReadConversation request".into())),
        };
        let username = message.sender.clone();
        if username.is_empty() || request.partner.is_empty() {
            return Err(Error::InvalidInput("sender and partner must not be empty".into()));
        }

        // A zero limit falls back to the stored per-conversation page size.
        let limit = if request.limit == 0 {
            self.store.get_chat_message_limit(&username, &request.partner)?
        } else {
            request.limit
        };
        let page = self
            .store
            .get_messages_between_users(&username, &request.partner, request.offset, limit)?;
        let messages = page.messages.into_iter().map(row_to_wire).collect();
        Ok(self.reply(
            &username,
            Payload::Conversation(pb::ConversationPage { messages, total: page.total }),
        ))
    }

    fn do_list_accounts(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let query = match &message.payload {
            Some(Payload::ListAccounts(query)) => query.clone(),
            _ => return Err(Error::InvalidInput("malformed ListAccounts request".into())),
        };
        let page = if query.page == 0 { 1 } else { query.page };
        let listing = self.store.list_accounts(&query.pattern, page, ACCOUNTS_PER_PAGE)?;
        Ok(self.reply(
            &message.sender,
            Payload::Accounts(pb::AccountPage {
                users: listing.users,
                total: listing.total,
                page: listing.page,
                per_page: listing.per_page,
            }),
        ))
    }

    fn do_list_chat_partners(&self, message: pb::ChatMessage) -> Result<pb::ChatMessage> {
        let username = message.sender.clone();
        if username.is_empty() {
            return Err(Error::InvalidInput("sender must not be empty".into()));
        }
        let partners = self.store.get_chat_partners(&username)?;
        let mut unread_map = HashMap::new();
        for partner in &partners {
            unread_map.insert(partner.clone(), self.store.get_unread_between_users(&username, partner)?);
        }
        Ok(self.reply(
            &username,
            Payload::Partners(pb::PartnerList { chat_partners: partners, unread_map }),
        ))
    }

    fn do_get_leader(&self, message: pb::ChatMessage) -> pb::ChatMessage {
        let leader = self.replication.leader_endpoint().unwrap_or_else(|| "Unknown".to_string());
        debug!("{} reporting leader {}", self.self_id, leader);
        self.reply(&message.sender, Payload::Leader(pb::LeaderInfo { leader }))
    }
}

fn row_to_wire(row: MessageRow) -> pb::StoredMessage {
    pb::StoredMessage {
        id: row.id,
        from: row.sender,
        to: row.recipient,
        content: row.content,
        timestamp: row.timestamp,
        is_read: row.is_read,
        is_delivered: row.is_delivered,
    }
}

/// Errors become ERROR envelopes addressed back to the requester; only
/// malformed streams surface as RPC-level status codes.
fn unwrap_reply(recipient: &str, server: &ChatServer, result: Result<pb::ChatMessage>) -> pb::ChatMessage {
    match result {
        Ok(reply) => reply,
        Err(err) => server.failure(recipient, &err.to_string()),
    }
}

#[tonic::async_trait]
impl ChatService for ChatServer {
    async fn create_account(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_create_account(message).await;
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn login(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_login(message);
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn send_message(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_send_message(message).await;
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    type ReadMessagesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<pb::ChatMessage, Status>> + Send>>;

    /// Opens a long-lived delivery stream: queue registration, then the
    /// undelivered backlog in timestamp order, then live pushes until the
    /// client goes away.
    async fn read_messages(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<Self::ReadMessagesStream>, Status> {
        let message = request.into_inner();
        let username = if message.recipient.is_empty() {
            message.sender
        } else {
            message.recipient
        };
        if username.is_empty() {
            return Err(Status::invalid_argument("subscriber username is required"));
        }
        if !self.store.user_exists(&username)? {
            return Err(Status::not_found(format!("User {} does not exist", username)));
        }

        let (queue, receiver) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        self.subscriptions.lock().entry(username.clone()).or_default().push(queue);
        info!("{} opened a delivery stream for {}", self.self_id, username);

        // Registration happened first, so anything pushed live from here on
        // is already marked delivered and stays out of this backlog query.
        let backlog = self.store.get_undelivered_messages(&username)?;
        let mut drained: Vec<std::result::Result<pb::ChatMessage, Status>> =
            Vec::with_capacity(backlog.len());
        for row in backlog {
            drained.push(Ok(pb::ChatMessage {
                sender: row.sender.clone(),
                recipient: username.clone(),
                timestamp: row.timestamp,
                payload: Some(Payload::Delivery(pb::DeliveredMessage {
                    id: row.id,
                    text: row.content,
                })),
            }));
            if let Err(err) = self.store.mark_message_as_delivered(row.id) {
                error!("failed to mark message {} delivered: {}", row.id, err);
            }
        }

        let live = ReceiverStream::new(receiver).map(Ok);
        let combined = stream::iter(drained).chain(live);
        Ok(Response::new(Box::pin(combined)))
    }

    async fn read_conversation(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_read_conversation(message);
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn list_accounts(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_list_accounts(message);
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn list_chat_partners(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_list_chat_partners(message);
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn delete_messages(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_delete_messages(message).await;
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn delete_account(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_delete_account(message).await;
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn mark_read(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        let requester = message.sender.clone();
        let result = self.do_mark_read(message).await;
        Ok(Response::new(unwrap_reply(&requester, self, result)))
    }

    async fn get_leader(
        &self,
        request: Request<pb::ChatMessage>,
    ) -> std::result::Result<Response<pb::ChatMessage>, Status> {
        let message = request.into_inner();
        Ok(Response::new(self.do_get_leader(message)))
    }

    async fn handle_replication(
        &self,
        request: Request<pb::ReplicationMessage>,
    ) -> std::result::Result<Response<pb::ReplicationMessage>, Status> {
        let response = self.replication.handle_replication(request.into_inner());
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::chat::chat_service_server::ChatService as _;
    use pretty_assertions::assert_eq;

    fn envelope(sender: &str, recipient: &str, payload: Payload) -> pb::ChatMessage {
        pb::ChatMessage {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp: now_secs(),
            payload: Some(payload),
        }
    }

    fn error_text(reply: &pb::ChatMessage) -> &str {
        match &reply.payload {
            Some(Payload::Error(ack)) => &ack.text,
            other => panic!("expected an error payload, got {:?}", other),
        }
    }

    fn follower_server() -> ChatServer {
        let store = Arc::new(ChatStore::open(":memory:").unwrap());
        let replication =
            ReplicationManager::new("127.0.0.1:7000", vec!["127.0.0.1:7001".into()], Arc::clone(&store));
        ChatServer::new("127.0.0.1:7000".into(), store, replication)
    }

    /// A single-node server whose replication manager has already won its
    /// own election, so mutations commit without any network.
    async fn leader_server() -> ChatServer {
        let store = Arc::new(ChatStore::open(":memory:").unwrap());
        let replication = ReplicationManager::new("127.0.0.1:7000", vec![], Arc::clone(&store));
        replication.start();
        for _ in 0..100 {
            if replication.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(replication.is_leader());
        ChatServer::new("127.0.0.1:7000".into(), store, replication)
    }

    async fn create_account(server: &ChatServer, name: &str) {
        let reply = server
            .create_account(Request::new(envelope(
                name,
                SERVER_SENDER,
                Payload::CreateAccount(pb::Credentials {
                    username: name.to_string(),
                    password: "pw".to_string(),
                }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.payload, Some(Payload::Success(_))), "{:?}", reply);
    }

    #[tokio::test]
    async fn mutations_on_a_leaderless_follower_say_not_leader() {
        let server = follower_server();
        let reply = server
            .create_account(Request::new(envelope(
                "alice",
                SERVER_SENDER,
                Payload::CreateAccount(pb::Credentials {
                    username: "alice".into(),
                    password: "pw".into(),
                }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("not leader"));
    }

    #[tokio::test]
    async fn reads_work_without_a_leader() {
        let server = follower_server();
        server.store.create_account("alice", "").unwrap();

        let reply = server
            .list_accounts(Request::new(envelope(
                "alice",
                SERVER_SENDER,
                Payload::ListAccounts(pb::AccountQuery { pattern: String::new(), page: 1 }),
            )))
            .await
            .unwrap()
            .into_inner();
        match reply.payload {
            Some(Payload::Accounts(page)) => {
                assert_eq!(page.users, vec!["alice"]);
                assert_eq!(page.per_page, ACCOUNTS_PER_PAGE);
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        let reply = server
            .get_leader(Request::new(envelope("alice", SERVER_SENDER, Payload::GetLeader(pb::Empty {}))))
            .await
            .unwrap()
            .into_inner();
        match reply.payload {
            Some(Payload::Leader(info)) => assert_eq!(info.leader, "Unknown"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn account_round_trip_and_login_contract() {
        let server = leader_server().await;
        create_account(&server, "alice").await;

        // Duplicate usernames are rejected.
        let reply = server
            .create_account(Request::new(envelope(
                "alice",
                SERVER_SENDER,
                Payload::CreateAccount(pb::Credentials {
                    username: "alice".into(),
                    password: "pw2".into(),
                }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("already exists"));

        // Login is an existence check.
        let reply = server
            .login(Request::new(envelope(
                "alice",
                SERVER_SENDER,
                Payload::Login(pb::Credentials { username: "alice".into(), password: "anything".into() }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.payload, Some(Payload::Success(_))));

        let reply = server
            .login(Request::new(envelope(
                "ghost",
                SERVER_SENDER,
                Payload::Login(pb::Credentials { username: "ghost".into(), password: "pw".into() }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_read_conversation() {
        let server = leader_server().await;
        create_account(&server, "alice").await;
        create_account(&server, "bob").await;

        let reply = server
            .send_message(Request::new(envelope(
                "alice",
                "bob",
                Payload::SendMessage(pb::MessageText { text: "hi".into() }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.payload, Some(Payload::Success(_))), "{:?}", reply);

        let reply = server
            .read_conversation(Request::new(envelope(
                "alice",
                SERVER_SENDER,
                Payload::ReadConversation(pb::ConversationRequest {
                    partner: "bob".into(),
                    offset: 0,
                    limit: 50,
                }),
            )))
            .await
            .unwrap()
            .into_inner();
        match reply.payload {
            Some(Payload::Conversation(page)) => {
                assert_eq!(page.total, 1);
                assert_eq!(page.messages[0].content, "hi");
                assert_eq!(page.messages[0].from, "alice");
                assert_eq!(page.messages[0].to, "bob");
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        // Sending to nobody is rejected without state change.
        let reply = server
            .send_message(Request::new(envelope(
                "alice",
                "ghost",
                Payload::SendMessage(pb::MessageText { text: "hello?".into() }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_backlog_then_live_delivery() {
        let server = leader_server().await;
        create_account(&server, "alice").await;
        create_account(&server, "bob").await;

        // Sent while bob has no subscription: stays undelivered.
        server
            .send_message(Request::new(envelope(
                "alice",
                "bob",
                Payload::SendMessage(pb::MessageText { text: "later".into() }),
            )))
            .await
            .unwrap();
        let stored = server.store.get_undelivered_messages("bob").unwrap();
        assert_eq!(stored.len(), 1);

        let mut stream = server
            .read_messages(Request::new(envelope("bob", "bob", Payload::ReadMessages(pb::Empty {}))))
            .await
            .unwrap()
            .into_inner();

        // Backlog first, and draining it flips the delivered flag.
        let first = stream.next().await.unwrap().unwrap();
        match first.payload {
            Some(Payload::Delivery(delivery)) => assert_eq!(delivery.text, "later"),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(server.store.get_undelivered_messages("bob").unwrap().is_empty());

        // A message sent while subscribed arrives live and is delivered.
        server
            .send_message(Request::new(envelope(
                "alice",
                "bob",
                Payload::SendMessage(pb::MessageText { text: "now".into() }),
            )))
            .await
            .unwrap();
        let second = stream.next().await.unwrap().unwrap();
        match second.payload {
            Some(Payload::Delivery(delivery)) => assert_eq!(delivery.text, "now"),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(server.store.get_undelivered_messages("bob").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mark_read_and_partner_listing() {
        let server = leader_server().await;
        create_account(&server, "alice").await;
        create_account(&server, "bob").await;
        for text in ["one", "two"] {
            server
                .send_message(Request::new(envelope(
                    "alice",
                    "bob",
                    Payload::SendMessage(pb::MessageText { text: text.into() }),
                )))
                .await
                .unwrap();
        }

        let reply = server
            .list_chat_partners(Request::new(envelope("bob", SERVER_SENDER, Payload::ListChatPartners(pb::Empty {}))))
            .await
            .unwrap()
            .into_inner();
        match reply.payload {
            Some(Payload::Partners(partners)) => {
                assert_eq!(partners.chat_partners, vec!["alice"]);
                assert_eq!(partners.unread_map.get("alice"), Some(&2));
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        let reply = server
            .mark_read(Request::new(envelope(
                "bob",
                SERVER_SENDER,
                Payload::MarkRead(pb::MessageIds { message_ids: vec![] }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.payload, Some(Payload::Success(_))));
        assert_eq!(server.store.get_unread_between_users("bob", "alice").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_messages_and_account() {
        let server = leader_server().await;
        create_account(&server, "alice").await;
        create_account(&server, "bob").await;
        server
            .send_message(Request::new(envelope(
                "alice",
                "bob",
                Payload::SendMessage(pb::MessageText { text: "gone soon".into() }),
            )))
            .await
            .unwrap();
        let id = server.store.get_messages_between_users("alice", "bob", 0, 1).unwrap().messages[0].id;

        let reply = server
            .delete_messages(Request::new(envelope(
                "alice",
                SERVER_SENDER,
                Payload::DeleteMessages(pb::MessageIds { message_ids: vec![id] }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.payload, Some(Payload::Success(_))));
        // Only the deleting side's view changes.
        assert_eq!(server.store.get_messages_between_users("alice", "bob", 0, 50).unwrap().total, 0);
        assert_eq!(server.store.get_messages_between_users("bob", "alice", 0, 50).unwrap().total, 1);

        let reply = server
            .delete_account(Request::new(envelope("bob", SERVER_SENDER, Payload::DeleteAccount(pb::Empty {}))))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.payload, Some(Payload::Success(_))));
        assert!(!server.store.user_exists("bob").unwrap());
        assert_eq!(server.store.get_messages_between_users("alice", "bob", 0, 50).unwrap().total, 0);
    }

    /// A "leader" whose only peer is unreachable, so every replication call
    /// misses quorum.
    fn isolated_leader() -> ChatServer {
        let store = Arc::new(ChatStore::open(":memory:").unwrap());
        let replication =
            ReplicationManager::new("127.0.0.1:7000", vec!["127.0.0.1:9".into()], Arc::clone(&store));
        replication.force_leader();
        ChatServer::new("127.0.0.1:7000".into(), store, replication)
    }

    #[tokio::test]
    async fn failed_replication_rolls_back_the_message() {
        let server = isolated_leader();
        server.store.create_account("alice", "").unwrap();
        server.store.create_account("bob", "").unwrap();

        let reply = server
            .send_message(Request::new(envelope(
                "alice",
                "bob",
                Payload::SendMessage(pb::MessageText { text: "doomed".into() }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("replication failed"));

        // No partially-replicated message survives on the leader.
        assert_eq!(server.store.get_messages_between_users("alice", "bob", 0, 50).unwrap().total, 0);
        assert!(server.store.get_undelivered_messages("bob").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_replication_rolls_back_account_creation() {
        let server = isolated_leader();
        let reply = server
            .create_account(Request::new(envelope(
                "carol",
                SERVER_SENDER,
                Payload::CreateAccount(pb::Credentials {
                    username: "carol".into(),
                    password: "pw".into(),
                }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("replication failed"));
        assert!(!server.store.user_exists("carol").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_inputs_are_rejected() {
        let server = leader_server().await;
        let reply = server
            .create_account(Request::new(envelope(
                "",
                SERVER_SENDER,
                Payload::CreateAccount(pb::Credentials { username: String::new(), password: String::new() }),
            )))
            .await
            .unwrap()
            .into_inner();
        assert!(error_text(&reply).contains("must not be empty"));
    }
}
