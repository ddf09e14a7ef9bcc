/// Generated wire types for the chat service and the replication envelope.
pub mod chat {
    tonic::include_proto!("chat");
}
