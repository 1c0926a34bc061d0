use bincode::Options;

use crate::key::{Key, NodeId};
use crate::node::contact::Contact;
use crate::MAX_MESSAGE_LENGTH;

/// The correlation id tying a response to its request.
pub type RequestId = NodeId;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Store(Key, Vec<u8>),
    FindNode(NodeId),
    FindValue(Key),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong,
    StoreOk,
    Nodes(Vec<Contact>),
    Value(Vec<u8>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// A datagram exchanged between nodes. Every message names its sender so the receiver can record
/// it in its routing table, and carries the id of the request it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: RequestId,
    pub sender: Contact,
    pub body: Body,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_LENGTH as u64)
}

impl Message {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        options().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Message> {
        options().deserialize(bytes)
    }
}
