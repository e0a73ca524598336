//! Typed DHT messages and their conversion to the protobuf wire form.

pub mod wire;

use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddrV4};

use prost::Message as _;

use crate::common::{Id, Node, Record};

/// A DHT message with its wire metadata decoded and verified.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub transaction_id: u16,
    /// The id the sender claims; responders are added to the routing
    /// table under this id.
    pub sender: Id,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpecific {
    Ping,
    FindNode {
        target: Id,
    },
    GetValue {
        key: Box<[u8]>,
    },
    PutValue {
        record: Record,
    },
    AddProvider {
        key: Box<[u8]>,
        provider: Node,
    },
    GetProviders {
        key: Box<[u8]>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSpecific {
    Pong,
    FindNode {
        closer_peers: Vec<Node>,
    },
    GetValue {
        record: Option<Record>,
        closer_peers: Vec<Node>,
    },
    /// Acknowledges that a record was stored.
    PutValue,
    /// Acknowledges that a provider announcement was recorded.
    AddProvider,
    GetProviders {
        provider_peers: Vec<Node>,
        closer_peers: Vec<Node>,
    },
}

impl ResponseSpecific {
    pub fn closer_peers(&self) -> &[Node] {
        match self {
            ResponseSpecific::FindNode { closer_peers }
            | ResponseSpecific::GetValue { closer_peers, .. }
            | ResponseSpecific::GetProviders { closer_peers, .. } => closer_peers,
            _ => &[],
        }
    }

    pub fn provider_peers(&self) -> &[Node] {
        match self {
            ResponseSpecific::GetProviders { provider_peers, .. } => provider_peers,
            _ => &[],
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Protobuf(#[from] prost::DecodeError),

    #[error("unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("invalid sender id of {0} bytes")]
    InvalidSenderId(usize),

    #[error("invalid key of {0} bytes, expected a node id")]
    InvalidTarget(usize),

    #[error("message is missing a required record")]
    MissingRecord,

    #[error("message is missing a usable provider peer")]
    MissingProvider,
}

impl Message {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, DecodeError> {
        Message::from_wire(wire::Message::decode(bytes)?)
    }

    fn to_wire(&self) -> wire::Message {
        let mut message = wire::Message {
            transaction_id: self.transaction_id as u32,
            sender: self.sender.to_vec(),
            ..Default::default()
        };

        match &self.message_type {
            MessageType::Request(request) => match request {
                RequestSpecific::Ping => {
                    message.r#type = wire::MessageType::Ping as i32;
                }
                RequestSpecific::FindNode { target } => {
                    message.r#type = wire::MessageType::FindNode as i32;
                    message.key = target.to_vec();
                }
                RequestSpecific::GetValue { key } => {
                    message.r#type = wire::MessageType::GetValue as i32;
                    message.key = key.to_vec();
                }
                RequestSpecific::PutValue { record } => {
                    message.r#type = wire::MessageType::PutValue as i32;
                    message.key = record.key.to_vec();
                    message.record = Some(record.into());
                }
                RequestSpecific::AddProvider { key, provider } => {
                    message.r#type = wire::MessageType::AddProvider as i32;
                    message.key = key.to_vec();
                    message.provider_peers = vec![provider.into()];
                }
                RequestSpecific::GetProviders { key } => {
                    message.r#type = wire::MessageType::GetProviders as i32;
                    message.key = key.to_vec();
                }
            },
            MessageType::Response(response) => {
                message.is_response = true;

                match response {
                    ResponseSpecific::Pong => {
                        message.r#type = wire::MessageType::Ping as i32;
                    }
                    ResponseSpecific::FindNode { closer_peers } => {
                        message.r#type = wire::MessageType::FindNode as i32;
                        message.closer_peers = to_peers(closer_peers);
                    }
                    ResponseSpecific::GetValue {
                        record,
                        closer_peers,
                    } => {
                        message.r#type = wire::MessageType::GetValue as i32;
                        message.record = record.as_ref().map(|record| record.into());
                        message.closer_peers = to_peers(closer_peers);
                    }
                    ResponseSpecific::PutValue => {
                        message.r#type = wire::MessageType::PutValue as i32;
                    }
                    ResponseSpecific::AddProvider => {
                        message.r#type = wire::MessageType::AddProvider as i32;
                    }
                    ResponseSpecific::GetProviders {
                        provider_peers,
                        closer_peers,
                    } => {
                        message.r#type = wire::MessageType::GetProviders as i32;
                        message.provider_peers = to_peers(provider_peers);
                        message.closer_peers = to_peers(closer_peers);
                    }
                }
            }
        }

        message
    }

    fn from_wire(message: wire::Message) -> Result<Message, DecodeError> {
        let message_type = wire::MessageType::try_from(message.r#type)
            .map_err(|_| DecodeError::UnknownMessageType(message.r#type))?;

        let sender = Id::from_bytes(&message.sender)
            .map_err(|_| DecodeError::InvalidSenderId(message.sender.len()))?;

        let specific = if message.is_response {
            MessageType::Response(match message_type {
                wire::MessageType::Ping => ResponseSpecific::Pong,
                wire::MessageType::FindNode => ResponseSpecific::FindNode {
                    closer_peers: from_peers(&message.closer_peers),
                },
                wire::MessageType::GetValue => ResponseSpecific::GetValue {
                    record: message.record.map(Record::from),
                    closer_peers: from_peers(&message.closer_peers),
                },
                wire::MessageType::PutValue => ResponseSpecific::PutValue,
                wire::MessageType::AddProvider => ResponseSpecific::AddProvider,
                wire::MessageType::GetProviders => ResponseSpecific::GetProviders {
                    provider_peers: from_peers(&message.provider_peers),
                    closer_peers: from_peers(&message.closer_peers),
                },
            })
        } else {
            MessageType::Request(match message_type {
                wire::MessageType::Ping => RequestSpecific::Ping,
                wire::MessageType::FindNode => RequestSpecific::FindNode {
                    target: Id::from_bytes(&message.key)
                        .map_err(|_| DecodeError::InvalidTarget(message.key.len()))?,
                },
                wire::MessageType::GetValue => RequestSpecific::GetValue {
                    key: message.key.into(),
                },
                wire::MessageType::PutValue => RequestSpecific::PutValue {
                    record: message.record.map(Record::from).ok_or(DecodeError::MissingRecord)?,
                },
                wire::MessageType::AddProvider => RequestSpecific::AddProvider {
                    key: message.key.into(),
                    provider: message
                        .provider_peers
                        .iter()
                        .find_map(node_from_peer)
                        .ok_or(DecodeError::MissingProvider)?,
                },
                wire::MessageType::GetProviders => RequestSpecific::GetProviders {
                    key: message.key.into(),
                },
            })
        };

        Ok(Message {
            transaction_id: message.transaction_id as u16,
            sender,
            message_type: specific,
        })
    }
}

// === Peer and record conversions ===

impl From<&Node> for wire::Peer {
    fn from(node: &Node) -> wire::Peer {
        wire::Peer {
            id: node.id().to_vec(),
            addrs: vec![compact(node.address()).to_vec()],
        }
    }
}

impl From<&Record> for wire::Record {
    fn from(record: &Record) -> wire::Record {
        wire::Record {
            key: record.key.to_vec(),
            value: record.value.to_vec(),
            time_received: record.time_received,
        }
    }
}

impl From<wire::Record> for Record {
    fn from(record: wire::Record) -> Record {
        Record {
            key: record.key.into(),
            value: record.value.into(),
            time_received: record.time_received,
        }
    }
}

fn to_peers(nodes: &[Node]) -> Vec<wire::Peer> {
    nodes.iter().map(wire::Peer::from).collect()
}

/// Convert valid peers, dropping ones with a malformed id or no usable address.
fn from_peers(peers: &[wire::Peer]) -> Vec<Node> {
    peers.iter().filter_map(node_from_peer).collect()
}

fn node_from_peer(peer: &wire::Peer) -> Option<Node> {
    let id = Id::from_bytes(&peer.id).ok()?;
    let address = peer.addrs.iter().find_map(|bytes| decompact(bytes))?;

    Some(Node::new(id, address))
}

fn compact(address: SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0_u8; 6];
    bytes[..4].copy_from_slice(&address.ip().octets());
    bytes[4..].copy_from_slice(&address.port().to_be_bytes());
    bytes
}

fn decompact(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() != 6 {
        return None;
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn put_value_request_roundtrip() {
        let record = Record::new(b"/immutable/key", Bytes::from_static(b"value"));

        let message = Message {
            transaction_id: 258,
            sender: Id::random(),
            message_type: MessageType::Request(RequestSpecific::PutValue { record }),
        };

        let decoded = Message::from_bytes(&message.to_bytes()).expect("valid message");

        assert_eq!(decoded, message);
    }

    #[test]
    fn get_providers_response_roundtrip() {
        let message = Message {
            transaction_id: 9,
            sender: Id::random(),
            message_type: MessageType::Response(ResponseSpecific::GetProviders {
                provider_peers: vec![Node::unique(1)],
                closer_peers: vec![Node::unique(2), Node::unique(3)],
            }),
        };

        let decoded = Message::from_bytes(&message.to_bytes()).expect("valid message");

        assert_eq!(decoded, message);
    }

    #[test]
    fn add_provider_without_peer_is_rejected() {
        let message = wire::Message {
            r#type: wire::MessageType::AddProvider as i32,
            key: b"/immutable/key".to_vec(),
            sender: Id::random().to_vec(),
            ..Default::default()
        };

        assert!(matches!(
            Message::from_wire(message),
            Err(DecodeError::MissingProvider)
        ));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let message = wire::Message {
            r#type: 42,
            sender: Id::random().to_vec(),
            ..Default::default()
        };

        assert!(matches!(
            Message::from_wire(message),
            Err(DecodeError::UnknownMessageType(42))
        ));
    }

    #[test]
    fn malformed_closer_peers_are_dropped() {
        let message = wire::Message {
            r#type: wire::MessageType::FindNode as i32,
            sender: Id::random().to_vec(),
            is_response: true,
            closer_peers: vec![
                wire::Peer {
                    id: vec![1, 2, 3],
                    addrs: vec![vec![127, 0, 0, 1, 0, 80]],
                },
                wire::Peer::from(&Node::unique(1)),
            ],
            ..Default::default()
        };

        match Message::from_wire(message).expect("valid message").message_type {
            MessageType::Response(ResponseSpecific::FindNode { closer_peers }) => {
                assert_eq!(closer_peers, vec![Node::unique(1)]);
            }
            other => panic!("unexpected message type {:?}", other),
        }
    }
}
