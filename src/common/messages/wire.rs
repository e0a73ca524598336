//! Flat protobuf encoding of DHT messages.
//!
//! Every message variant shares one schema; which fields are meaningful
//! depends on `type` and `is_response`.

/// Wire form of a DHT message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,

    /// The key this message operates on: a node id for `FIND_NODE`,
    /// a namespaced key otherwise.
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,

    #[prost(message, optional, tag = "3")]
    pub record: Option<Record>,

    /// Peers closer to `key` than the responding node.
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<Peer>,

    /// Peers that announced they can provide `key`.
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<Peer>,

    /// Correlates a response with its request.
    #[prost(uint32, tag = "10")]
    pub transaction_id: u32,

    /// Node id of the message's sender.
    #[prost(bytes = "vec", tag = "11")]
    pub sender: Vec<u8>,

    #[prost(bool, tag = "12")]
    pub is_response: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,

    /// Unix timestamp in milliseconds set by the node storing the record.
    #[prost(uint64, tag = "5")]
    pub time_received: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,

    /// Compact `ip:port` addresses, 6 bytes each.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
}
