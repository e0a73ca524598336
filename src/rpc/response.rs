//! Events produced by queries and consumed lazily by callers.

use std::net::SocketAddrV4;

use crate::common::{Id, Node, Record};

/// A single progress event from a running query.
///
/// Queries stream these lazily; the stream ends when the query exhausts
/// its candidates, or after a terminal [Cancelled](QueryEvent::Cancelled).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// A peer answered.
    PeerResponse {
        from: Node,
        /// Peers the responder believes are closer to the target.
        closer_peers: Vec<Node>,
        /// A (validated) record, for `get_value` queries.
        record: Option<Record>,
        /// Known providers of the target key, for `find_providers` queries.
        providers: Vec<Node>,
    },
    /// A peer failed; the query continues with other candidates.
    QueryError {
        address: SocketAddrV4,
        /// The peer's id, unless it was contacted as a bootstrap address.
        peer: Option<Id>,
        error: QueryError,
    },
    /// A peer acknowledged storing a record or a provider announcement.
    Stored { peer: Id },
    /// The query was cancelled before exhausting its candidates.
    Cancelled,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    /// The peer did not answer within the request timeout.
    #[error("request timed out")]
    Timeout,
}
