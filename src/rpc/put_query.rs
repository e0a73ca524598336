//! Store or announce to the closest nodes found by an iterative query.

use std::net::SocketAddrV4;
use std::time::Duration;

use flume::Sender;
use tracing::debug;

use crate::common::messages::RequestSpecific;
use crate::common::{Id, Node, MAX_BUCKET_SIZE_K};

use super::response::{QueryError, QueryEvent};
use super::socket::RpcSocket;

/// The store phase following an iterative query: fan the `PUT_VALUE` or
/// `ADD_PROVIDER` request out to the closest responding nodes and count
/// the acknowledgments.
#[derive(Debug)]
pub(crate) struct PutQuery {
    target: Id,
    /// The original namespaced key being stored or announced.
    key: Box<[u8]>,
    request: RequestSpecific,
    inflight: Vec<(u16, Node)>,
    stored_at: usize,
    senders: Vec<Sender<QueryEvent>>,
    /// Started by the reprovider rather than a caller.
    reprovide: bool,
}

impl PutQuery {
    pub fn new(
        target: Id,
        key: Box<[u8]>,
        request: RequestSpecific,
        senders: Vec<Sender<QueryEvent>>,
        reprovide: bool,
    ) -> PutQuery {
        PutQuery {
            target,
            key,
            request,
            inflight: Vec::new(),
            stored_at: 0,
            senders,
            reprovide,
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn request(&self) -> &RequestSpecific {
        &self.request
    }

    /// How many nodes acknowledged storing so far.
    pub fn stored_at(&self) -> usize {
        self.stored_at
    }

    pub fn is_reprovide(&self) -> bool {
        self.reprovide
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight.iter().any(|(inflight, _)| *inflight == tid)
    }

    pub fn is_done(&self) -> bool {
        self.inflight.is_empty()
    }

    // === Public Methods ===

    /// Send the request to (at most K of) the given nodes.
    /// Returns `false` when there are no nodes to store at.
    pub fn start(
        &mut self,
        socket: &mut RpcSocket,
        nodes: &[Node],
        request_timeout: Option<Duration>,
    ) -> bool {
        if nodes.is_empty() {
            debug!(target = ?self.target, "No closest nodes to store at");
            return false;
        }

        for node in nodes.iter().take(MAX_BUCKET_SIZE_K) {
            let tid = socket.request(node.address(), self.request.clone(), request_timeout);
            self.inflight.push((tid, node.clone()));
        }

        true
    }

    pub fn handle_response(&mut self, tid: u16, sender_id: Id) {
        if self.take_inflight(tid).is_some() {
            self.stored_at += 1;
            self.emit(QueryEvent::Stored { peer: sender_id });
        }
    }

    /// Drop an inflight request that got a response of an unexpected type.
    pub fn dismiss(&mut self, tid: u16) {
        self.take_inflight(tid);
    }

    pub fn handle_timeout(&mut self, tid: u16, to: SocketAddrV4) {
        if let Some(node) = self.take_inflight(tid) {
            self.emit(QueryEvent::QueryError {
                address: to,
                peer: Some(*node.id()),
                error: QueryError::Timeout,
            });
        }
    }

    // === Private Methods ===

    fn take_inflight(&mut self, tid: u16) -> Option<Node> {
        self.inflight
            .iter()
            .position(|(inflight, _)| *inflight == tid)
            .map(|position| self.inflight.remove(position).1)
    }

    fn emit(&mut self, event: QueryEvent) {
        self.senders
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}
