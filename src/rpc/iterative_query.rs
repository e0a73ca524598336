//! An iterative DHT lookup over several disjoint search paths.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::time::Instant;

use flume::Sender;
use tracing::{debug, trace};

use crate::common::messages::{RequestSpecific, ResponseSpecific};
use crate::common::{Cancellation, ClosestNodes, Id, Node, Record};

use super::response::{QueryError, QueryEvent};
use super::socket::RpcSocket;
use super::QueryOptions;

/// An iterative process of concurrently querying the closest known nodes
/// to a target, following ever closer nodes until no progress can be made.
///
/// The search runs over several disjoint paths. Each path keeps its own
/// candidate queue and its own alpha-bounded window of inflight requests,
/// but all paths share one visited set: a peer is checked against and
/// marked in that set in the same step it is contacted, so no peer is
/// ever queried twice, by any path.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    target: Id,
    local_id: Id,
    request: RequestSpecific,
    alpha: usize,
    paths: Vec<QueryPath>,
    visited: HashSet<Id>,
    /// Addresses contacted without a known id (bootstrap nodes) are
    /// tracked separately so they are not contacted again once their id
    /// is learned.
    visited_addresses: HashSet<SocketAddrV4>,
    responders: ClosestNodes,
    senders: Vec<Sender<QueryEvent>>,
    /// Whether any caller ever subscribed; queries with no subscribers
    /// (internal maintenance) run to completion, while queries whose
    /// every subscriber hung up are abandoned.
    subscribed: bool,
    cancellation: Cancellation,
    deadline: Option<Instant>,
    request_timeout: Option<std::time::Duration>,
    was_cancelled: bool,
    done: bool,
}

#[derive(Debug)]
struct QueryPath {
    candidates: ClosestNodes,
    /// Transaction ids awaiting a response, paired with the node they
    /// were sent to (`None` for bootstrap addresses).
    inflight: Vec<(u16, Option<Node>)>,
}

impl IterativeQuery {
    pub fn new(
        local_id: Id,
        target: Id,
        request: RequestSpecific,
        paths: usize,
        alpha: usize,
        options: QueryOptions,
    ) -> IterativeQuery {
        trace!(?target, ?request, paths, alpha, "New iterative query");

        IterativeQuery {
            target,
            local_id,
            request,
            alpha: alpha.max(1),
            paths: (0..paths.max(1))
                .map(|_| QueryPath {
                    candidates: ClosestNodes::new(target),
                    inflight: Vec::new(),
                })
                .collect(),
            visited: HashSet::new(),
            visited_addresses: HashSet::new(),
            responders: ClosestNodes::new(target),
            senders: Vec::new(),
            subscribed: false,
            cancellation: options
                .cancellation
                .map(|cancellation| cancellation.child())
                .unwrap_or_default(),
            deadline: options.timeout.map(|timeout| Instant::now() + timeout),
            request_timeout: options.request_timeout,
            was_cancelled: false,
            done: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    /// Nodes that responded during this query, closest to the target first.
    pub fn responders(&self) -> &ClosestNodes {
        &self.responders
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn was_cancelled(&self) -> bool {
        self.was_cancelled
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.paths
            .iter()
            .any(|path| path.inflight.iter().any(|(inflight, _)| *inflight == tid))
    }

    // === Public Methods ===

    pub fn add_sender(&mut self, sender: Option<Sender<QueryEvent>>) {
        if let Some(sender) = sender {
            self.senders.push(sender);
            self.subscribed = true;
        }
    }

    pub fn take_senders(&mut self) -> Vec<Sender<QueryEvent>> {
        std::mem::take(&mut self.senders)
    }

    /// Seed initial candidates, distributed round-robin across the
    /// disjoint paths.
    pub fn seed(&mut self, nodes: Vec<Node>) {
        let paths = self.paths.len();

        for (i, node) in nodes.into_iter().enumerate() {
            self.paths[i % paths].candidates.add(node);
        }
    }

    /// Contact an explicitly given address whose node id is not known yet,
    /// on the path with the least inflight requests.
    pub fn visit_bootstrap(&mut self, socket: &mut RpcSocket, address: SocketAddrV4) {
        if self.check_cancelled() || !self.visited_addresses.insert(address) {
            return;
        }

        let tid = socket.request(address, self.request.clone(), self.request_timeout);

        if let Some(path) = self.paths.iter_mut().min_by_key(|path| path.inflight.len()) {
            path.inflight.push((tid, None));
        }
    }

    /// Send the first round of requests. A query that is already
    /// cancelled sends nothing; the next [tick](IterativeQuery::tick)
    /// ends it.
    pub fn start(&mut self, socket: &mut RpcSocket) {
        if self.check_cancelled() {
            return;
        }

        self.visit_closest(socket);
    }

    /// Handle a response to one of this query's inflight requests.
    ///
    /// `record` is the response's record after validation; invalid records
    /// are stripped by the caller before reaching here.
    pub fn handle_response(
        &mut self,
        tid: u16,
        from: SocketAddrV4,
        sender_id: Id,
        response: &ResponseSpecific,
        record: Option<Record>,
    ) {
        let (path_index, reporter) = match self.take_inflight(tid) {
            Some(inflight) => inflight,
            None => return,
        };

        // How close the reporter itself is to the target; candidates are
        // only followed when they improve on this, which makes every hop
        // strictly converge and guarantees termination. Bootstrap nodes
        // have no known distance and all their candidates are accepted.
        let reporter_distance = reporter.map(|node| node.id().xor(&self.target));

        let responder = Node::new(sender_id, from);
        self.visited.insert(sender_id);
        self.responders.add(responder.clone());

        let closer_peers = response.closer_peers();

        for node in closer_peers {
            if node.id() == &self.local_id
                || self.visited.contains(node.id())
                || self.visited_addresses.contains(&node.address())
            {
                continue;
            }

            if let Some(reporter_distance) = &reporter_distance {
                if &node.id().xor(&self.target) >= reporter_distance {
                    continue;
                }
            }

            self.paths[path_index].candidates.add(node.clone());
        }

        self.emit(QueryEvent::PeerResponse {
            from: responder,
            closer_peers: closer_peers.to_vec(),
            record,
            providers: response.provider_peers().to_vec(),
        });
    }

    /// Handle an inflight request of this query timing out.
    pub fn handle_timeout(&mut self, tid: u16, to: SocketAddrV4) {
        if let Some((_, reporter)) = self.take_inflight(tid) {
            debug!(target = ?self.target, ?to, "Query peer timed out");

            self.emit(QueryEvent::QueryError {
                address: to,
                peer: reporter.map(|node| *node.id()),
                error: QueryError::Timeout,
            });
        }
    }

    /// Advance every path. Returns `true` once the query is finished,
    /// either by exhausting its candidates or by being cancelled.
    pub fn tick(&mut self, socket: &mut RpcSocket) -> bool {
        if self.done {
            return true;
        }

        if self.check_cancelled() {
            // Queued candidates are released right away; requests already
            // inflight are left to die by their own timeout.
            for path in self.paths.iter_mut() {
                path.inflight.clear();
            }

            debug!(target = ?self.target, "Query cancelled");
            self.emit(QueryEvent::Cancelled);

            self.was_cancelled = true;
            self.done = true;
            return true;
        }

        self.visit_closest(socket);

        if self.paths.iter().all(|path| path.inflight.is_empty()) {
            debug!(
                target = ?self.target,
                visited = self.visited.len(),
                responders = self.responders.len(),
                "Done query"
            );
            self.done = true;
        }

        self.done
    }

    // === Private Methods ===

    /// Keep each path's inflight window filled up to `alpha` with requests
    /// to its closest unvisited candidates. Candidates are checked against
    /// and marked in the shared visited set in the same step.
    fn visit_closest(&mut self, socket: &mut RpcSocket) {
        for path_index in 0..self.paths.len() {
            while self.paths[path_index].inflight.len() < self.alpha {
                let local_id = self.local_id;
                let visited = &self.visited;
                let visited_addresses = &self.visited_addresses;

                let next = self.paths[path_index]
                    .candidates
                    .nodes()
                    .iter()
                    .find(|node| {
                        node.id() != &local_id
                            && !visited.contains(node.id())
                            && !visited_addresses.contains(&node.address())
                    })
                    .cloned();

                let node = match next {
                    Some(node) => node,
                    None => break,
                };

                self.visited.insert(*node.id());
                self.visited_addresses.insert(node.address());

                let tid = socket.request(node.address(), self.request.clone(), self.request_timeout);
                self.paths[path_index].inflight.push((tid, Some(node)));
            }
        }
    }

    fn take_inflight(&mut self, tid: u16) -> Option<(usize, Option<Node>)> {
        for (path_index, path) in self.paths.iter_mut().enumerate() {
            if let Some(position) = path
                .inflight
                .iter()
                .position(|(inflight, _)| *inflight == tid)
            {
                let (_, node) = path.inflight.remove(position);
                return Some((path_index, node));
            }
        }

        None
    }

    fn check_cancelled(&self) -> bool {
        if self.cancellation.is_cancelled() {
            return true;
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }

        // Every subscriber hung up, nobody is waiting for the result.
        self.subscribed && self.senders.iter().all(|sender| sender.is_disconnected())
    }

    fn emit(&mut self, event: QueryEvent) {
        self.senders
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::{Message, MessageType};
    use crate::rpc::server::Counters;
    use crate::rpc::socket::DEFAULT_REQUEST_TIMEOUT;
    use crate::rpc::wire::{MemoryHub, MemoryWire, Wire};

    /// A scripted remote peer on the memory hub.
    struct FakePeer {
        node: Node,
        wire: MemoryWire,
    }

    impl FakePeer {
        fn new(hub: &MemoryHub, id: Id) -> FakePeer {
            let wire = hub.bind();
            FakePeer {
                node: Node::new(id, wire.local_addr()),
                wire,
            }
        }

        /// Drain the requests this peer received so far.
        fn requests(&mut self) -> Vec<Message> {
            let mut requests = Vec::new();
            while let Some((frame, _)) = self.wire.poll_frame() {
                requests.push(Message::from_bytes(&frame).expect("decodable request"));
            }
            requests
        }

        /// Answer every pending request with the given closer peers.
        /// Returns how many requests were answered.
        fn respond_with_closer(&mut self, to: SocketAddrV4, closer_peers: Vec<Node>) -> usize {
            let requests = self.requests();
            let count = requests.len();

            for request in requests {
                let response = Message {
                    transaction_id: request.transaction_id,
                    sender: *self.node.id(),
                    message_type: MessageType::Response(ResponseSpecific::FindNode {
                        closer_peers: closer_peers.clone(),
                    }),
                };
                self.wire
                    .send_frame(to, &response.to_bytes())
                    .expect("send works");
            }

            count
        }
    }

    fn id_with_first_byte(byte: u8) -> Id {
        let mut bytes = [0_u8; 20];
        bytes[0] = byte;
        Id::from(bytes)
    }

    const LOCAL_ID_BYTE: u8 = 0xee;

    fn socket(hub: &MemoryHub) -> RpcSocket {
        RpcSocket::new(
            Box::new(hub.bind()),
            id_with_first_byte(LOCAL_ID_BYTE),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    fn query(target: Id, paths: usize, alpha: usize) -> IterativeQuery {
        IterativeQuery::new(
            id_with_first_byte(LOCAL_ID_BYTE),
            target,
            RequestSpecific::FindNode { target },
            paths,
            alpha,
            QueryOptions::default(),
        )
    }

    /// Deliver all pending inbound messages to the query.
    fn pump(socket: &mut RpcSocket, query: &mut IterativeQuery) {
        let mut counters = Counters::default();

        while let Some((message, from)) = socket.recv_from(&mut counters) {
            if let MessageType::Response(response) = &message.message_type {
                query.handle_response(message.transaction_id, from, message.sender, response, None);
            }
        }
    }

    #[test]
    fn two_hop_lookup_terminates() {
        let hub = MemoryHub::new();
        let target = Id::from([0_u8; 20]);

        let mut socket = socket(&hub);
        let mut query = query(target, 1, 1);

        let mut further = FakePeer::new(&hub, id_with_first_byte(10));
        let mut closer = FakePeer::new(&hub, id_with_first_byte(5));

        query.seed(vec![further.node.clone()]);

        assert!(!query.tick(&mut socket));
        assert_eq!(
            further.respond_with_closer(socket.local_addr(), vec![closer.node.clone()]),
            1
        );
        pump(&mut socket, &mut query);

        assert!(!query.tick(&mut socket));
        // The closer peer reports the further one back; it is not followed,
        // both because it was already visited and because it is further away.
        assert_eq!(
            closer.respond_with_closer(socket.local_addr(), vec![further.node.clone()]),
            1
        );
        pump(&mut socket, &mut query);

        assert!(query.tick(&mut socket));
        assert!(further.requests().is_empty());
        assert!(closer.requests().is_empty());
    }

    #[test]
    fn no_peer_is_queried_twice_across_paths() {
        let hub = MemoryHub::new();
        let target = Id::from([0_u8; 20]);

        let mut socket = socket(&hub);
        let mut query = query(target, 3, 2);

        let mut seeds = (0..3_u8)
            .map(|i| FakePeer::new(&hub, id_with_first_byte(0x40 + i)))
            .collect::<Vec<_>>();
        let mut shared = FakePeer::new(&hub, id_with_first_byte(1));

        query.seed(seeds.iter().map(|peer| peer.node.clone()).collect());
        assert!(!query.tick(&mut socket));

        // Every seed reports the same closer peer, on different paths.
        for seed in seeds.iter_mut() {
            assert_eq!(
                seed.respond_with_closer(socket.local_addr(), vec![shared.node.clone()]),
                1
            );
        }
        pump(&mut socket, &mut query);
        query.tick(&mut socket);

        // The shared peer is contacted exactly once.
        assert_eq!(shared.respond_with_closer(socket.local_addr(), vec![]), 1);
        pump(&mut socket, &mut query);

        assert!(query.tick(&mut socket));
    }

    #[test]
    fn farther_candidates_are_not_followed() {
        let hub = MemoryHub::new();
        let target = Id::from([0_u8; 20]);

        let mut socket = socket(&hub);
        let mut query = query(target, 1, 2);

        let mut reporter = FakePeer::new(&hub, id_with_first_byte(8));
        let mut closer = FakePeer::new(&hub, id_with_first_byte(4));
        let mut farther = FakePeer::new(&hub, id_with_first_byte(16));

        query.seed(vec![reporter.node.clone()]);
        assert!(!query.tick(&mut socket));

        reporter.respond_with_closer(
            socket.local_addr(),
            vec![closer.node.clone(), farther.node.clone()],
        );
        pump(&mut socket, &mut query);
        query.tick(&mut socket);

        assert_eq!(closer.requests().len(), 1);
        assert!(farther.requests().is_empty());
    }

    #[test]
    fn cancellation_is_prompt_and_terminal() {
        let hub = MemoryHub::new();
        let target = Id::random();

        let mut socket = socket(&hub);

        let cancellation = Cancellation::new();
        let mut query = IterativeQuery::new(
            id_with_first_byte(LOCAL_ID_BYTE),
            target,
            RequestSpecific::FindNode { target },
            2,
            2,
            QueryOptions {
                cancellation: Some(cancellation.clone()),
                ..QueryOptions::default()
            },
        );

        let (sender, receiver) = flume::unbounded();
        query.add_sender(Some(sender));

        let mut peer = FakePeer::new(&hub, id_with_first_byte(1));
        query.seed(vec![peer.node.clone()]);

        cancellation.cancel();

        // Cancelled before the first tick: no request goes out at all.
        assert!(query.tick(&mut socket));
        assert!(query.was_cancelled());
        assert!(peer.requests().is_empty());

        assert_eq!(receiver.try_recv(), Ok(QueryEvent::Cancelled));
    }

    #[test]
    fn a_query_cancelled_before_start_sends_nothing() {
        let hub = MemoryHub::new();
        let target = Id::random();

        let mut socket = socket(&hub);

        let cancellation = Cancellation::new();
        let mut query = IterativeQuery::new(
            id_with_first_byte(LOCAL_ID_BYTE),
            target,
            RequestSpecific::FindNode { target },
            1,
            2,
            QueryOptions {
                cancellation: Some(cancellation.clone()),
                ..QueryOptions::default()
            },
        );

        let mut peer = FakePeer::new(&hub, id_with_first_byte(1));
        query.seed(vec![peer.node.clone()]);

        cancellation.cancel();

        query.start(&mut socket);
        query.visit_bootstrap(&mut socket, peer.node.address());
        assert!(peer.requests().is_empty());

        assert!(query.tick(&mut socket));
        assert!(query.was_cancelled());
    }

    #[test]
    fn abandoned_when_every_receiver_hangs_up() {
        let hub = MemoryHub::new();
        let target = Id::random();

        let mut socket = socket(&hub);
        let mut query = query(target, 1, 1);

        let (sender, receiver) = flume::unbounded::<QueryEvent>();
        query.add_sender(Some(sender));

        query.seed(vec![FakePeer::new(&hub, id_with_first_byte(1)).node.clone()]);

        drop(receiver);

        assert!(query.tick(&mut socket));
        assert!(query.was_cancelled());
    }

    #[test]
    fn timeout_surfaces_as_query_error() {
        let hub = MemoryHub::new();
        let target = Id::random();

        let mut socket = socket(&hub);
        let mut query = query(target, 1, 1);

        let (sender, receiver) = flume::unbounded();
        query.add_sender(Some(sender));

        let peer = FakePeer::new(&hub, id_with_first_byte(1));
        query.seed(vec![peer.node.clone()]);
        assert!(!query.tick(&mut socket));

        // Simulate the socket expiring the request.
        let tid = 0;
        assert!(query.inflight(tid));
        query.handle_timeout(tid, peer.node.address());

        assert_eq!(
            receiver.try_recv(),
            Ok(QueryEvent::QueryError {
                address: peer.node.address(),
                peer: Some(*peer.node.id()),
                error: QueryError::Timeout,
            })
        );

        assert!(query.tick(&mut socket));
        assert!(!query.was_cancelled());
    }
}
