//! K-RPC implementation: queries, inbound handlers, stores and maintenance.

pub mod config;
mod info;
mod iterative_query;
mod put_query;
mod reprovider;
mod response;
pub mod server;
mod socket;
pub mod wire;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, info};

use crate::common::messages::{MessageType, RequestSpecific};
use crate::common::{Cancellation, Id, Node, Record, RoutingTable, ValidatorRegistry};

use config::Config;
use iterative_query::IterativeQuery;
use put_query::PutQuery;
use reprovider::Reprovider;
use server::{Operation, ProviderStore, RecordStore};
use socket::RpcSocket;
use wire::UdpWire;

pub use info::Info;
pub use reprovider::{should_reprovide, ReprovideEvent};
pub use response::{QueryError, QueryEvent};
pub use server::{Counters, OpCount};
pub use socket::DEFAULT_REQUEST_TIMEOUT;

/// Re-populate the routing table when it empties, at most this often.
const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Ping quiet routing table nodes at most this often.
const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Options controlling a single query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Caller-driven cancellation; composes with the query's own signals.
    pub cancellation: Option<Cancellation>,
    /// Overall deadline for the query.
    pub timeout: Option<Duration>,
    /// Per-request timeout override.
    pub request_timeout: Option<Duration>,
}

/// A store or announce waiting for its lookup phase to finish.
#[derive(Debug)]
struct FollowUp {
    key: Box<[u8]>,
    request: RequestSpecific,
    reprovide: bool,
    request_timeout: Option<Duration>,
}

/// The heart of the DHT node. Always runs in a single thread that calls
/// [tick](Rpc::tick) in a loop; nothing here blocks for long.
#[derive(Debug)]
pub(crate) struct Rpc {
    id: Id,
    socket: RpcSocket,
    routing_table: RoutingTable,
    records: RecordStore,
    providers: ProviderStore,
    validators: ValidatorRegistry,
    counters: Counters,
    queries: HashMap<Id, IterativeQuery>,
    put_queries: HashMap<Id, PutQuery>,
    followups: HashMap<Id, FollowUp>,
    reprovider: Reprovider,
    bootstrap: Vec<String>,
    alpha: usize,
    disjoint_paths: usize,
    last_table_refresh: Option<Instant>,
    last_table_ping: Instant,
}

impl Rpc {
    pub fn new(mut config: Config) -> std::io::Result<Rpc> {
        let id = Id::random();

        let wire = match config.wire.take() {
            Some(wire) => wire,
            None => Box::new(UdpWire::bind(config.port)?),
        };

        let socket = RpcSocket::new(wire, id, config.request_timeout);

        info!(?id, address = ?socket.local_addr(), "DHT node listening");

        Ok(Rpc {
            id,
            socket,
            routing_table: RoutingTable::new(id),
            records: RecordStore::new(),
            providers: ProviderStore::new(id, config.provider_validity),
            validators: config.validators,
            counters: Counters::default(),
            queries: HashMap::new(),
            put_queries: HashMap::new(),
            followups: HashMap::new(),
            reprovider: Reprovider::new(config.reprovide_interval, config.reprovide_threshold),
            bootstrap: config.bootstrap,
            alpha: config.alpha,
            disjoint_paths: config.disjoint_paths,
            // Populate on the first tick.
            last_table_refresh: None,
            last_table_ping: Instant::now(),
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn info(&self) -> Info {
        Info {
            id: self.id,
            local_addr: self.socket.local_addr(),
            routing_table_size: self.routing_table.size(),
            provided_keys: self.providers.keys_count(),
            counters: self.counters.clone(),
        }
    }

    pub fn to_bootstrap(&self) -> Vec<String> {
        self.routing_table.to_bootstrap()
    }

    // === Public Methods ===

    /// Advance the node: expire requests, drive queries, run maintenance,
    /// and handle at most one inbound message.
    pub fn tick(&mut self) {
        // Surface request timeouts to their queries as error events.
        for expired in self.socket.expire() {
            if let Some(query) = self
                .queries
                .values_mut()
                .find(|query| query.inflight(expired.tid))
            {
                query.handle_timeout(expired.tid, expired.to);
                continue;
            }

            if let Some(put_query) = self
                .put_queries
                .values_mut()
                .find(|put_query| put_query.inflight(expired.tid))
            {
                put_query.handle_timeout(expired.tid, expired.to);
            }
        }

        let mut done_queries = Vec::new();
        for (target, query) in self.queries.iter_mut() {
            if query.tick(&mut self.socket) {
                done_queries.push(*target);
            }
        }
        for target in done_queries {
            self.finish_query(target);
        }

        let done_put_queries = self
            .put_queries
            .iter()
            .filter(|(_, put_query)| put_query.is_done())
            .map(|(target, _)| *target)
            .collect::<Vec<_>>();
        for target in done_put_queries {
            self.finish_put_query(target);
        }

        self.maintain_routing_table();
        self.tick_reprovider();

        if let Some((message, from)) = self.socket.recv_from(&mut self.counters) {
            // Every inbound message is evidence its sender is alive.
            self.routing_table.add(Node::new(message.sender, from));

            match &message.message_type {
                MessageType::Request(request) => server::handle_request(
                    self,
                    from,
                    message.transaction_id,
                    message.sender,
                    request,
                ),
                MessageType::Response(response) => {
                    self.handle_response(from, message.transaction_id, message.sender, response)
                }
            }
        }
    }

    /// Start (or join) an iterative query toward `target`.
    ///
    /// An already running query for the same target gains the new
    /// subscriber instead of starting over; the later caller's options
    /// do not apply in that case.
    pub fn get(
        &mut self,
        target: Id,
        request: RequestSpecific,
        sender: Option<Sender<QueryEvent>>,
        options: QueryOptions,
    ) {
        if let Some(query) = self.queries.get_mut(&target) {
            query.add_sender(sender);
            return;
        }

        let mut query = IterativeQuery::new(
            self.id,
            target,
            request,
            self.disjoint_paths,
            self.alpha,
            options,
        );
        query.add_sender(sender);

        let closest = self.routing_table.closest(&target);

        if closest.is_empty() {
            for bootstrap in self.bootstrap.clone() {
                if let Ok(addresses) = bootstrap.to_socket_addrs() {
                    for address in addresses {
                        if let SocketAddr::V4(address) = address {
                            query.visit_bootstrap(&mut self.socket, address);
                        }
                    }
                }
            }
        } else {
            query.seed(closest);
            query.start(&mut self.socket);
        }

        self.queries.insert(target, query);
    }

    pub fn find_node(&mut self, target: Id, sender: Option<Sender<QueryEvent>>, options: QueryOptions) {
        self.get(target, RequestSpecific::FindNode { target }, sender, options);
    }

    /// Store a record locally, then on the closest nodes to its key.
    ///
    /// Invalid records are logged and dropped; the caller's event stream
    /// ends without a single [Stored](QueryEvent::Stored) event.
    pub fn put_value(
        &mut self,
        record: Record,
        sender: Option<Sender<QueryEvent>>,
        options: QueryOptions,
    ) {
        if let Err(error) = self.records.put(&self.validators, record.clone()) {
            debug!(?error, "Rejected put of an invalid record");
            return;
        }

        let key = record.key.clone();
        let target = Id::hash(&key);

        if self
            .followups
            .insert(
                target,
                FollowUp {
                    key: key.clone(),
                    request: RequestSpecific::PutValue { record },
                    reprovide: false,
                    request_timeout: options.request_timeout,
                },
            )
            .is_some()
        {
            debug!(?target, "Replacing an already pending store for the same key");
        }

        self.get(
            target,
            RequestSpecific::GetValue { key },
            sender,
            options,
        );
    }

    /// Announce that this node provides `key`: store the record locally
    /// and announce it to the closest nodes to the key.
    pub fn provide(&mut self, key: &[u8], sender: Option<Sender<QueryEvent>>, options: QueryOptions) {
        let self_node = Node::new(self.id, self.socket.local_addr());
        self.providers.provide_local(key, self_node);

        self.announce(key, sender, options, false);
    }

    pub fn stop_providing(&mut self, key: &[u8]) {
        let local_id = self.id;
        self.providers.remove_provider(&Id::hash(key), &local_id);
    }

    pub fn set_reproviding(&mut self, enabled: bool) {
        if enabled {
            self.reprovider.start();
        } else {
            self.reprovider.stop();
        }
    }

    pub fn subscribe_reprovide(&mut self) -> flume::Receiver<ReprovideEvent> {
        self.reprovider.subscribe()
    }

    // === Private Methods ===

    /// Run the announce side of `provide`: a `GET_PROVIDERS` lookup
    /// followed by `ADD_PROVIDER` to the closest responders.
    fn announce(
        &mut self,
        key: &[u8],
        sender: Option<Sender<QueryEvent>>,
        options: QueryOptions,
        reprovide: bool,
    ) {
        let target = Id::hash(key);
        let self_node = Node::new(self.id, self.socket.local_addr());

        self.followups.insert(
            target,
            FollowUp {
                key: key.into(),
                request: RequestSpecific::AddProvider {
                    key: key.into(),
                    provider: self_node,
                },
                reprovide,
                request_timeout: options.request_timeout,
            },
        );

        self.get(
            target,
            RequestSpecific::GetProviders { key: key.into() },
            sender,
            options,
        );
    }

    /// A query exhausted its candidates or was cancelled: remove it, and
    /// start the store phase if one is waiting on it.
    fn finish_query(&mut self, target: Id) {
        let mut query = match self.queries.remove(&target) {
            Some(query) => query,
            None => return,
        };

        let followup = match self.followups.remove(&target) {
            Some(followup) => followup,
            None => return,
        };

        if query.was_cancelled() {
            if followup.reprovide {
                self.reprovider.announce_done(&target, false);
            }
            return;
        }

        let senders = query.take_senders();
        let mut put_query = PutQuery::new(
            target,
            followup.key,
            followup.request,
            senders,
            followup.reprovide,
        );

        if put_query.start(
            &mut self.socket,
            query.responders().nodes(),
            followup.request_timeout,
        ) {
            self.put_queries.insert(target, put_query);
        } else if followup.reprovide {
            self.reprovider.announce_done(&target, false);
        }
    }

    fn finish_put_query(&mut self, target: Id) {
        let put_query = match self.put_queries.remove(&target) {
            Some(put_query) => put_query,
            None => return,
        };

        let stored = put_query.stored_at() > 0;

        if !stored {
            debug!(target = ?put_query.target(), key = ?put_query.key(), "Stored at no nodes");
        }

        // A successful announcement refreshes our own record's expiry.
        if stored {
            if let RequestSpecific::AddProvider { .. } = put_query.request() {
                let self_node = Node::new(self.id, self.socket.local_addr());
                self.providers.add_provider(target, self_node);
            }
        }

        if put_query.is_reprovide() {
            self.reprovider.announce_done(&target, stored);
        }
    }

    fn handle_response(
        &mut self,
        from: SocketAddrV4,
        tid: u16,
        sender_id: Id,
        response: &crate::common::messages::ResponseSpecific,
    ) {
        use crate::common::messages::ResponseSpecific;

        if let Some(put_query) = self
            .put_queries
            .values_mut()
            .find(|put_query| put_query.inflight(tid))
        {
            match response {
                ResponseSpecific::PutValue | ResponseSpecific::AddProvider => {
                    put_query.handle_response(tid, sender_id)
                }
                _ => put_query.dismiss(tid),
            }
            return;
        }

        // Validate any record before it is surfaced to callers.
        let record = match response {
            ResponseSpecific::GetValue {
                record: Some(record),
                ..
            } => match self.validators.validate(&record.key, record) {
                Ok(()) => Some(record.clone()),
                Err(error) => {
                    debug!(?from, ?sender_id, ?error, "Dropping an invalid record from a response");
                    self.counters.error(Operation::GetValue);
                    None
                }
            },
            _ => None,
        };

        if let Some(query) = self
            .queries
            .values_mut()
            .find(|query| query.inflight(tid))
        {
            query.handle_response(tid, from, sender_id, response, record);
        }
    }

    fn maintain_routing_table(&mut self) {
        if self.routing_table.is_empty()
            && self
                .last_table_refresh
                .map_or(true, |last| last.elapsed() >= REFRESH_TABLE_INTERVAL)
        {
            self.last_table_refresh = Some(Instant::now());
            self.populate();
        }

        if self.last_table_ping.elapsed() >= PING_TABLE_INTERVAL {
            self.last_table_ping = Instant::now();

            for node in self.routing_table.nodes() {
                if node.is_stale() {
                    self.routing_table.remove(node.id());
                } else if node.should_ping() {
                    self.socket
                        .request(node.address(), RequestSpecific::Ping, None);
                }
            }
        }
    }

    /// Lookup our own id to discover nodes near us.
    fn populate(&mut self) {
        debug!(id = ?self.id, "Populating the routing table");
        let id = self.id;
        self.find_node(id, None, QueryOptions::default());
    }

    fn tick_reprovider(&mut self) {
        for (_, key_bytes) in self.reprovider.due(&self.providers) {
            debug!(key = ?Id::hash(&key_bytes), "Re-announcing a provider record");
            self.announce(&key_bytes, None, QueryOptions::default(), true);
        }
    }
}
