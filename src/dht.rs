//! Blocking client for a DHT node running on its own thread.

use std::collections::{HashSet, VecDeque};
use std::thread;

use flume::{Receiver, Sender, TryRecvError};

use crate::common::messages::RequestSpecific;
use crate::common::{Id, Node, Record};
use crate::rpc::config::Config;
use crate::rpc::{Info, QueryEvent, QueryOptions, ReprovideEvent, Rpc};

/// A handle to a DHT node running on a background thread.
///
/// Handles are cheap to clone; the node shuts down when every handle is
/// dropped (or on an explicit [shutdown](Dht::shutdown)).
#[derive(Debug, Clone)]
pub struct Dht(pub(crate) Sender<ActorMessage>);

/// The node's background thread is no longer running.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("DHT node was shutdown")]
pub struct DhtWasShutdown;

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    ToBootstrap(Sender<Vec<String>>),
    Get(Id, RequestSpecific, Sender<QueryEvent>, QueryOptions),
    Put(Record, Sender<QueryEvent>, QueryOptions),
    Provide(Vec<u8>, Sender<QueryEvent>, QueryOptions),
    StopProviding(Vec<u8>),
    SetReproviding(bool),
    ReprovideEvents(Sender<Receiver<ReprovideEvent>>),
    Shutdown(Sender<()>),
}

impl Dht {
    /// Spawn a node with default [Config].
    pub fn new() -> Result<Dht, std::io::Error> {
        Dht::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Dht, std::io::Error> {
        let (sender, receiver) = flume::unbounded();
        let (ready_sender, ready_receiver) = flume::bounded(1);

        thread::Builder::new()
            .name("DHT actor thread".into())
            .spawn(move || run(config, receiver, ready_sender))?;

        match ready_receiver.recv() {
            Ok(Ok(())) => Ok(Dht(sender)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "DHT actor thread died during startup",
            )),
        }
    }

    #[cfg(feature = "async")]
    pub fn as_async(&self) -> crate::async_dht::AsyncDht {
        crate::async_dht::AsyncDht(self.clone())
    }

    // === Getters ===

    /// A snapshot of the node's state.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);
        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;
        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// The routing table as `host:port` strings, usable as another node's
    /// bootstrap list.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);
        self.0
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;
        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shut the node down and wait for its thread to wind down.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded(1);
        if self.0.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }

    /// Block until the initial routing table population finished, then
    /// report whether any node was reached.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let info = self.info()?;
        let target = *info.id();

        let (sender, receiver) = flume::unbounded();
        self.0
            .send(ActorMessage::Get(
                target,
                RequestSpecific::FindNode { target },
                sender,
                QueryOptions::default(),
            ))
            .map_err(|_| DhtWasShutdown)?;

        for _event in receiver {}

        Ok(self.info()?.routing_table_size() > 0)
    }

    /// Look a peer up by its id.
    ///
    /// Returns the peer as soon as it responds itself; a peer that never
    /// responds but was reported by others is returned at the end.
    pub fn find_peer(&self, target: Id) -> Result<Option<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();
        self.0
            .send(ActorMessage::Get(
                target,
                RequestSpecific::FindNode { target },
                sender,
                QueryOptions::default(),
            ))
            .map_err(|_| DhtWasShutdown)?;

        let mut reported = None;

        for event in receiver {
            if let QueryEvent::PeerResponse {
                from, closer_peers, ..
            } = event
            {
                if from.id() == &target {
                    return Ok(Some(from));
                }
                if reported.is_none() {
                    reported = closer_peers
                        .iter()
                        .find(|node| node.id() == &target)
                        .cloned();
                }
            }
        }

        Ok(reported)
    }

    /// Iterate over the records peers hold for `key`, closest peers first.
    ///
    /// Records are validated before they are surfaced. Dropping the
    /// iterator cancels the query.
    pub fn get_record(&self, key: &[u8]) -> Result<Response, DhtWasShutdown> {
        self.get_record_with(key, QueryOptions::default())
    }

    pub fn get_record_with(
        &self,
        key: &[u8],
        options: QueryOptions,
    ) -> Result<Response, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();
        self.0
            .send(ActorMessage::Get(
                Id::hash(key),
                RequestSpecific::GetValue { key: key.into() },
                sender,
                options,
            ))
            .map_err(|_| DhtWasShutdown)?;

        Ok(Response { receiver })
    }

    /// Store a record on the closest nodes to its key.
    ///
    /// Returns how many nodes acknowledged the store; `0` when no node
    /// was reachable or the record failed validation.
    pub fn put_record(&self, record: Record) -> Result<usize, DhtWasShutdown> {
        self.put_record_with(record, QueryOptions::default())
    }

    pub fn put_record_with(
        &self,
        record: Record,
        options: QueryOptions,
    ) -> Result<usize, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();
        self.0
            .send(ActorMessage::Put(record, sender, options))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver
            .into_iter()
            .filter(|event| matches!(event, QueryEvent::Stored { .. }))
            .count())
    }

    /// Announce that this node can provide `key`.
    ///
    /// Returns how many nodes accepted the announcement. The local record
    /// is kept either way, and re-announced by the reprovider.
    pub fn provide(&self, key: &[u8]) -> Result<usize, DhtWasShutdown> {
        self.provide_with(key, QueryOptions::default())
    }

    pub fn provide_with(&self, key: &[u8], options: QueryOptions) -> Result<usize, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();
        self.0
            .send(ActorMessage::Provide(key.to_vec(), sender, options))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver
            .into_iter()
            .filter(|event| matches!(event, QueryEvent::Stored { .. }))
            .count())
    }

    /// Withdraw this node's own provider record for `key`.
    ///
    /// Remote nodes are not contacted; their copies simply expire.
    pub fn stop_providing(&self, key: &[u8]) -> Result<(), DhtWasShutdown> {
        self.0
            .send(ActorMessage::StopProviding(key.to_vec()))
            .map_err(|_| DhtWasShutdown)
    }

    /// Iterate over distinct providers of `key`, up to `limit`.
    ///
    /// Dropping the iterator cancels the query.
    pub fn find_providers(
        &self,
        key: &[u8],
        limit: Option<usize>,
    ) -> Result<Providers, DhtWasShutdown> {
        self.find_providers_with(key, limit, QueryOptions::default())
    }

    pub fn find_providers_with(
        &self,
        key: &[u8],
        limit: Option<usize>,
        options: QueryOptions,
    ) -> Result<Providers, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();
        self.0
            .send(ActorMessage::Get(
                Id::hash(key),
                RequestSpecific::GetProviders { key: key.into() },
                sender,
                options,
            ))
            .map_err(|_| DhtWasShutdown)?;

        Ok(Providers {
            receiver,
            limit: limit.unwrap_or(usize::MAX),
            yielded: 0,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
        })
    }

    /// Enable or disable the periodic reprovider. Enabled by default.
    pub fn set_reproviding(&self, enabled: bool) -> Result<(), DhtWasShutdown> {
        self.0
            .send(ActorMessage::SetReproviding(enabled))
            .map_err(|_| DhtWasShutdown)
    }

    /// Watch reprovide cycles progress.
    pub fn subscribe_reprovide(&self) -> Result<Receiver<ReprovideEvent>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);
        self.0
            .send(ActorMessage::ReprovideEvents(sender))
            .map_err(|_| DhtWasShutdown)?;
        receiver.recv().map_err(|_| DhtWasShutdown)
    }
}

fn run(config: Config, receiver: Receiver<ActorMessage>, ready: Sender<Result<(), std::io::Error>>) {
    let mut rpc = match Rpc::new(config) {
        Ok(rpc) => {
            let _ = ready.send(Ok(()));
            rpc
        }
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };

    loop {
        match receiver.try_recv() {
            Ok(message) => match message {
                ActorMessage::Info(sender) => {
                    let _ = sender.send(rpc.info());
                }
                ActorMessage::ToBootstrap(sender) => {
                    let _ = sender.send(rpc.to_bootstrap());
                }
                ActorMessage::Get(target, request, sender, options) => {
                    rpc.get(target, request, Some(sender), options);
                }
                ActorMessage::Put(record, sender, options) => {
                    rpc.put_value(record, Some(sender), options);
                }
                ActorMessage::Provide(key, sender, options) => {
                    rpc.provide(&key, Some(sender), options);
                }
                ActorMessage::StopProviding(key) => {
                    rpc.stop_providing(&key);
                }
                ActorMessage::SetReproviding(enabled) => {
                    rpc.set_reproviding(enabled);
                }
                ActorMessage::ReprovideEvents(sender) => {
                    let _ = sender.send(rpc.subscribe_reprovide());
                }
                ActorMessage::Shutdown(sender) => {
                    let _ = sender.send(());
                    break;
                }
            },
            // Every handle was dropped.
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        rpc.tick();
    }
}

/// Lazy stream of records found by a [get_record](Dht::get_record) query.
///
/// Dropping it cancels the underlying query.
#[derive(Debug)]
pub struct Response {
    receiver: Receiver<QueryEvent>,
}

impl Iterator for Response {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            match self.receiver.recv().ok()? {
                QueryEvent::PeerResponse {
                    record: Some(record),
                    ..
                } => return Some(record),
                _ => {}
            }
        }
    }
}

/// Lazy stream of distinct providers found by a
/// [find_providers](Dht::find_providers) query.
///
/// Dropping it cancels the underlying query.
#[derive(Debug)]
pub struct Providers {
    receiver: Receiver<QueryEvent>,
    limit: usize,
    yielded: usize,
    seen: HashSet<Id>,
    buffer: VecDeque<Node>,
}

impl Iterator for Providers {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        loop {
            if self.yielded >= self.limit {
                return None;
            }

            if let Some(node) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(node);
            }

            match self.receiver.recv().ok()? {
                QueryEvent::PeerResponse { providers, .. } => {
                    for node in providers {
                        if self.seen.insert(*node.id()) {
                            self.buffer.push_back(node);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// A local network of nodes over an in-memory [MemoryHub](crate::rpc::wire::MemoryHub),
/// for tests and examples.
pub struct Testnet {
    pub hub: crate::rpc::wire::MemoryHub,
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Spawn `count` nodes, all bootstrapping through the first one.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let hub = crate::rpc::wire::MemoryHub::new();

        let mut nodes = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for i in 0..count {
            let node = Dht::with_config(Config {
                bootstrap: bootstrap.clone(),
                wire: Some(Box::new(hub.bind())),
                ..Config::default()
            })?;

            if i == 0 {
                let info = node.info().expect("node was just spawned");
                bootstrap = vec![info.local_addr().to_string()];
            }

            nodes.push(node);
        }

        Ok(Testnet {
            hub,
            bootstrap,
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown() {
        let testnet = Testnet::new(1).expect("testnet spawns");
        let mut node = testnet.nodes[0].clone();

        node.shutdown();

        assert_eq!(node.info().map(|_| ()), Err(DhtWasShutdown));
    }

    #[test]
    fn dropping_every_handle_stops_the_node() {
        let testnet = Testnet::new(1).expect("testnet spawns");
        let node = testnet.nodes[0].clone();

        let events = node.subscribe_reprovide().expect("node is running");
        drop(testnet);
        drop(node);

        // The watcher disconnects once the actor thread winds down.
        assert_eq!(
            events.recv_timeout(std::time::Duration::from_secs(5)),
            Err(flume::RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn bootstrapping_fills_the_routing_table() {
        let testnet = Testnet::new(3).expect("testnet spawns");

        for node in &testnet.nodes[1..] {
            assert!(node.bootstrapped().expect("node is running"));
        }
    }
}
