//! Async view over a DHT node.

use flume::r#async::RecvStream;
use flume::Receiver;

use crate::common::messages::RequestSpecific;
use crate::common::{Id, Node, Record};
use crate::dht::{ActorMessage, Dht, DhtWasShutdown};
use crate::rpc::{Info, QueryEvent, QueryOptions, ReprovideEvent};

/// Async version of [Dht], driving the same node.
///
/// Runtime agnostic; queries stream their events as [QueryEvent]s.
#[derive(Debug, Clone)]
pub struct AsyncDht(pub(crate) Dht);

impl AsyncDht {
    // === Getters ===

    /// A snapshot of the node's state.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
             .0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// The routing table as `host:port` strings, usable as another node's
    /// bootstrap list.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
             .0
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shut the node down and wait for its thread to wind down.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded(1);

        if self.0 .0.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv_async().await;
        }
    }

    /// Wait until the initial routing table population finished, then
    /// report whether any node was reached.
    pub async fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let info = self.info().await?;
        let target = *info.id();

        let receiver = self.query(target, RequestSpecific::FindNode { target }, QueryOptions::default())?;
        while receiver.recv_async().await.is_ok() {}

        Ok(self.info().await?.routing_table_size() > 0)
    }

    /// Look a peer up by its id.
    pub async fn find_peer(&self, target: Id) -> Result<Option<Node>, DhtWasShutdown> {
        let receiver = self.query(target, RequestSpecific::FindNode { target }, QueryOptions::default())?;

        let mut reported = None;

        while let Ok(event) = receiver.recv_async().await {
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

    /// Stream the events of a lookup for records stored under `key`.
    ///
    /// Records surface as [PeerResponse](QueryEvent::PeerResponse) events,
    /// already validated. Dropping the stream cancels the query.
    pub fn get_record(
        &self,
        key: &[u8],
    ) -> Result<RecvStream<'static, QueryEvent>, DhtWasShutdown> {
        self.get_record_with(key, QueryOptions::default())
    }

    pub fn get_record_with(
        &self,
        key: &[u8],
        options: QueryOptions,
    ) -> Result<RecvStream<'static, QueryEvent>, DhtWasShutdown> {
        let receiver = self.query(
            Id::hash(key),
            RequestSpecific::GetValue { key: key.into() },
            options,
        )?;

        Ok(receiver.into_stream())
    }

    /// Store a record on the closest nodes to its key.
    ///
    /// Returns how many nodes acknowledged the store.
    pub async fn put_record(&self, record: Record) -> Result<usize, DhtWasShutdown> {
        self.put_record_with(record, QueryOptions::default()).await
    }

    pub async fn put_record_with(
        &self,
        record: Record,
        options: QueryOptions,
    ) -> Result<usize, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();

        self.0
             .0
            .send(ActorMessage::Put(record, sender, options))
            .map_err(|_| DhtWasShutdown)?;

        Ok(Self::count_stored(receiver).await)
    }

    /// Announce that this node can provide `key`.
    pub async fn provide(&self, key: &[u8]) -> Result<usize, DhtWasShutdown> {
        self.provide_with(key, QueryOptions::default()).await
    }

    pub async fn provide_with(
        &self,
        key: &[u8],
        options: QueryOptions,
    ) -> Result<usize, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();

        self.0
             .0
            .send(ActorMessage::Provide(key.to_vec(), sender, options))
            .map_err(|_| DhtWasShutdown)?;

        Ok(Self::count_stored(receiver).await)
    }

    /// Withdraw this node's own provider record for `key`.
    pub fn stop_providing(&self, key: &[u8]) -> Result<(), DhtWasShutdown> {
        self.0.stop_providing(key)
    }

    /// Stream the events of a lookup for providers of `key`.
    ///
    /// Providers surface as [PeerResponse](QueryEvent::PeerResponse)
    /// events; the same provider may appear in several of them. Dropping
    /// the stream cancels the query.
    pub fn find_providers(
        &self,
        key: &[u8],
    ) -> Result<RecvStream<'static, QueryEvent>, DhtWasShutdown> {
        self.find_providers_with(key, QueryOptions::default())
    }

    pub fn find_providers_with(
        &self,
        key: &[u8],
        options: QueryOptions,
    ) -> Result<RecvStream<'static, QueryEvent>, DhtWasShutdown> {
        let receiver = self.query(
            Id::hash(key),
            RequestSpecific::GetProviders { key: key.into() },
            options,
        )?;

        Ok(receiver.into_stream())
    }

    /// Enable or disable the periodic reprovider. Enabled by default.
    pub fn set_reproviding(&self, enabled: bool) -> Result<(), DhtWasShutdown> {
        self.0.set_reproviding(enabled)
    }

    /// Watch reprovide cycles progress.
    pub async fn subscribe_reprovide(&self) -> Result<Receiver<ReprovideEvent>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
             .0
            .send(ActorMessage::ReprovideEvents(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Private Methods ===

    fn query(
        &self,
        target: Id,
        request: RequestSpecific,
        options: QueryOptions,
    ) -> Result<Receiver<QueryEvent>, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();

        self.0
             .0
            .send(ActorMessage::Get(target, request, sender, options))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver)
    }

    async fn count_stored(receiver: Receiver<QueryEvent>) -> usize {
        let mut stored_at = 0;

        while let Ok(event) = receiver.recv_async().await {
            if matches!(event, QueryEvent::Stored { .. }) {
                stored_at += 1;
            }
        }

        stored_at
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::dht::Testnet;
    use crate::SignedRecord;
    use ed25519_dalek::SigningKey;

    #[test]
    fn async_put_and_get_a_record() {
        block_on(async {
            let testnet = Testnet::new(5).expect("testnet spawns");

            let client = testnet.nodes[1].as_async();
            let signer = SigningKey::from_bytes(&[42u8; 32]);
            let record = SignedRecord::sign(&signer, "async hello", 1);

            let stored_at = client
                .put_record(record.to_record())
                .await
                .expect("node is running");
            assert!(stored_at > 0);

            let reader = testnet.nodes[3].as_async();
            let mut stream = reader.get_record(&record.key()).expect("node is running");

            use futures::StreamExt;
            let mut found = None;
            while let Some(event) = stream.next().await {
                if let QueryEvent::PeerResponse {
                    record: Some(record),
                    ..
                } = event
                {
                    found = Some(record);
                    break;
                }
            }

            let found = found.expect("record was found");
            let signed = SignedRecord::from_record(&found).expect("record verifies");
            assert_eq!(signed.payload().as_ref(), b"async hello");
        });
    }
}
