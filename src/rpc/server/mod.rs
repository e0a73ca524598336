//! Handlers and stores for inbound DHT requests.

pub mod counters;
pub mod providers;
pub mod records;

pub use counters::{Counters, OpCount};
pub use providers::{ProviderRecord, ProviderStore};
pub use records::RecordStore;

pub(crate) use counters::Operation;

use std::net::SocketAddrV4;

use tracing::debug;

use crate::common::messages::{RequestSpecific, ResponseSpecific};
use crate::common::Id;

use super::Rpc;

/// Dispatch an inbound request to its handler.
///
/// A handler rejecting a message (invalid record, mismatched provider)
/// counts an error and sends no response; it never takes the node down.
pub(crate) fn handle_request(
    rpc: &mut Rpc,
    from: SocketAddrV4,
    transaction_id: u16,
    sender: Id,
    request: &RequestSpecific,
) {
    match request {
        RequestSpecific::Ping => {
            rpc.counters.success(Operation::Ping);
            rpc.socket.response(from, transaction_id, ResponseSpecific::Pong);
        }
        RequestSpecific::FindNode { target } => {
            rpc.counters.success(Operation::FindNode);
            rpc.socket.response(
                from,
                transaction_id,
                ResponseSpecific::FindNode {
                    closer_peers: rpc.routing_table.closest(target),
                },
            );
        }
        RequestSpecific::GetValue { key } => {
            let target = Id::hash(key);
            let record = rpc.records.get(&target).cloned();

            rpc.counters.success(Operation::GetValue);
            rpc.socket.response(
                from,
                transaction_id,
                ResponseSpecific::GetValue {
                    record,
                    closer_peers: rpc.routing_table.closest(&target),
                },
            );
        }
        RequestSpecific::PutValue { record } => match rpc.records.put(&rpc.validators, record.clone()) {
            Ok(_) => {
                rpc.counters.success(Operation::PutValue);
                rpc.socket
                    .response(from, transaction_id, ResponseSpecific::PutValue);
            }
            Err(error) => {
                debug!(?from, ?sender, ?error, "Rejected PUT_VALUE record");
                rpc.counters.error(Operation::PutValue);
            }
        },
        RequestSpecific::AddProvider { key, provider } => {
            if provider.id() != &sender {
                debug!(
                    ?from,
                    ?sender,
                    provider = ?provider.id(),
                    "Rejected ADD_PROVIDER announcing another peer"
                );
                rpc.counters.error(Operation::AddProvider);
                return;
            }

            rpc.providers.add_provider(Id::hash(key), provider.clone());

            rpc.counters.success(Operation::AddProvider);
            rpc.socket
                .response(from, transaction_id, ResponseSpecific::AddProvider);
        }
        RequestSpecific::GetProviders { key } => {
            let target = Id::hash(key);

            rpc.counters.success(Operation::GetProviders);

            let provider_peers = rpc.providers.get_providers(&target);
            rpc.socket.response(
                from,
                transaction_id,
                ResponseSpecific::GetProviders {
                    provider_peers,
                    closer_peers: rpc.routing_table.closest(&target),
                },
            );
        }
    }
}
