#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod dht;
pub mod rpc;

#[cfg(feature = "async")]
pub mod async_dht;

pub use crate::common::{
    immutable_key, Cancellation, ClosestNodes, Id, ImmutableValidator, InvalidIdSize, Node,
    Record, SignedRecord, SignedRecordError, SignedRecordValidator, ValidationError, Validator,
    ValidatorRegistry, ID_SIZE, IMMUTABLE_NAMESPACE, MAX_DISTANCE, SIGNED_NAMESPACE,
};
pub use crate::dht::{Dht, DhtWasShutdown, Providers, Response, Testnet};
pub use crate::rpc::{
    Counters, Info, QueryError, QueryEvent, QueryOptions, ReprovideEvent,
};

// Re-exports
pub use bytes::Bytes;
pub use ed25519_dalek::SigningKey;
