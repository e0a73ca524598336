//! Miscellaneous common structs used throughout the library.

mod cancel;
mod closest_nodes;
mod id;
pub mod messages;
mod node;
mod record;
mod routing_table;
mod validator;

pub use cancel::Cancellation;
pub use closest_nodes::ClosestNodes;
pub use id::{Id, InvalidIdSize, ID_SIZE, MAX_DISTANCE};
pub use node::Node;
pub use record::{Record, SignedRecord, SignedRecordError, SIGNED_NAMESPACE};
pub use routing_table::{RoutingTable, MAX_BUCKET_SIZE_K};
pub use validator::{
    immutable_key, ImmutableValidator, SignedRecordValidator, ValidationError, Validator,
    ValidatorRegistry, IMMUTABLE_NAMESPACE,
};
