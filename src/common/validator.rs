//! Pluggable per-namespace record validation and conflict resolution.

use std::collections::HashMap;
use std::fmt::Debug;

use crate::common::{Id, Record, SignedRecord, SignedRecordError, SIGNED_NAMESPACE};

/// Namespace of sha1 content addressed records, see [ImmutableValidator].
pub const IMMUTABLE_NAMESPACE: &str = "immutable";

/// Validates records in one key namespace and picks between conflicting ones.
pub trait Validator: Debug + Send {
    /// Reject malformed or unauthenticated records for keys in this namespace.
    fn validate(&self, key: &[u8], record: &Record) -> Result<(), ValidationError>;

    /// Pick the best record among candidates that already passed
    /// [validate](Validator::validate). Returns an index into `candidates`.
    fn select(&self, _key: &[u8], _candidates: &[Record]) -> usize {
        0
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The key does not start with a registered `/namespace/` prefix.
    #[error("key has no registered namespace")]
    UnknownNamespace,

    /// The record's own key does not match the key it is stored under.
    #[error("record key does not match the key it is stored under")]
    KeyMismatch,

    #[error("invalid record: {0}")]
    Invalid(&'static str),
}

/// Validators looked up by the `/namespace/` prefix of a record's key.
#[derive(Debug)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Box<dyn Validator>>,
}

impl ValidatorRegistry {
    /// A registry with no validators; every put will be rejected
    /// until namespaces are [registered](ValidatorRegistry::register).
    pub fn empty() -> ValidatorRegistry {
        ValidatorRegistry {
            validators: HashMap::new(),
        }
    }

    /// Register a validator for `/{namespace}/...` keys, replacing any
    /// previous validator for the same namespace.
    pub fn register(&mut self, namespace: &str, validator: Box<dyn Validator>) {
        self.validators.insert(namespace.to_string(), validator);
    }

    pub fn validate(&self, key: &[u8], record: &Record) -> Result<(), ValidationError> {
        if record.key.as_ref() != key {
            return Err(ValidationError::KeyMismatch);
        }

        self.lookup(key)?.validate(key, record)
    }

    /// Pick the best record among `candidates`. Out of range or missing
    /// selectors fall back to the first candidate.
    pub fn select(&self, key: &[u8], candidates: &[Record]) -> usize {
        self.lookup(key)
            .map(|validator| validator.select(key, candidates))
            .unwrap_or(0)
            .min(candidates.len().saturating_sub(1))
    }

    fn lookup(&self, key: &[u8]) -> Result<&dyn Validator, ValidationError> {
        let namespace = namespace(key).ok_or(ValidationError::UnknownNamespace)?;

        self.validators
            .get(namespace)
            .map(|validator| validator.as_ref())
            .ok_or(ValidationError::UnknownNamespace)
    }
}

impl Default for ValidatorRegistry {
    /// A registry with the built-in `/immutable/` and `/signed/` namespaces.
    fn default() -> Self {
        let mut registry = ValidatorRegistry::empty();

        registry.register(IMMUTABLE_NAMESPACE, Box::new(ImmutableValidator));
        registry.register(SIGNED_NAMESPACE, Box::new(SignedRecordValidator));

        registry
    }
}

/// The `namespace` in a `/namespace/rest` key.
fn namespace(key: &[u8]) -> Option<&str> {
    let rest = key.strip_prefix(b"/")?;
    let end = rest.iter().position(|byte| *byte == b'/')?;

    std::str::from_utf8(&rest[..end]).ok()
}

/// The `/immutable/` key a value is stored under: its sha1 hash.
pub fn immutable_key(value: &[u8]) -> Box<[u8]> {
    let mut key = format!("/{}/", IMMUTABLE_NAMESPACE).into_bytes();
    key.extend_from_slice(Id::hash(value).as_bytes());
    key.into()
}

/// Content addressed records: the key suffix must be the sha1 hash of the value.
#[derive(Debug)]
pub struct ImmutableValidator;

impl Validator for ImmutableValidator {
    fn validate(&self, key: &[u8], record: &Record) -> Result<(), ValidationError> {
        if key == immutable_key(&record.value).as_ref() {
            Ok(())
        } else {
            Err(ValidationError::Invalid(
                "key does not match the hash of the value",
            ))
        }
    }
}

/// Ed25519 signed records, see [SignedRecord]. Conflicts resolve to the
/// highest sequence number.
#[derive(Debug)]
pub struct SignedRecordValidator;

impl Validator for SignedRecordValidator {
    fn validate(&self, _key: &[u8], record: &Record) -> Result<(), ValidationError> {
        SignedRecord::from_record(record)
            .map(|_| ())
            .map_err(|error| match error {
                SignedRecordError::ValueTooShort => ValidationError::Invalid("value too short"),
                SignedRecordError::KeyMismatch => ValidationError::Invalid("key mismatch"),
                SignedRecordError::InvalidPublicKey => {
                    ValidationError::Invalid("invalid public key")
                }
                SignedRecordError::InvalidSignature => {
                    ValidationError::Invalid("invalid signature")
                }
            })
    }

    fn select(&self, _key: &[u8], candidates: &[Record]) -> usize {
        candidates
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                SignedRecord::from_record(record)
                    .ok()
                    .map(|signed| (index, signed.seq()))
            })
            .max_by_key(|(_, seq)| *seq)
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}
