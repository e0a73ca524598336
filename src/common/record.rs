//! Records stored in and retrieved from the DHT.

use std::convert::TryInto;
use std::time::SystemTime;

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Namespace of ed25519 signed records, see [SignedRecord].
pub const SIGNED_NAMESPACE: &str = "signed";

const SEQ_SIZE: usize = 8;
const SIGNATURE_SIZE: usize = 64;
const PUBLIC_KEY_SIZE: usize = 32;

/// A record stored at a namespaced key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The namespaced key this record is stored under, e.g. `/signed/<public key>`.
    pub key: Box<[u8]>,
    pub value: Bytes,
    /// Unix timestamp in milliseconds set by the node that stored the record.
    pub time_received: u64,
}

impl Record {
    pub fn new(key: &[u8], value: Bytes) -> Record {
        Record {
            key: key.into(),
            value,
            time_received: unix_millis_now(),
        }
    }
}

pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// An ed25519 signed record in the `/signed/` namespace.
///
/// The key is derived from the signer's public key, and among conflicting
/// records for the same key the highest sequence number wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRecord {
    public_key: [u8; PUBLIC_KEY_SIZE],
    seq: u64,
    signature: [u8; SIGNATURE_SIZE],
    payload: Bytes,
}

impl SignedRecord {
    /// Sign a payload with a new sequence number.
    pub fn sign(signer: &SigningKey, payload: impl Into<Bytes>, seq: u64) -> SignedRecord {
        let payload = payload.into();
        let signature = signer.sign(&signable(seq, &payload)).to_bytes();

        SignedRecord {
            public_key: signer.verifying_key().to_bytes(),
            seq,
            signature,
            payload,
        }
    }

    /// Parse and verify a [Record] from the `/signed/` namespace.
    pub fn from_record(record: &Record) -> Result<SignedRecord, SignedRecordError> {
        let value = &record.value;

        if value.len() < SEQ_SIZE + SIGNATURE_SIZE {
            return Err(SignedRecordError::ValueTooShort);
        }

        let seq = u64::from_be_bytes(
            value[..SEQ_SIZE]
                .try_into()
                .map_err(|_| SignedRecordError::ValueTooShort)?,
        );
        let signature: [u8; SIGNATURE_SIZE] = value[SEQ_SIZE..SEQ_SIZE + SIGNATURE_SIZE]
            .try_into()
            .map_err(|_| SignedRecordError::ValueTooShort)?;
        let payload = value.slice(SEQ_SIZE + SIGNATURE_SIZE..);

        let public_key: [u8; PUBLIC_KEY_SIZE] = record
            .key
            .strip_prefix(signed_key_prefix().as_slice())
            .ok_or(SignedRecordError::KeyMismatch)?
            .try_into()
            .map_err(|_| SignedRecordError::KeyMismatch)?;

        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|_| SignedRecordError::InvalidPublicKey)?;

        verifying_key
            .verify(&signable(seq, &payload), &Signature::from_bytes(&signature))
            .map_err(|_| SignedRecordError::InvalidSignature)?;

        Ok(SignedRecord {
            public_key,
            seq,
            signature,
            payload,
        })
    }

    /// The namespaced key this record lives under: `/signed/<public key bytes>`.
    pub fn key(&self) -> Box<[u8]> {
        let mut key = signed_key_prefix();
        key.extend_from_slice(&self.public_key);
        key.into()
    }

    /// Encode as a storable [Record].
    pub fn to_record(&self) -> Record {
        let mut value = Vec::with_capacity(SEQ_SIZE + SIGNATURE_SIZE + self.payload.len());
        value.extend_from_slice(&self.seq.to_be_bytes());
        value.extend_from_slice(&self.signature);
        value.extend_from_slice(&self.payload);

        Record::new(&self.key(), value.into())
    }

    // === Getters ===

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public_key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

fn signed_key_prefix() -> Vec<u8> {
    format!("/{}/", SIGNED_NAMESPACE).into_bytes()
}

/// Domain separation for signatures, so they can not be reused by
/// other protocols signing with the same key.
fn signable(seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut signable = format!("dht-signed-record:{}:", seq).into_bytes();
    signable.extend_from_slice(payload);
    signable
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedRecordError {
    #[error("value too short to contain a sequence number and signature")]
    ValueTooShort,

    #[error("record key does not contain this record's public key")]
    KeyMismatch,

    #[error("invalid ed25519 public key")]
    InvalidPublicKey,

    #[error("invalid ed25519 signature")]
    InvalidSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&[42_u8; 32])
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signed = SignedRecord::sign(&signer(), &b"hello world"[..], 3);
        let record = signed.to_record();

        let parsed = SignedRecord::from_record(&record).expect("valid record");

        assert_eq!(parsed, signed);
        assert_eq!(parsed.seq(), 3);
        assert_eq!(parsed.payload().as_ref(), b"hello world");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signed = SignedRecord::sign(&signer(), &b"hello world"[..], 3);
        let mut record = signed.to_record();

        let mut value = record.value.to_vec();
        let last = value.len() - 1;
        value[last] ^= 1;
        record.value = value.into();

        assert_eq!(
            SignedRecord::from_record(&record),
            Err(SignedRecordError::InvalidSignature)
        );
    }

    #[test]
    fn key_from_another_signer_is_rejected() {
        let signed = SignedRecord::sign(&signer(), &b"hello world"[..], 3);
        let mut record = signed.to_record();

        record.key = SignedRecord::sign(&SigningKey::from_bytes(&[7_u8; 32]), &b""[..], 1).key();

        assert_eq!(
            SignedRecord::from_record(&record),
            Err(SignedRecordError::InvalidSignature)
        );
    }

    #[test]
    fn truncated_value_is_rejected() {
        let record = Record::new(&SignedRecord::sign(&signer(), &b""[..], 1).key(), vec![0_u8; 10].into());

        assert_eq!(
            SignedRecord::from_record(&record),
            Err(SignedRecordError::ValueTooShort)
        );
    }
}
