//! Kademlia node Id or a lookup target.

use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use sha1_smol::Sha1;

/// The size of node ids and lookup targets in bytes.
pub const ID_SIZE: usize = 20;
/// The maximum distance between two ids in the XOR keyspace.
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

/// Kademlia node Id or a lookup target in the 160 bit XOR keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub(crate) [u8; ID_SIZE]);

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        Id(rng.gen())
    }

    /// Map an arbitrary key into the keyspace with a one-way hash,
    /// spreading keys uniformly over the id space.
    pub fn hash(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Id(hasher.digest().bytes())
    }

    /// Create a new Id from some bytes. Returns [Err] if `bytes` is not of length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        let inner: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| InvalidIdSize(bytes.len()))?;

        Ok(Id(inner))
    }

    /// Returns the XOR result between this id and `other`.
    ///
    /// The result is itself an [Id] so distances can be compared
    /// through [Ord] as unsigned 160 bit magnitudes.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Simplified XOR distance between this Id and a target, used as
    /// a bucket index in the routing table.
    ///
    /// The distance is the number of trailing bits after the longest
    /// common prefix. Distance to self is 0, the furthest distance is 160.
    pub fn distance(&self, other: &Id) -> u8 {
        MAX_DISTANCE - self.xor(other).leading_zeros()
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn leading_zeros(&self) -> u8 {
        let mut zeros = 0_u8;

        for byte in self.0.iter() {
            zeros += byte.leading_zeros() as u8;

            if *byte != 0 {
                break;
            }
        }

        zeros
    }
}

/// Bytes were not of length [ID_SIZE].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected {ID_SIZE} bytes for an Id, got {0}")]
pub struct InvalidIdSize(pub usize);

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl FromStr for Id {
    type Err = InvalidIdSize;

    fn from_str(s: &str) -> Result<Id, InvalidIdSize> {
        // Byte-indexed slicing below would panic on multi byte characters.
        if !s.is_ascii() || s.len() % 2 != 0 {
            return Err(InvalidIdSize(s.len() / 2));
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| InvalidIdSize(0)))
            .collect::<Result<Vec<u8>, _>>()?;

        Id::from_bytes(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}
