use sha3::{Digest, Sha3_256};
use std::fmt::{Debug, Display, Formatter, Result};

use crate::KEY_LENGTH;

/// An identifier that represents nodes and data.
///
/// Identifiers are 160 bits wide. They are never verified: any node may claim any id.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Serialize, Deserialize, Default, Copy)]
pub struct NodeId(pub [u8; KEY_LENGTH]);

/// The key of a stored record. Keys share the identifier space with nodes.
pub type Key = NodeId;

/// The XOR distance between two identifiers, ordered as a big-endian unsigned integer.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Default, Copy)]
pub struct Distance(pub [u8; KEY_LENGTH]);

fn write_hex(f: &mut Formatter, bytes: &[u8]) -> Result {
    for byte in bytes {
        write!(f, "{:02X}", byte)?;
    }
    Ok(())
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write_hex(f, &self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write_hex(f, &self.0[..4])
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write_hex(f, &self.0)
    }
}

impl NodeId {
    /// Constructs a new `NodeId` from a byte array.
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        NodeId(data)
    }

    /// Constructs a `NodeId` from the SHA-3 digest of `data`.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(&digest[..KEY_LENGTH]);
        NodeId(ret)
    }

    /// Constructs a new, random `NodeId` by hashing random material.
    pub fn random() -> Self {
        let material: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
        NodeId::hash(&material)
    }

    /// Constructs a new, uniformly random `NodeId` from `[2^(BITS - index - 1), 2^(BITS - index))`.
    pub(crate) fn rand_in_range(index: usize) -> Self {
        let mut ret = NodeId([0; KEY_LENGTH]);
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        let bytes = index / 8;
        let bit = index % 8;
        for i in 0..bytes {
            ret.0[i] = 0;
        }
        ret.0[bytes] &= 0xFF >> bit;
        ret.0[bytes] |= 1 << (8 - bit - 1);
        ret
    }

    /// Returns a random id that shares exactly `index` leading bits with `self`.
    pub(crate) fn rand_in_bucket(&self, index: usize) -> Self {
        let offset = NodeId::rand_in_range(index);
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ offset.0[i];
        }
        NodeId(ret)
    }

    /// Returns a copy of `self` with every bit past the first `bits` cleared.
    pub fn masked(&self, bits: usize) -> Self {
        let mut ret = self.0;
        for (i, byte) in ret.iter_mut().enumerate() {
            let start = i * 8;
            if start >= bits {
                *byte = 0;
            } else if bits - start < 8 {
                *byte &= 0xFF << (8 - (bits - start));
            }
        }
        NodeId(ret)
    }

    /// Returns the XOR distance between `self` and `other`.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(ret)
    }

    /// Returns the index of the bucket that `other` falls into relative to `self`: the position of
    /// the most significant differing bit, where 0 is the most significant bit of the id.
    ///
    /// Returns `None` if `other == self`.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let zeros = self.distance(other).leading_zeros();
        if zeros == KEY_LENGTH * 8 {
            None
        } else {
            Some(zeros)
        }
    }
}

impl Distance {
    /// Returns the number of leading zeros in `self`, i.e. the length of the shared prefix of the
    /// two ids it was computed from.
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }

    /// Returns `true` if the distance is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}
