use rand;
use std::fmt::{Debug, Display, Formatter, Result};

use crate::{KEY_LENGTH, TAG_LENGTH};

/// A 160-bit key that identifies nodes and rally points.
///
/// Keys compare as big-endian unsigned integers, so the XOR of two keys doubles as their distance
/// and `a.xor(&target) < b.xor(&target)` means `a` is closer to `target` than `b`.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Serialize, Deserialize, Default, Copy)]
pub struct Key(pub [u8; KEY_LENGTH]);

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter) -> Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Key {
    /// Constructs a new `Key` from a byte array.
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        Key(data)
    }

    /// Constructs a new, random `Key`.
    pub fn rand() -> Self {
        let mut ret = Key([0; KEY_LENGTH]);
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        ret
    }

    /// Constructs a new, random `Key` from `[2^(KEY_LENGTH - index - 1), 2^(KEY_LENGTH - index))`.
    pub(crate) fn rand_in_range(index: usize) -> Self {
        let mut ret = Key::rand();
        let bytes = index / 8;
        let bit = index % 8;
        for i in 0..bytes {
            ret.0[i] = 0;
        }
        ret.0[bytes] &= 0xFF >> (bit);
        ret.0[bytes] |= 1 << (8 - bit - 1);
        ret
    }

    /// Returns the XOR result between `self` and `key`, which is the distance between them.
    pub fn xor(&self, key: &Key) -> Key {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ key.0[i];
        }
        Key(ret)
    }

    /// Returns the number of leading zeros in `self`. This is used to calculate the distance
    /// between keys.
    pub(crate) fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize
            }
        }
        ret
    }

    /// Returns bit `index` of the key, where bit 0 is the most significant.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than `KEY_LENGTH * 8`.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of the key with bit `index` set to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than `KEY_LENGTH * 8`.
    pub fn with_bit(&self, index: usize, value: bool) -> Key {
        let mut ret = *self;
        let mask = 0x80 >> (index % 8);
        if value {
            ret.0[index / 8] |= mask;
        } else {
            ret.0[index / 8] &= !mask;
        }
        ret
    }

    /// Returns the trailing `TAG_LENGTH` bytes of the key.
    pub fn tag(&self) -> [u8; TAG_LENGTH] {
        let mut ret = [0; TAG_LENGTH];
        ret.copy_from_slice(&self.0[KEY_LENGTH - TAG_LENGTH..]);
        ret
    }

    /// Returns a copy of the key with its trailing `TAG_LENGTH` bytes replaced by `tag`.
    pub fn with_tag(&self, tag: [u8; TAG_LENGTH]) -> Key {
        let mut ret = *self;
        ret.0[KEY_LENGTH - TAG_LENGTH..].copy_from_slice(&tag);
        ret
    }
}
