use sha3::{Digest, Sha3_256};

use crate::key::Key;
use crate::{KEY_LENGTH, TAG_LENGTH};

/// The trailing bytes that mark a key as belonging to a rally.
pub type Tag = [u8; TAG_LENGTH];

/// Derives the rally point for `name`: the first `KEY_LENGTH` bytes of its SHA3-256 digest.
pub fn rally_point(name: &str) -> Key {
    let digest = Sha3_256::digest(name.as_bytes());
    let mut ret = [0; KEY_LENGTH];
    ret.copy_from_slice(&digest[..KEY_LENGTH]);
    Key(ret)
}

/// Returns the tag of `key`.
pub fn tag_of(key: &Key) -> Tag {
    key.tag()
}
