//! Synthesis of a key that is just barely closer to a rally point than a competitor.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::MUTABLE_BITS;

/// Returns a key closer to `target` than `competitor` is, built by changing as few and as
/// low-order bits of `seed` as the search can manage.
///
/// The tag of the result is always the tag of `target`. Bits are pulled toward `target` from the
/// least significant mutable bit upwards. A bit that does not win on its own is put back unless it
/// is the current boundary bit, which stays claimed before the boundary moves one bit lower. The
/// search is greedy and does not guarantee a minimal change.
///
/// A seed that already beats `competitor` is returned with only its tag replaced. Sessions only
/// call this when their own key is farther from `target` than `competitor`.
///
/// Fails with `Error::Synthesis` when no such key exists, which happens only when `competitor` is
/// `target` itself.
pub fn twiddle_march(target: &Key, competitor: &Key, seed: &Key) -> Result<Key> {
    let to_beat = competitor.xor(target);
    let mut result = seed.with_tag(target.tag());
    if result.xor(target) < to_beat {
        return Ok(result);
    }

    for left in 0..MUTABLE_BITS {
        for right in (left..MUTABLE_BITS).rev() {
            let wanted = target.bit(right);
            if result.bit(right) == wanted {
                continue;
            }

            let candidate = result.with_bit(right, wanted);
            if candidate.xor(target) < to_beat {
                return Ok(candidate);
            }
            if right == left {
                result = candidate;
            }
        }
    }

    if result.xor(target) < to_beat {
        Ok(result)
    } else {
        Err(Error::Synthesis {
            competitor: *competitor,
        })
    }
}
