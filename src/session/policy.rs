use crate::error::{Error, Result};
use crate::key::Key;
use crate::node::node_data::NodeData;

/// What a session should do after a search for its rally point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nobody known is closer to the rally point than we are.
    Hold,
    /// Another member of the rally already holds the rally point.
    Occupied,
    /// The rally point is not held by a member, so we should move closer than `competitor`.
    Relocate { competitor: Key },
}

/// Decides whether `local_id` should move given the nodes `closest` to `rally_point`, sorted by
/// ascending distance, and the rally members `peers` among them.
///
/// Fails with `Error::NoConnectivity` when `closest` is empty.
pub fn decide(
    rally_point: &Key,
    local_id: &Key,
    closest: &[NodeData],
    peers: &[NodeData],
) -> Result<Decision> {
    let best = match closest.first() {
        Some(best) => best,
        None => return Err(Error::NoConnectivity),
    };
    let my_dist = local_id.xor(rally_point);
    let best_dist = best.id.xor(rally_point);

    if my_dist <= best_dist {
        return Ok(Decision::Hold);
    }
    match peers.first() {
        Some(peer) if peer.id == best.id => Ok(Decision::Occupied),
        _ => Ok(Decision::Relocate { competitor: best.id }),
    }
}
