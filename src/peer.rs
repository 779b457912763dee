use crate::key::Key;
use crate::node::node_data::NodeData;

/// Keeps the candidates that carry the tag of `rally_point` and are not `local_id`, in the
/// order given.
pub fn filter_valid(candidates: &[NodeData], rally_point: &Key, local_id: &Key) -> Vec<NodeData> {
    let tag = rally_point.tag();
    candidates
        .iter()
        .filter(|node_data| node_data.id.tag() == tag && node_data.id != *local_id)
        .cloned()
        .collect()
}
