use std::cmp::Ordering;
use std::net::SocketAddr;

use crate::key::Key;
use std::fmt::{Debug, Formatter, Result};

/// The address and key of a node in the overlay.
#[derive(PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub addr: SocketAddr,
    pub id: Key,
}

impl NodeData {
    pub fn new(addr: SocketAddr, id: Key) -> Self {
        NodeData { addr, id }
    }
}

impl Debug for NodeData {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} - {:?}", self.addr, self.id)
    }
}

/// A node paired with its distance to some key, ordered so that a `BinaryHeap` pops the closest
/// node first.
#[derive(Eq, Clone, Debug)]
pub struct NodeDataDistancePair(pub NodeData, pub Key);

impl PartialEq for NodeDataDistancePair {
    fn eq(&self, other: &NodeDataDistancePair) -> bool {
        self.0.eq(&other.0)
    }
}

impl PartialOrd for NodeDataDistancePair {
    fn partial_cmp(&self, other: &NodeDataDistancePair) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeDataDistancePair {
    fn cmp(&self, other: &NodeDataDistancePair) -> Ordering {
        other.1.cmp(&self.1)
    }
}
