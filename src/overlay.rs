//! The seam between a rally session and the DHT it runs on.

use std::net::SocketAddr;

use crate::error::OverlayError;
use crate::key::Key;
use crate::node::node_data::NodeData;
use crate::node::Node;

/// Something that can put this process into a DHT under a chosen key.
///
/// A key is fixed for the lifetime of a join, so changing keys means leaving through the handle
/// and joining again.
pub trait Overlay: Send + 'static {
    type Handle: OverlayHandle;

    /// Joins the DHT as `id`, blocking until the membership is ready. With `bootstrap` unset the
    /// join skips initial peer discovery.
    fn join(&mut self, id: Key, bootstrap: bool) -> Result<Self::Handle, OverlayError>;
}

/// A live membership in the DHT.
pub trait OverlayHandle: Send + 'static {
    /// The key this membership was joined with.
    fn local_id(&self) -> Key;

    /// Snapshot of the known nodes closest to `target`, sorted by ascending distance.
    fn closest_known_nodes(&self, target: &Key, count: usize) -> Vec<NodeData>;

    /// Searches the network for the nodes closest to `target`.
    fn lookup_closest(&mut self, target: &Key, count: usize) -> Result<Vec<NodeData>, OverlayError>;

    /// Best-effort hint that `node` exists.
    fn add_known_node(&mut self, node: NodeData);

    /// Leaves the DHT. Returns once another join may reuse this membership's resources.
    fn leave(self);
}

/// Joins a UDP Kademlia network by starting a `Node` bound to `bind`.
#[derive(Clone, Debug)]
pub struct UdpOverlay {
    pub bind: SocketAddr,
    pub bootstrap: Vec<SocketAddr>,
}

impl UdpOverlay {
    pub fn new(bind: SocketAddr, bootstrap: Vec<SocketAddr>) -> Self {
        UdpOverlay { bind, bootstrap }
    }
}

impl Overlay for UdpOverlay {
    type Handle = Node;

    fn join(&mut self, id: Key, bootstrap: bool) -> Result<Node, OverlayError> {
        let seeds: &[SocketAddr] = if bootstrap { &self.bootstrap } else { &[] };
        Node::new(self.bind, id, seeds)
    }
}

impl OverlayHandle for Node {
    fn local_id(&self) -> Key {
        self.node_data().id
    }

    fn closest_known_nodes(&self, target: &Key, count: usize) -> Vec<NodeData> {
        Node::closest_known_nodes(self, target, count)
    }

    fn lookup_closest(
        &mut self,
        target: &Key,
        count: usize,
    ) -> Result<Vec<NodeData>, OverlayError> {
        self.lookup(target, count)
    }

    fn add_known_node(&mut self, node: NodeData) {
        self.add_node(node)
    }

    fn leave(self) {
        Node::leave(&self)
    }
}
