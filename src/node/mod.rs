pub mod node_data;

use std::cmp;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::OverlayError;
use crate::key::Key;
use crate::node::node_data::{NodeData, NodeDataDistancePair};
use crate::protocol::{Message, Protocol, Request, RequestPayload, Response, ResponsePayload};
use crate::routing::RoutingTable;
use crate::{
    BUCKET_REFRESH_INTERVAL, CONCURRENCY_PARAM, KEY_LENGTH, REPLICATION_PARAM, REQUEST_TIMEOUT,
};

/// The number of times a busy port is retried while a previous node on it shuts down.
const BIND_ATTEMPTS: usize = 30;

/// The delay between attempts to bind a busy port.
const BIND_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Locks `mutex`, recovering the guard if another thread panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Binds `addr`. A fixed port that is still held by a node that just left is retried for a short
/// while.
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, OverlayError> {
    let mut attempts = 1;
    loop {
        match UdpSocket::bind(addr) {
            Ok(socket) => return Ok(socket),
            Err(ref err)
                if err.kind() == ErrorKind::AddrInUse
                    && addr.port() != 0
                    && attempts < BIND_ATTEMPTS =>
            {
                debug!("{} is still in use, retrying", addr);
                attempts += 1;
                thread::sleep(BIND_RETRY_DELAY);
            },
            Err(source) => return Err(OverlayError::Bind { addr, source }),
        }
    }
}

/// A node in the Kademlia DHT.
///
/// The key of a node is fixed for its lifetime. Taking a new key means calling `leave` and
/// starting a new `Node`.
#[derive(Clone)]
pub struct Node {
    node_data: Arc<NodeData>,
    routing_table: Arc<Mutex<RoutingTable>>,
    pending_requests: Arc<Mutex<HashMap<Key, Sender<Response>>>>,
    protocol: Arc<Protocol>,
    is_active: Arc<AtomicBool>,
    refresher_stop: Arc<Mutex<Option<Sender<()>>>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Node {
    /// Constructs a new `Node` with key `id` bound to `addr`. If `bootstrap` is not empty, the
    /// node pings those addresses and bootstraps its routing table through the ones that answer.
    pub fn new(addr: SocketAddr, id: Key, bootstrap: &[SocketAddr]) -> Result<Self, OverlayError> {
        let socket = bind_socket(addr)?;
        let node_data = Arc::new(NodeData::new(socket.local_addr()?, id));
        let routing_table = RoutingTable::new(Arc::clone(&node_data));
        let (message_tx, message_rx) = channel();
        let (protocol, receiver) = Protocol::new(socket, message_tx)?;
        let (stop_tx, stop_rx) = channel();

        let mut ret = Node {
            node_data,
            routing_table: Arc::new(Mutex::new(routing_table)),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            protocol: Arc::new(protocol),
            is_active: Arc::new(AtomicBool::new(true)),
            refresher_stop: Arc::new(Mutex::new(Some(stop_tx))),
            threads: Arc::new(Mutex::new(vec![receiver])),
        };

        ret.start_message_handler(message_rx);
        ret.start_bucket_refresher(stop_rx);
        info!("{} - Started node {}", ret.node_data.addr, ret.node_data.id);

        if !bootstrap.is_empty() {
            ret.bootstrap_routing_table(bootstrap);
        }
        Ok(ret)
    }

    /// Starts a thread that handles incoming messages until the receive loop stops.
    fn start_message_handler(&self, rx: Receiver<(Message, SocketAddr)>) {
        let mut node = self.clone();
        let handle = thread::spawn(move || {
            for (message, src) in rx.iter() {
                match message {
                    Message::Request(request) => node.handle_request(request, src),
                    Message::Response(response) => node.handle_response(response, src),
                }
            }
            info!("{} - Stopped message handler", node.node_data.addr);
        });
        lock(&self.threads).push(handle);
    }

    /// Starts a thread that refreshes stale routing buckets until the node leaves.
    fn start_bucket_refresher(&self, stop: Receiver<()>) {
        let mut node = self.clone();
        let handle = thread::spawn(move || {
            let interval = Duration::from_secs(BUCKET_REFRESH_INTERVAL);
            while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
                let stale_indexes = lock(&node.routing_table).get_stale_indexes();
                for index in stale_indexes {
                    let target_key = Key::rand_in_range(index);
                    if let Err(err) = node.lookup_nodes(&target_key, REPLICATION_PARAM) {
                        let addr = node.node_data.addr;
                        debug!("{} - Refresh of bucket {} failed: {}", addr, index, err);
                    }
                }
            }
            info!("{} - Stopped bucket refresher", node.node_data.addr);
        });
        lock(&self.threads).push(handle);
    }

    /// Bootstraps the routing table through `bootstrap`. Each address is pinged to learn its key.
    /// The node then looks up its own id to identify the closest nodes to it, and refreshes all
    /// routing buckets by looking up a random key in the buckets' range.
    fn bootstrap_routing_table(&mut self, bootstrap: &[SocketAddr]) {
        let own_addr = self.node_data.addr;
        for addr in bootstrap.iter().filter(|addr| **addr != own_addr) {
            // the key of a bootstrap node is learned from its reply
            if self.rpc_ping(&NodeData::new(*addr, Key::default())).is_none() {
                warn!("{} - Bootstrap node {} did not answer", self.node_data.addr, addr);
            }
        }

        let target_key = self.node_data.id;
        if let Err(err) = self.lookup_nodes(&target_key, REPLICATION_PARAM) {
            warn!("{} - Bootstrap lookup failed: {}", self.node_data.addr, err);
            return;
        }

        let bucket_size = lock(&self.routing_table).size();
        for i in 0..bucket_size {
            let _ = self.lookup_nodes(&Key::rand_in_range(i), REPLICATION_PARAM);
        }
        info!(
            "{} - Bootstrapped with {} known nodes",
            self.node_data.addr,
            self.known_node_count()
        );
    }

    /// Upserts the routing table. If the node cannot be inserted into the routing table, it
    /// removes and pings the least recently seen node. If the least recently seen node responds,
    /// it will be readded into the routing table, and the current node will be ignored.
    fn update_routing_table(&mut self, node_data: NodeData) {
        debug!("{} updating {}", self.node_data.addr, node_data.addr);
        let lrs_node_opt = {
            let mut routing_table = lock(&self.routing_table);
            if !routing_table.update_node(node_data.clone()) {
                routing_table.remove_lrs(&node_data.id)
            } else {
                None
            }
        };

        // Ping the lrs node off the message handler thread and keep it if it is still active
        if let Some(lrs_node) = lrs_node_opt {
            let mut node = self.clone();
            thread::spawn(move || {
                if node.rpc_ping(&lrs_node).is_none() {
                    lock(&node.routing_table).update_node(node_data);
                }
            });
        }
    }

    /// Handles a request RPC. The sender is recorded under the address the request came from.
    fn handle_request(&mut self, mut request: Request, src: SocketAddr) {
        debug!(
            "{} - Receiving request from {} {:?}",
            self.node_data.addr, src, request.payload,
        );
        request.sender.addr = src;
        self.update_routing_table(request.sender.clone());
        let receiver = (*self.node_data).clone();
        let payload = match request.payload {
            RequestPayload::Ping => ResponsePayload::Pong,
            RequestPayload::FindNode(key) => ResponsePayload::Nodes(
                lock(&self.routing_table).get_closest_nodes(&key, REPLICATION_PARAM),
            ),
        };

        let message = Message::Response(Response {
            request,
            receiver,
            payload,
        });
        if let Err(err) = self.protocol.send_message(&message, &src) {
            warn!("{} - Could not respond to {}: {}", self.node_data.addr, src, err);
        }
    }

    /// Handles a response RPC. If the id in the response does not match any outgoing request, then
    /// the response will be ignored.
    fn handle_response(&mut self, mut response: Response, src: SocketAddr) {
        response.receiver.addr = src;
        self.update_routing_table(response.receiver.clone());
        let pending_requests = lock(&self.pending_requests);
        if let Some(sender) = pending_requests.get(&response.request.id) {
            debug!(
                "{} - Receiving response from {} {:?}",
                self.node_data.addr, src, response.payload,
            );
            let _ = sender.send(response);
        } else {
            warn!(
                "{} - Original request not found; irrelevant response or expired request.",
                self.node_data.addr
            );
        }
    }

    /// Sends a request RPC and waits up to `REQUEST_TIMEOUT` milliseconds for the response. A
    /// destination that does not answer is dropped from the routing table.
    fn send_request(&mut self, dest: &NodeData, payload: RequestPayload) -> Option<Response> {
        if !self.is_active.load(Ordering::Acquire) {
            return None;
        }
        debug!(
            "{} - Sending request to {} {:?}",
            self.node_data.addr, dest.addr, payload
        );
        let (response_tx, response_rx) = channel();
        let mut pending_requests = lock(&self.pending_requests);
        let mut token = Key::rand();

        while pending_requests.contains_key(&token) {
            token = Key::rand();
        }
        pending_requests.insert(token, response_tx);
        drop(pending_requests);

        let message = Message::Request(Request {
            id: token,
            sender: (*self.node_data).clone(),
            payload,
        });
        if let Err(err) = self.protocol.send_message(&message, &dest.addr) {
            warn!("{} - Could not send to {}: {}", self.node_data.addr, dest.addr, err);
        }

        let response = response_rx.recv_timeout(Duration::from_millis(REQUEST_TIMEOUT));
        lock(&self.pending_requests).remove(&token);
        match response {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} - Request to {} timed out after waiting for {} milliseconds",
                    self.node_data.addr, dest.addr, REQUEST_TIMEOUT
                );
                lock(&self.routing_table).remove_node(dest);
                None
            },
            // the node left while the request was in flight
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Sends a `PING` RPC.
    fn rpc_ping(&mut self, dest: &NodeData) -> Option<Response> {
        self.send_request(dest, RequestPayload::Ping)
    }

    /// Sends a `FIND_NODE` RPC.
    fn rpc_find_node(&mut self, dest: &NodeData, key: &Key) -> Option<Response> {
        self.send_request(dest, RequestPayload::FindNode(*key))
    }

    /// Spawns a thread that sends a `FIND_NODE` RPC.
    fn spawn_find_rpc(mut self, dest: NodeData, key: Key, sender: Sender<Option<Response>>) {
        thread::spawn(move || {
            if sender.send(self.rpc_find_node(&dest, &key)).is_err() {
                warn!("Receiver closed channel before rpc returned.");
            }
        });
    }

    /// Iteratively looks up nodes to determine the closest nodes to `key`. The search begins by
    /// selecting `CONCURRENCY_PARAM` nodes in the routing table and adding it to a shortlist. It
    /// then sends out `FIND_NODE` RPCs to `CONCURRENCY_PARAM` nodes not yet queried in the
    /// shortlist. The node will continue to fill its shortlist until it did not find a closer node
    /// for a round of RPCs or if runs out of nodes to query. Finally, it will query the remaining
    /// nodes in its shortlist until there are no remaining nodes or if it has found `count` active
    /// nodes.
    ///
    /// Returns the closest `count` nodes that answered, excluding this node. Fails if there were
    /// nodes to query and none of them answered.
    fn lookup_nodes(&mut self, key: &Key, count: usize) -> Result<Vec<NodeData>, OverlayError> {
        let closest_nodes = lock(&self.routing_table).get_closest_nodes(key, CONCURRENCY_PARAM);
        if closest_nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut closest_distance = Key::new([255u8; KEY_LENGTH]);
        for node_data in &closest_nodes {
            closest_distance = cmp::min(closest_distance, key.xor(&node_data.id))
        }

        // initialize found nodes, queried nodes, and priority queue
        let mut found_nodes: HashSet<NodeData> = closest_nodes.iter().cloned().collect();
        found_nodes.insert((*self.node_data).clone());
        let mut queried_nodes = HashSet::new();
        let mut sent_count = 0;

        let mut queue: BinaryHeap<NodeDataDistancePair> = closest_nodes
            .into_iter()
            .map(|node_data| {
                let dist = node_data.id.xor(key);
                NodeDataDistancePair(node_data, dist)
            })
            .collect();

        let (tx, rx) = channel();

        let mut concurrent_thread_count = 0;

        // loop until we could not find a closer node for a round or if no threads are running
        loop {
            while concurrent_thread_count < CONCURRENCY_PARAM {
                match queue.pop() {
                    Some(NodeDataDistancePair(dest, _)) => {
                        self.clone().spawn_find_rpc(dest, *key, tx.clone());
                        concurrent_thread_count += 1;
                        sent_count += 1;
                    },
                    None => break,
                }
            }
            if concurrent_thread_count == 0 {
                break;
            }

            let mut is_terminated = true;
            let response_opt = match rx.recv() {
                Ok(response_opt) => response_opt,
                Err(_) => break,
            };
            concurrent_thread_count -= 1;

            match response_opt {
                Some(Response {
                    payload: ResponsePayload::Nodes(nodes),
                    receiver,
                    ..
                }) => {
                    queried_nodes.insert(receiver);
                    for node_data in nodes {
                        let curr_distance = node_data.id.xor(key);

                        if !found_nodes.contains(&node_data) {
                            if curr_distance < closest_distance {
                                closest_distance = curr_distance;
                                is_terminated = false;
                            }

                            found_nodes.insert(node_data.clone());
                            queue.push(NodeDataDistancePair(node_data, curr_distance));
                        }
                    }
                },
                _ => is_terminated = false,
            }

            if is_terminated {
                break;
            }
            debug!("CURRENT CLOSEST DISTANCE IS {:?}", closest_distance);
        }

        debug!(
            "{} TERMINATED LOOKUP BECAUSE NOT CLOSER OR NO THREADS WITH DISTANCE {:?}",
            self.node_data.addr, closest_distance,
        );

        // loop until no threads are running or if we found `count` active nodes
        while queried_nodes.len() < count {
            while concurrent_thread_count < CONCURRENCY_PARAM {
                match queue.pop() {
                    Some(NodeDataDistancePair(dest, _)) => {
                        self.clone().spawn_find_rpc(dest, *key, tx.clone());
                        concurrent_thread_count += 1;
                        sent_count += 1;
                    },
                    None => break,
                }
            }
            if concurrent_thread_count == 0 {
                break;
            }

            let response_opt = match rx.recv() {
                Ok(response_opt) => response_opt,
                Err(_) => break,
            };
            concurrent_thread_count -= 1;

            if let Some(Response {
                payload: ResponsePayload::Nodes(nodes),
                receiver,
                ..
            }) = response_opt
            {
                queried_nodes.insert(receiver);
                for node_data in nodes {
                    if !found_nodes.contains(&node_data) {
                        found_nodes.insert(node_data.clone());
                        let dist = node_data.id.xor(key);
                        queue.push(NodeDataDistancePair(node_data, dist));
                    }
                }
            }
        }

        if queried_nodes.is_empty() {
            return Err(OverlayError::Unreachable(sent_count));
        }

        let mut ret: Vec<NodeData> = queried_nodes
            .into_iter()
            .filter(|node_data| node_data.id != self.node_data.id)
            .collect();
        ret.sort_by_key(|node_data| node_data.id.xor(key));
        ret.truncate(count);
        debug!("{} -  CLOSEST NODES ARE {:#?}", self.node_data.addr, ret);
        Ok(ret)
    }

    /// Searches the network for the `count` nodes closest to `key`.
    pub fn lookup(&mut self, key: &Key, count: usize) -> Result<Vec<NodeData>, OverlayError> {
        self.lookup_nodes(key, count)
    }

    /// Returns the `count` nodes in the routing table closest to `key`, without any network
    /// traffic.
    pub fn closest_known_nodes(&self, key: &Key, count: usize) -> Vec<NodeData> {
        lock(&self.routing_table).get_closest_nodes(key, count)
    }

    /// Returns the number of nodes in the routing table.
    pub fn known_node_count(&self) -> usize {
        lock(&self.routing_table).node_count()
    }

    /// Adds `node_data` to the routing table and pings it in the background so that it learns
    /// about this node.
    pub fn add_node(&mut self, node_data: NodeData) {
        self.update_routing_table(node_data.clone());
        let mut node = self.clone();
        thread::spawn(move || {
            node.rpc_ping(&node_data);
        });
    }

    /// Returns the `NodeData` associated with the node.
    pub fn node_data(&self) -> NodeData {
        (*self.node_data).clone()
    }

    /// Stops the node. Returns once the socket is no longer read and the node's threads have
    /// exited. Requests still in flight are cancelled.
    pub fn leave(&self) {
        if !self.is_active.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("{} - Leaving the overlay", self.node_data.addr);
        self.protocol.shutdown();
        lock(&self.refresher_stop).take();
        lock(&self.pending_requests).clear();

        let threads: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("{} - A node thread panicked", self.node_data.addr);
            }
        }
    }
}
