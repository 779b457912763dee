use bincode;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::OverlayError;
use crate::key::Key;
use crate::node::node_data::NodeData;
use crate::MESSAGE_LENGTH;

/// How long the receive loop blocks before checking whether it should stop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub id: Key,
    pub sender: NodeData,
    pub payload: RequestPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RequestPayload {
    Ping,
    FindNode(Key),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub request: Request,
    pub receiver: NodeData,
    pub payload: ResponsePayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ResponsePayload {
    Nodes(Vec<NodeData>),
    Pong,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// The UDP transport of a node. Incoming datagrams are decoded on a dedicated thread and forwarded
/// to the node's message handler, together with their source address, until `shutdown` is called.
#[derive(Clone)]
pub struct Protocol {
    socket: Arc<UdpSocket>,
    is_active: Arc<AtomicBool>,
}

impl Protocol {
    pub fn new(
        socket: UdpSocket,
        tx: Sender<(Message, SocketAddr)>,
    ) -> io::Result<(Protocol, JoinHandle<()>)> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let protocol = Protocol {
            socket: Arc::new(socket),
            is_active: Arc::new(AtomicBool::new(true)),
        };
        let ret = protocol.clone();
        let receiver = thread::spawn(move || {
            let mut buffer = [0u8; MESSAGE_LENGTH];
            while protocol.is_active.load(Ordering::Acquire) {
                let (len, src_addr) = match protocol.socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(ref err)
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                    {
                        continue
                    },
                    Err(err) => {
                        warn!("Protocol: Could not receive data: {}", err);
                        continue;
                    },
                };
                let message = match bincode::deserialize(&buffer[..len]) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("Protocol: Dropping malformed datagram from {}: {}", src_addr, err);
                        continue;
                    },
                };

                if tx.send((message, src_addr)).is_err() {
                    warn!("Protocol: Connection closed.");
                    break;
                }
            }
            debug!("Protocol: Receive loop stopped.");
        });
        Ok((ret, receiver))
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send_message(&self, message: &Message, dest: &SocketAddr) -> Result<(), OverlayError> {
        let buffer = bincode::serialize(&message)?;
        if buffer.len() > MESSAGE_LENGTH {
            return Err(OverlayError::Io(io::Error::new(
                ErrorKind::InvalidData,
                format!("message of {} bytes exceeds {}", buffer.len(), MESSAGE_LENGTH),
            )));
        }
        self.socket.send_to(&buffer, dest)?;
        Ok(())
    }

    /// Stops the receive loop. It exits within `POLL_INTERVAL`.
    pub fn shutdown(&self) {
        self.is_active.store(false, Ordering::Release);
    }
}
