//! Transports carrying consensus events between node mailboxes.
//!
//! [`Transport::send`] and [`Transport::broadcast`] never block: an event is
//! either handed to the peer's mailbox or socket immediately, or the call
//! returns [`Error::Transport`].

use crate::error::{Error, Result};
use crate::event::ConsensusEvent;
use crate::node::NodeInput;
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default UDP port for Koord nodes
pub const DEFAULT_PORT: u16 = 9990;

/// Maximum datagram size (64KB is plenty for JSON)
const MAX_MSG_SIZE: usize = 65536;

/// Non-blocking event delivery
pub trait Transport: Send + Sync + 'static {
    /// Deliver an event to one node
    fn send(&self, to: &NodeId, event: &ConsensusEvent) -> Result<()>;

    /// Deliver an event to every other known node
    fn broadcast(&self, event: &ConsensusEvent) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, to: &NodeId, event: &ConsensusEvent) -> Result<()> {
        (**self).send(to, event)
    }

    fn broadcast(&self, event: &ConsensusEvent) -> Result<()> {
        (**self).broadcast(event)
    }
}

#[derive(Default)]
struct NetworkInner {
    mailboxes: HashMap<NodeId, mpsc::UnboundedSender<NodeInput>>,
    order: Vec<NodeId>,
    /// Directed links currently cut (from, to)
    blocked: HashSet<(NodeId, NodeId)>,
}

/// In-process network of node mailboxes with partition injection
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a node's mailbox
    pub fn attach(&self, node_id: impl Into<NodeId>, mailbox: mpsc::UnboundedSender<NodeInput>) {
        let node_id = node_id.into();
        let mut inner = self.inner.write();
        if !inner.mailboxes.contains_key(&node_id) {
            inner.order.push(node_id.clone());
        }
        inner.mailboxes.insert(node_id, mailbox);
    }

    pub fn detach(&self, node_id: &str) {
        let mut inner = self.inner.write();
        inner.mailboxes.remove(node_id);
        inner.order.retain(|id| id != node_id);
    }

    /// Attached nodes in attach order
    pub fn members(&self) -> Vec<NodeId> {
        self.inner.read().order.clone()
    }

    /// Transport endpoint sending as `node_id`
    pub fn endpoint(&self, node_id: impl Into<NodeId>) -> MemoryTransport {
        MemoryTransport {
            node_id: node_id.into(),
            network: self.clone(),
        }
    }

    /// Cut every link between the two groups (both directions)
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut inner = self.inner.write();
        for a in left {
            for b in right {
                inner.blocked.insert((a.clone(), b.clone()));
                inner.blocked.insert((b.clone(), a.clone()));
            }
        }
        debug!("Network: Partitioned {:?} from {:?}", left, right);
    }

    /// Cut a node off from everyone else
    pub fn isolate(&self, node_id: &str) {
        let others: Vec<NodeId> = self
            .members()
            .into_iter()
            .filter(|id| id != node_id)
            .collect();
        self.partition(&[node_id.to_string()], &others);
    }

    /// Restore every link
    pub fn heal(&self) {
        self.inner.write().blocked.clear();
        debug!("Network: Healed all partitions");
    }

    pub fn is_blocked(&self, from: &str, to: &str) -> bool {
        self.inner
            .read()
            .blocked
            .contains(&(from.to_string(), to.to_string()))
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, event: &ConsensusEvent) -> Result<()> {
        let inner = self.inner.read();
        if inner.blocked.contains(&(from.clone(), to.clone())) {
            // Partitioned links lose traffic silently
            debug!("Network: Dropped {} from {} to {}", event.event_type(), from, to);
            return Ok(());
        }
        let mailbox = inner
            .mailboxes
            .get(to)
            .ok_or_else(|| Error::Transport(format!("unknown node {}", to)))?;
        mailbox
            .send(NodeInput::Event(event.clone()))
            .map_err(|_| Error::Transport(format!("mailbox of {} closed", to)))
    }
}

/// One node's view of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: &NodeId, event: &ConsensusEvent) -> Result<()> {
        self.network.deliver(&self.node_id, to, event)
    }

    fn broadcast(&self, event: &ConsensusEvent) -> Result<()> {
        for peer in self.network.members() {
            if peer == self.node_id {
                continue;
            }
            if let Err(e) = self.network.deliver(&self.node_id, &peer, event) {
                warn!("Network: Failed to deliver to {}: {}", peer, e);
            }
        }
        Ok(())
    }
}

/// UDP transport: JSON datagrams to a static address book
pub struct UdpTransport {
    node_id: NodeId,
    socket: Arc<UdpSocket>,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl UdpTransport {
    /// Bind a socket on the given address
    pub async fn bind(node_id: impl Into<NodeId>, addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            node_id: node_id.into(),
            socket: Arc::new(socket),
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Get the local address this transport is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_peer(&self, node_id: impl Into<NodeId>, addr: SocketAddr) {
        self.peers.write().insert(node_id.into(), addr);
    }

    pub fn remove_peer(&self, node_id: &str) {
        self.peers.write().remove(node_id);
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start receiving datagrams into a node mailbox
    pub fn start_receive(&self, mailbox: mpsc::UnboundedSender<NodeInput>) -> JoinHandle<()> {
        let socket = self.socket.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MSG_SIZE];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => match ConsensusEvent::from_bytes(&buf[..len]) {
                        Ok(event) => {
                            debug!("Received {} from {}", event.event_type(), src);
                            if mailbox.send(NodeInput::Event(event)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse event from {}: {}", src, e);
                        }
                    },
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                    }
                }
            }
        })
    }

    fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.socket
            .try_send_to(bytes, addr)
            .map(|_| ())
            .map_err(|e| Error::Transport(format!("send to {} failed: {}", addr, e)))
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: &NodeId, event: &ConsensusEvent) -> Result<()> {
        let addr = self
            .peers
            .read()
            .get(to)
            .copied()
            .ok_or_else(|| Error::Transport(format!("no address for {}", to)))?;
        let bytes = event.to_bytes()?;
        debug!("Sending {} to {} ({})", event.event_type(), to, addr);
        self.send_to(addr, &bytes)
    }

    fn broadcast(&self, event: &ConsensusEvent) -> Result<()> {
        let bytes = event.to_bytes()?;
        let peers: Vec<(NodeId, SocketAddr)> = self
            .peers
            .read()
            .iter()
            .filter(|(id, _)| **id != self.node_id)
            .map(|(id, addr)| (id.clone(), *addr))
            .collect();

        for (id, addr) in peers {
            debug!("Broadcasting {} to {} ({})", event.event_type(), id, addr);
            if let Err(e) = self.send_to(addr, &bytes) {
                warn!("Failed to send to {}: {}", id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, VoteRequest};

    fn request(from: &str) -> ConsensusEvent {
        ConsensusEvent::new(
            from,
            1,
            EventKind::VoteRequest(VoteRequest {
                candidate_id: from.to_string(),
                last_log_index: 0,
                last_log_term: 0,
            }),
        )
    }

    fn expect_event(input: Option<NodeInput>) -> ConsensusEvent {
        match input {
            Some(NodeInput::Event(event)) => event,
            _ => panic!("expected an event"),
        }
    }

    #[test]
    fn test_memory_broadcast_skips_sender() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        network.attach("a", tx_a);
        network.attach("b", tx_b);

        network.endpoint("a").broadcast(&request("a")).unwrap();

        assert_eq!(expect_event(rx_b.try_recv().ok()).node_id, "a");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_partition_drops_and_heal_restores() {
        let network = MemoryNetwork::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        network.attach("a", tx_a);
        network.attach("b", tx_b);

        network.isolate("a");
        assert!(network.is_blocked("a", "b"));
        network.endpoint("a").send(&"b".to_string(), &request("a")).unwrap();
        assert!(rx_b.try_recv().is_err());

        network.heal();
        network.endpoint("a").send(&"b".to_string(), &request("a")).unwrap();
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_send_to_unknown_node_fails() {
        let network = MemoryNetwork::new();
        let err = network
            .endpoint("a")
            .send(&"ghost".to_string(), &request("a"))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = UdpTransport::bind("a", local).await.unwrap();
        let b = UdpTransport::bind("b", local).await.unwrap();
        a.add_peer("b", b.local_addr().unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _recv = b.start_receive(tx);

        a.send(&"b".to_string(), &request("a")).unwrap();
        let event = expect_event(rx.recv().await);
        assert_eq!(event.node_id, "a");
        assert_eq!(a.peer_ids(), vec!["b".to_string()]);
    }
}
