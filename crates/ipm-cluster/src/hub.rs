use crate::dialer::Hosts;
use crate::error::{ClusterError, Result};
use crate::message::Message;
use crate::sync::{Outbound, SyncProtocol};
use ipm_core::Error;
use ipm_metrics::Metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the hub's event queue
pub const EVENT_QUEUE: usize = 256;

/// Capacity of each peer's outbound queue
pub const PEER_QUEUE: usize = 64;

/// A joined connection as seen by the hub
#[derive(Debug)]
pub struct PeerLink {
    pub uuid: String,
    pub addr: String,
    pub priority: u32,
    /// distinguishes a reconnect from the connection it replaced
    pub conn_id: u64,
    /// configured host this node dialed, `None` for inbound connections
    pub dialed: Option<String>,
    pub sender: mpsc::Sender<Message>,
}

enum Event {
    Join {
        link: PeerLink,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        uuid: String,
        conn_id: u64,
    },
    Message {
        from: String,
        message: Message,
    },
    Send {
        message: Message,
        target: Option<String>,
    },
    Contains {
        uuid: String,
        reply: oneshot::Sender<bool>,
    },
    Admits {
        uuid: String,
        outbound: bool,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<HubStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub uuid: String,
    pub addr: String,
    pub priority: u32,
    pub dialed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    pub uuid: String,
    pub priority: u32,
    pub active: bool,
    pub peers: Vec<PeerStatus>,
}

/// Membership and message routing for the cluster.
///
/// Runs as a single task; every join, leave and inbound message is
/// processed in arrival order, so membership needs no locking.
pub struct Hub {
    uuid: String,
    priority: u32,
    active: bool,
    clients: HashMap<String, PeerLink>,
    hosts: Hosts,
    protocol: SyncProtocol,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(
        uuid: &str,
        priority: u32,
        hosts: Hosts,
        protocol: SyncProtocol,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            uuid: uuid.to_string(),
            priority,
            active: true,
            clients: HashMap::new(),
            hosts,
            protocol,
            metrics,
        }
    }

    /// Start the hub loop; it stops once every handle is dropped
    pub fn spawn(self) -> HubHandle {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let handle = HubHandle {
            tx,
            uuid: Arc::from(self.uuid.as_str()),
            priority: self.priority,
            hosts: self.hosts.clone(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Join { link, reply } => {
                    let _ = reply.send(self.join(link));
                }
                Event::Leave { uuid, conn_id } => self.leave(&uuid, conn_id),
                Event::Message { from, message } => {
                    self.metrics.record_message(message.kind.as_str());
                    for out in self.protocol.handle(&from, message).await {
                        self.send(out);
                    }
                }
                Event::Send { message, target } => self.send(Outbound { message, target }),
                Event::Contains { uuid, reply } => {
                    let _ = reply.send(self.clients.contains_key(&uuid));
                }
                Event::Admits {
                    uuid,
                    outbound,
                    reply,
                } => {
                    let _ = reply.send(self.admits(&uuid, outbound));
                }
                Event::Status { reply } => {
                    let _ = reply.send(self.status());
                }
            }
        }
        debug!("Hub stopped");
    }

    /// Whether a new connection from `uuid` may join; `outbound` when this
    /// node opened it.
    ///
    /// When two nodes dial each other at once, both ends keep the connection
    /// opened by the node with the lower uuid and refuse the other one.
    fn admits(&self, uuid: &str, outbound: bool) -> bool {
        if uuid == self.uuid {
            return false;
        }
        let Some(existing) = self.clients.get(uuid) else {
            return true;
        };
        let opener = |outbound: bool| if outbound { self.uuid.as_str() } else { uuid };
        let (new, old) = (opener(outbound), opener(existing.dialed.is_some()));
        new < old
    }

    fn join(&mut self, link: PeerLink) -> Result<()> {
        if !self.admits(&link.uuid, link.dialed.is_some()) {
            return Err(Error::conflict(format!("peer {} is already connected", link.uuid)).into());
        }

        if let Some(host) = &link.dialed {
            self.hosts.set_connected(host, true);
        }
        // the replaced link is dropped on insert, which closes its queue
        if let Some(old) = self.clients.get(&link.uuid) {
            info!(
                "Replacing connection to peer {} (conn {} -> {})",
                link.uuid, old.conn_id, link.conn_id
            );
            if let Some(host) = &old.dialed {
                self.hosts.set_connected(host, false);
            }
        } else {
            info!(
                "Peer joined: addr={} uuid={} priority={}",
                link.addr, link.uuid, link.priority
            );
        }
        Self::enqueue(&link, self.protocol.registry_list());
        self.clients.insert(link.uuid.clone(), link);
        self.metrics.set_peers(self.clients.len());
        self.check_priority();
        Ok(())
    }

    fn leave(&mut self, uuid: &str, conn_id: u64) {
        // a rejected duplicate must not remove the connection it collided with
        if self.clients.get(uuid).is_none_or(|c| c.conn_id != conn_id) {
            return;
        }
        let Some(link) = self.clients.remove(uuid) else {
            return;
        };

        if let Some(host) = &link.dialed {
            self.hosts.set_connected(host, false);
        }
        self.metrics.set_peers(self.clients.len());
        self.check_priority();
        info!(
            "Peer left: addr={} uuid={} priority={}",
            link.addr, link.uuid, link.priority
        );
        // dropping the link closes its queue and ends the writer
    }

    /// Active unless some peer has a strictly higher priority
    fn check_priority(&mut self) {
        let active = !self.clients.values().any(|c| c.priority > self.priority);
        if active != self.active {
            if active {
                info!("Node is now active (priority {})", self.priority);
            } else {
                info!("Node is now backup (priority {})", self.priority);
            }
            self.active = active;
        }
    }

    fn send(&self, out: Outbound) {
        match out.target {
            Some(uuid) => match self.clients.get(&uuid) {
                Some(link) => Self::enqueue(link, out.message),
                None => warn!("Dropping message for unknown peer {}", uuid),
            },
            None => {
                for link in self.clients.values() {
                    Self::enqueue(link, out.message.clone());
                }
            }
        }
    }

    fn enqueue(link: &PeerLink, message: Message) {
        if let Err(e) = link.sender.try_send(message) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "connection closed",
            };
            warn!("Dropping message for peer {}: {}", link.uuid, reason);
        }
    }

    fn status(&self) -> HubStatus {
        let mut peers: Vec<PeerStatus> = self
            .clients
            .values()
            .map(|c| PeerStatus {
                uuid: c.uuid.clone(),
                addr: c.addr.clone(),
                priority: c.priority,
                dialed: c.dialed.is_some(),
            })
            .collect();
        peers.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        HubStatus {
            uuid: self.uuid.clone(),
            priority: self.priority,
            active: self.active,
            peers,
        }
    }
}

/// Cloneable front door to a running [`Hub`]
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Event>,
    uuid: Arc<str>,
    priority: u32,
    hosts: Hosts,
}

impl HubHandle {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn hosts(&self) -> &Hosts {
        &self.hosts
    }

    async fn post(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| ClusterError::HubClosed)
    }

    /// Register a connection; `Conflict` when the uuid is ours or the
    /// existing connection to that peer is kept
    pub async fn join(&self, link: PeerLink) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Join { link, reply }).await?;
        rx.await.map_err(|_| ClusterError::HubClosed)?
    }

    pub async fn leave(&self, uuid: &str, conn_id: u64) -> Result<()> {
        self.post(Event::Leave {
            uuid: uuid.to_string(),
            conn_id,
        })
        .await
    }

    /// Hand an inbound message to the sync protocol
    pub async fn dispatch(&self, from: &str, message: Message) -> Result<()> {
        self.post(Event::Message {
            from: from.to_string(),
            message,
        })
        .await
    }

    pub async fn send_or_broadcast(&self, message: Message, target: Option<String>) -> Result<()> {
        self.post(Event::Send { message, target }).await
    }

    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.send_or_broadcast(message, None).await
    }

    pub async fn contains(&self, uuid: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Contains {
            uuid: uuid.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClusterError::HubClosed)
    }

    /// Whether an inbound connection from `uuid` would be accepted
    pub async fn admits_inbound(&self, uuid: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Admits {
            uuid: uuid.to_string(),
            outbound: false,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClusterError::HubClosed)
    }

    pub async fn status(&self) -> Result<HubStatus> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Status { reply }).await?;
        rx.await.map_err(|_| ClusterError::HubClosed)
    }
}
