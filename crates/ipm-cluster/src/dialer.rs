use crate::error::{ClusterError, Result};
use crate::hub::HubHandle;
use crate::peer::{self, Handshake, PeerSocket, INSTANCE_PRIORITY, INSTANCE_UUID};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

/// Interval between reconnect sweeps
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Configured peer hosts and whether each currently has a dialed connection
#[derive(Clone, Default)]
pub struct Hosts {
    inner: Arc<Mutex<HashMap<String, bool>>>,
}

impl Hosts {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(
                hosts.into_iter().map(|h| (h, false)).collect(),
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured hosts without a live connection, sorted
    pub fn pending(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, connected)| !**connected)
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Update a configured host; unknown hosts are ignored
    pub fn set_connected(&self, host: &str, connected: bool) {
        if let Some(state) = self.lock().get_mut(host) {
            *state = connected;
        }
    }

    /// Stop dialing a host
    pub fn remove(&self, host: &str) {
        self.lock().remove(host);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Outbound connections to configured peers
#[derive(Clone)]
pub struct Dialer {
    hub: HubHandle,
    // one dial at a time, so two successes to one peer cannot both join
    lock: Arc<AsyncMutex<()>>,
}

impl Dialer {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            hub,
            lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn hosts(&self) -> &Hosts {
        self.hub.hosts()
    }

    /// Dial `host` and join the resulting connection to the hub.
    ///
    /// A `409 Conflict` answer means the peer already knows us (or is us), so
    /// the host is dropped from the reconnect set.
    pub async fn connect(&self, host: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut request = format!("ws://{}/api/v1/cluster", host).into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(INSTANCE_UUID, header_value(self.hub.uuid())?);
        headers.insert(
            INSTANCE_PRIORITY,
            header_value(&self.hub.priority().to_string())?,
        );

        let (stream, response) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(response)) => {
                let status = response.status();
                if status == StatusCode::CONFLICT {
                    info!("Peer {} refused the connection, no longer dialing it", host);
                    self.hub.hosts().remove(host);
                }
                return Err(ClusterError::Refused {
                    host: host.to_string(),
                    status: status.as_u16(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let handshake = Handshake::parse(
            header(INSTANCE_UUID).as_deref(),
            header(INSTANCE_PRIORITY).as_deref(),
            host,
        )?;

        let peer = peer::join(
            &self.hub,
            handshake,
            PeerSocket::from_tungstenite(stream),
            Some(host.to_string()),
        )
        .await?;
        tokio::spawn(peer.run());
        Ok(())
    }

    /// Dial every configured host once
    pub async fn connect_all(&self) {
        for host in self.hub.hosts().pending() {
            if let Err(e) = self.connect(&host).await {
                warn!("Failed to connect to peer {}: {}", host, e);
            }
        }
    }

    /// Redial disconnected hosts every `interval`; returns at once when no
    /// hosts are configured, or once every host was dropped
    pub async fn reconnect_loop(self, interval: Duration) {
        loop {
            if self.hub.hosts().is_empty() {
                return;
            }
            for host in self.hub.hosts().pending() {
                if let Err(e) = self.connect(&host).await {
                    debug!("Reconnect to {} failed: {}", host, e);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ClusterError::Handshake(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_track_connection_state() {
        let hosts = Hosts::new(["b:1".to_string(), "a:1".to_string()]);
        assert_eq!(hosts.pending(), vec!["a:1", "b:1"]);

        hosts.set_connected("a:1", true);
        hosts.set_connected("unknown:1", true);
        assert_eq!(hosts.pending(), vec!["b:1"]);
        assert_eq!(hosts.len(), 2);

        hosts.remove("b:1");
        assert!(hosts.pending().is_empty());
        hosts.remove("a:1");
        assert!(hosts.is_empty());
    }
}
