use crate::message::{Message, MessageType};
use ipm_ipt::Engine;
use ipm_registry::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A message to send after handling an inbound one
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub message: Message,
    /// unicast to this peer uuid; `None` broadcasts
    pub target: Option<String>,
}

/// Applies peer messages to the local engine and registry.
///
/// Failures while replicating are logged and dropped; the next registry list
/// exchange repairs whatever was missed.
#[derive(Clone)]
pub struct SyncProtocol {
    engine: Arc<Engine>,
}

impl SyncProtocol {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Advertisement sent to every peer when it joins
    pub fn registry_list(&self) -> Message {
        let registry = self.engine.registry();
        Message::registry_list(registry.epoch(), &registry.list())
    }

    pub async fn handle(&self, from: &str, message: Message) -> Vec<Outbound> {
        match message.kind {
            MessageType::CreateRuleSet => {
                self.create(from, message).await;
                vec![]
            }
            MessageType::DeleteRuleSet => {
                info!("Receiving DeleteRuleSet {} from {}", message.name, from);
                if let Err(e) = self
                    .engine
                    .delete_rule_set(&message.name, message.epoch)
                    .await
                {
                    warn!("DeleteRuleSet {} from {} failed: {}", message.name, from, e);
                }
                vec![]
            }
            MessageType::RequestRuleSet => match self.engine.registry().get(&message.name) {
                Some(entry) => vec![Outbound {
                    message: Message::create_rule_set(&message.name, &entry),
                    target: Some(from.to_string()),
                }],
                None => {
                    debug!("{} requested unknown rule set {}", from, message.name);
                    vec![]
                }
            },
            MessageType::RegistryList => self.reconcile(from, message).await,
        }
    }

    async fn create(&self, from: &str, message: Message) {
        let entry: Entry = match serde_json::from_value(message.payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Malformed CreateRuleSet {} from {}: {}", message.name, from, e);
                return;
            }
        };

        info!("Receiving CreateRuleSet {} from {}", message.name, from);
        if let Err(e) = self
            .engine
            .create_rule_set(&message.name, &entry.rule, message.epoch)
            .await
        {
            warn!("CreateRuleSet {} from {} failed: {}", message.name, from, e);
        }
    }

    /// Converge on the peer's inventory when it is newer than ours: drop
    /// what the peer no longer has, pull what we are missing.
    async fn reconcile(&self, from: &str, message: Message) -> Vec<Outbound> {
        let registry = self.engine.registry();
        let local_epoch = registry.epoch();
        if message.epoch <= local_epoch {
            debug!(
                "Ignoring registry list from {} (epoch {} <= {})",
                from, message.epoch, local_epoch
            );
            return vec![];
        }

        let remote: Vec<String> = match serde_json::from_value(message.payload) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Malformed registry list from {}: {}", from, e);
                return vec![];
            }
        };
        let remote_ids: HashSet<&str> = remote.iter().map(String::as_str).collect();
        let local = registry.list();
        let local_ids: HashSet<&str> = local.iter().map(String::as_str).collect();

        info!(
            "Reconciling with {} at epoch {} ({} remote, {} local)",
            from,
            message.epoch,
            remote.len(),
            local.len()
        );

        for id in local.iter().filter(|id| !remote_ids.contains(id.as_str())) {
            if let Err(e) = self.engine.delete_rule_set(id, message.epoch).await {
                warn!("Failed to delete rule set {} during reconcile: {}", id, e);
            }
        }

        remote
            .iter()
            .filter(|id| !local_ids.contains(id.as_str()))
            .map(|id| Outbound {
                message: Message::request_rule_set(id),
                target: Some(from.to_string()),
            })
            .collect()
    }
}
