use std::{collections::HashMap, sync::Arc};

use kiln_process::{ObserverId, ServerEvent};
use tokio::sync::{RwLock, mpsc};

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Fan-out of server events to observers, keyed by channel (instance name or dashboard).
#[derive(Clone, Default)]
pub struct ObserverHub {
    inner: Arc<RwLock<HashMap<String, HashMap<ObserverId, EventSender>>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel: &str, id: ObserverId, tx: EventSender) {
        self.inner
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
    }

    pub async fn unsubscribe(&self, channel: &str, id: &ObserverId) {
        let mut map = self.inner.write().await;
        if let Some(subs) = map.get_mut(channel) {
            subs.remove(id);
            if subs.is_empty() {
                map.remove(channel);
            }
        }
    }

    /// Drop an observer from every channel (socket closed).
    pub async fn remove_observer(&self, id: &ObserverId) {
        let mut map = self.inner.write().await;
        map.retain(|_, subs| {
            subs.remove(id);
            !subs.is_empty()
        });
    }

    /// Deliver `event` to every subscriber of `channel`. Returns the number of deliveries.
    pub async fn publish(&self, channel: &str, event: ServerEvent) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let map = self.inner.read().await;
            let Some(subs) = map.get(channel) else {
                return 0;
            };
            for (id, tx) in subs {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(id.clone());
                }
            }
        }

        for id in dead {
            tracing::debug!(channel, observer = %id.0, "dropping disconnected observer");
            self.unsubscribe(channel, &id).await;
        }
        delivered
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .read()
            .await
            .get(channel)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
