//! Tenant-scoped publish/subscribe event bus.
//!
//! One broadcast channel per tenant, keyed `tempo:{tenant_id}:events`.
//! Delivery is at-least-once within a live subscription and in publication
//! order per publisher; missed events are not replayed here — replay is
//! served from the event repository.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use tempo_domain::EventEnvelope;

use crate::keys;

const CHANNEL_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>,
    /// Cross-tenant firehose for in-process listeners (capture service).
    firehose: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    fn sender(&self, tenant_id: &str) -> broadcast::Sender<EventEnvelope> {
        let channel = keys::channel(tenant_id);
        {
            let channels = self.channels.read();
            if let Some(tx) = channels.get(&channel) {
                return tx.clone();
            }
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish an event on the tenant channel.
    ///
    /// Returns the number of live subscribers that received it. Publishing
    /// into an empty channel is accepted (the event is simply unobserved —
    /// the audit log, not the bus, is the durable record).
    pub fn publish(&self, event: &EventEnvelope) -> usize {
        let tx = self.sender(&event.tenant_id);
        let _ = self.firehose.send(event.clone());
        let receivers = tx.send(event.clone()).unwrap_or(0);
        tracing::debug!(
            kind = %event.kind,
            tenant_id = %event.tenant_id,
            session_id = %event.session_id,
            receivers,
            "bus publish"
        );
        receivers
    }

    /// Open a subscription on the tenant channel. Events published after
    /// this call are delivered until the subscription is dropped.
    pub fn subscribe(&self, tenant_id: &str) -> BusSubscription {
        BusSubscription {
            rx: self.sender(tenant_id).subscribe(),
        }
    }

    /// Subscribe across every tenant channel. For in-process listeners only;
    /// tenant isolation still applies to [`subscribe`](Self::subscribe).
    pub fn subscribe_all(&self) -> BusSubscription {
        BusSubscription {
            rx: self.firehose.subscribe(),
        }
    }

    /// Live subscriber count for a tenant (monitoring).
    pub fn subscriber_count(&self, tenant_id: &str) -> usize {
        let channels = self.channels.read();
        channels
            .get(&keys::channel(tenant_id))
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One subscriber's cursor onto a tenant channel. Dropping it releases the
/// subscription deterministically.
pub struct BusSubscription {
    rx: broadcast::Receiver<EventEnvelope>,
}

impl BusSubscription {
    /// Next event, or `None` once the channel is closed.
    ///
    /// A slow subscriber that falls behind the channel capacity skips the
    /// overwritten events and keeps going — within a live subscription the
    /// bus is at-least-once for keep-up readers, never a durable log.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bus subscriber lagged, events skipped");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
