use crate::metrics::Metrics;
use crate::registry::SessionRegistry;
use flock_proto::ServerEvent;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fans a server event out to every live session of the target user. Offline
/// targets drop the event; durable notification queues are out of scope.
pub struct NotificationRouter {
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
}

impl NotificationRouter {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub async fn deliver(&self, target_user: &str, event: &ServerEvent) {
        let senders = self.registry.senders_for(target_user).await;
        if senders.is_empty() {
            debug!(user = %target_user, "no live sessions, event dropped");
            self.metrics.mark_event_dropped();
            return;
        }
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(user = %target_user, error = %err, "event serialization failed");
                self.metrics.mark_event_dropped();
                return;
            }
        };
        for (connection_id, sender) in senders {
            // Fire-and-forget: a full or closed outbound channel drops the
            // event rather than stalling the caller's command.
            match sender.try_send(payload.clone()) {
                Ok(()) => self.metrics.mark_event_delivered(),
                Err(err) => {
                    warn!(connection = %connection_id, user = %target_user, error = %err, "event delivery failed");
                    self.metrics.mark_event_dropped();
                }
            }
        }
    }
}
