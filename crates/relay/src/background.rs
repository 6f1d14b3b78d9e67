use crate::notify::{render_notification, NotificationSink};
use crate::port::PageHandle;
use crate::settings::RelaySettings;
use flock_proto::RelayMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// How often every known page is asked to re-probe login state. This poll is
/// the only recovery path for a bridge lost across a page reload.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Stage B. Owns the settings snapshot, the table of page ports, and the
/// notification sink. Runs as a single task; pages talk to it only through
/// channels.
pub struct BackgroundRelay {
    settings: RelaySettings,
    sink: Box<dyn NotificationSink>,
    pages: HashMap<String, PageHandle>,
    inbound: mpsc::Receiver<(String, RelayMessage)>,
    registrations: mpsc::Receiver<PageHandle>,
    reconcile_interval: Duration,
}

impl BackgroundRelay {
    pub fn new(
        settings: RelaySettings,
        sink: Box<dyn NotificationSink>,
        inbound: mpsc::Receiver<(String, RelayMessage)>,
        registrations: mpsc::Receiver<PageHandle>,
    ) -> Self {
        Self {
            settings,
            sink,
            pages: HashMap::new(),
            inbound,
            registrations,
            reconcile_interval: RECONCILE_INTERVAL,
        }
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Runs until the inbound channel is torn down.
    pub async fn run(mut self) {
        let mut ticker = interval_at(
            Instant::now() + self.reconcile_interval,
            self.reconcile_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                Some(handle) = self.registrations.recv() => {
                    debug!(page = %handle.page_id, "page registered");
                    self.pages.insert(handle.page_id.clone(), handle);
                }
                message = self.inbound.recv() => match message {
                    Some((page_id, message)) => self.handle_message(&page_id, message),
                    None => break,
                },
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }

    fn handle_message(&mut self, page_id: &str, message: RelayMessage) {
        if let RelayMessage::LoginStatus { logged_in } = &message {
            debug!(page = %page_id, logged_in, "login status");
        }
        if let Some(notification) = render_notification(&message, &self.settings) {
            if let Err(err) = self.sink.notify(&notification) {
                warn!(page = %page_id, error = %err, "notification display failed");
            }
        }
    }

    async fn reconcile(&mut self) {
        let mut stale = Vec::new();
        for (page_id, handle) in &self.pages {
            if !handle.send(RelayMessage::CheckLoginStatus).await {
                stale.push(page_id.clone());
            }
        }
        for page_id in stale {
            debug!(page = %page_id, "page port torn down");
            self.pages.remove(&page_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Notification, NotifyError, MESSAGE_PLACEHOLDER};
    use crate::port::{open_port, PORT_BUFFER};
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct CapturingSink {
        seen: Arc<Mutex<Vec<Notification>>>,
    }

    impl NotificationSink for CapturingSink {
        fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Harness {
        inbound: mpsc::Sender<(String, RelayMessage)>,
        registrations: mpsc::Sender<PageHandle>,
        sink: CapturingSink,
    }

    fn spawn_relay(settings: RelaySettings, reconcile: Duration) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(PORT_BUFFER);
        let (registrations_tx, registrations_rx) = mpsc::channel(PORT_BUFFER);
        let sink = CapturingSink::default();
        let relay = BackgroundRelay::new(
            settings,
            Box::new(sink.clone()),
            inbound_rx,
            registrations_rx,
        )
        .with_reconcile_interval(reconcile);
        tokio::spawn(relay.run());
        Harness {
            inbound: inbound_tx,
            registrations: registrations_tx,
            sink,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_content_renders_the_placeholder_body() {
        let settings = RelaySettings {
            show_message_content: false,
            ..RelaySettings::default()
        };
        let harness = spawn_relay(settings, RECONCILE_INTERVAL);
        harness
            .inbound
            .send((
                "page-1".to_string(),
                RelayMessage::NewMessage {
                    sender: "alice".to_string(),
                    content: "secret".to_string(),
                    channel: "@alice".to_string(),
                },
            ))
            .await
            .unwrap();
        // Yield until the relay task has drained the channel.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let seen = harness.sink.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, MESSAGE_PLACEHOLDER);
        assert_eq!(seen[0].title, "New message from alice");
    }

    #[tokio::test(start_paused = true)]
    async fn control_messages_do_not_notify() {
        let harness = spawn_relay(RelaySettings::default(), RECONCILE_INTERVAL);
        harness
            .inbound
            .send((
                "page-1".to_string(),
                RelayMessage::LoginStatus { logged_in: true },
            ))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(harness.sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_probes_every_registered_page() {
        let harness = spawn_relay(RelaySettings::default(), Duration::from_secs(5));
        let (mut port_one, handle_one) = open_port("page-1", harness.inbound.clone());
        let (mut port_two, handle_two) = open_port("page-2", harness.inbound.clone());
        harness.registrations.send(handle_one).await.unwrap();
        harness.registrations.send(handle_two).await.unwrap();

        let probe_one = timeout(Duration::from_secs(10), port_one.recv())
            .await
            .unwrap();
        let probe_two = timeout(Duration::from_secs(10), port_two.recv())
            .await
            .unwrap();
        assert_eq!(probe_one, Some(RelayMessage::CheckLoginStatus));
        assert_eq!(probe_two, Some(RelayMessage::CheckLoginStatus));
    }
}
