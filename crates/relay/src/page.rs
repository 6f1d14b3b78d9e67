use crate::port::PagePort;
use async_trait::async_trait;
use flock_proto::{RelayMessage, ServerEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

/// Grace period between page load and the first login probe. The page needs
/// a moment before its content reflects the real login state.
pub const CONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Probing,
    LoggedOut,
    Listening,
}

/// The in-page collaborator the bridge observes. Login detection details
/// stay behind this seam.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn probe_login(&self) -> bool;
}

/// Wraps a page event in its relay envelope.
pub fn tag_event(event: ServerEvent) -> RelayMessage {
    match event {
        ServerEvent::NewMessage {
            sender,
            content,
            channel,
        } => RelayMessage::NewMessage {
            sender,
            content,
            channel,
        },
        ServerEvent::FriendRequestReceived {
            sender_id,
            sender_username,
            friendship_id,
        } => RelayMessage::FriendRequest {
            sender_id,
            sender_username,
            friendship_id,
        },
        ServerEvent::FriendRequestAccepted { username } => {
            RelayMessage::FriendAccepted { username }
        }
    }
}

/// Stage A. Lives inside one page instance, probes login state, and forwards
/// page events over its port while logged in. Events observed while logged
/// out are dropped.
pub struct PageBridge<S: PageSource> {
    source: S,
    port: PagePort,
    events: mpsc::Receiver<ServerEvent>,
    state: BridgeState,
}

impl<S: PageSource> PageBridge<S> {
    pub fn new(source: S, port: PagePort, events: mpsc::Receiver<ServerEvent>) -> Self {
        Self {
            source,
            port,
            events,
            state: BridgeState::Disconnected,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Runs until the port or the event source is torn down. A torn-down
    /// bridge is never resumed; the next page load starts a fresh one.
    pub async fn run(mut self) {
        self.state = BridgeState::Connecting;
        sleep(CONNECT_DELAY).await;
        if !self.probe().await {
            return;
        }
        loop {
            tokio::select! {
                control = self.port.recv() => match control {
                    Some(RelayMessage::CheckLoginStatus) => {
                        if !self.probe().await {
                            break;
                        }
                    }
                    Some(other) => {
                        debug!(page = %self.port.page_id(), message = ?other, "unexpected control message");
                    }
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) if self.state == BridgeState::Listening => {
                        if !self.port.send(tag_event(event)).await {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }

    async fn probe(&mut self) -> bool {
        self.state = BridgeState::Probing;
        let logged_in = self.source.probe_login().await;
        self.state = if logged_in {
            BridgeState::Listening
        } else {
            BridgeState::LoggedOut
        };
        debug!(page = %self.port.page_id(), logged_in, "login probed");
        self.port
            .send(RelayMessage::LoginStatus { logged_in })
            .await
    }
}
