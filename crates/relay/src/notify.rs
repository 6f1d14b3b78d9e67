use crate::settings::RelaySettings;
use flock_proto::{is_direct_channel, RelayMessage};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tracing::info;

/// Body shown instead of message content when the user hides it.
pub const MESSAGE_PLACEHOLDER: &str = "You have a new message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub context: String,
    pub sound: bool,
}

#[derive(Debug)]
pub enum NotifyError {
    Display,
}

impl Display for NotifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Display => write!(f, "notification display failure"),
        }
    }
}

impl Error for NotifyError {}

/// Computes the notification for a relayed message, or `None` when the
/// settings suppress it or the message kind carries nothing to show.
pub fn render_notification(
    message: &RelayMessage,
    settings: &RelaySettings,
) -> Option<Notification> {
    if !settings.enabled {
        return None;
    }
    match message {
        RelayMessage::NewMessage {
            sender,
            content,
            channel,
        } => {
            let title = if is_direct_channel(channel) {
                format!("New message from {}", sender)
            } else {
                format!("New message in #{}", channel)
            };
            let body = if settings.show_message_content {
                content.clone()
            } else {
                MESSAGE_PLACEHOLDER.to_string()
            };
            Some(Notification {
                title,
                body,
                context: channel.clone(),
                sound: settings.sound,
            })
        }
        RelayMessage::FriendRequest {
            sender_username, ..
        } => {
            if !settings.show_friend_requests {
                return None;
            }
            Some(Notification {
                title: "New friend request".to_string(),
                body: format!("{} sent you a friend request", sender_username),
                context: "friend-request".to_string(),
                sound: settings.sound,
            })
        }
        RelayMessage::FriendAccepted { username } => Some(Notification {
            title: "Friend request accepted".to_string(),
            body: format!("{} accepted your friend request", username),
            context: "friend-accepted".to_string(),
            sound: settings.sound,
        }),
        RelayMessage::LoginStatus { .. } | RelayMessage::CheckLoginStatus => None,
    }
}

/// Boundary to the platform notification surface.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Logs notifications instead of displaying them. Default sink for headless
/// runs.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            title = %notification.title,
            context = %notification.context,
            sound = notification.sound,
            "notification"
        );
        Ok(())
    }
}
