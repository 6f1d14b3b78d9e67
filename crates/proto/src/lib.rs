use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

/// Channel names carrying a direct message start with this prefix; everything
/// else is a named channel.
pub const DIRECT_CHANNEL_PREFIX: char = '@';

#[derive(Debug)]
pub enum ProtoError {
    EnvelopeTooLarge,
    InvalidEnvelope,
}

impl Display for ProtoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnvelopeTooLarge => write!(f, "envelope exceeds limits"),
            Self::InvalidEnvelope => write!(f, "invalid envelope"),
        }
    }
}

impl Error for ProtoError {}

/// Request payloads a connection may submit. The `op` tag selects the
/// operation; field names follow the public JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientCommand {
    Authenticate {
        token: String,
    },
    GenerateFriendCode,
    SendFriendRequestByCode {
        #[serde(rename = "friendCode")]
        friend_code: String,
    },
    LookupUserByName {
        username: String,
    },
    AcceptFriendRequest {
        #[serde(rename = "friendshipId")]
        friendship_id: String,
    },
    BlockFriendRequest {
        #[serde(rename = "friendshipId")]
        friendship_id: String,
    },
    SendDirectMessage {
        #[serde(rename = "recipientUsername")]
        recipient_username: String,
        content: String,
    },
}

/// Events pushed from the server to a live connection. No reply is expected
/// and delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    FriendRequestReceived {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "senderUsername")]
        sender_username: String,
        #[serde(rename = "friendshipId")]
        friendship_id: String,
    },
    FriendRequestAccepted {
        username: String,
    },
    NewMessage {
        sender: String,
        content: String,
        channel: String,
    },
}

/// Envelope exchanged over the extension relay port between the in-page
/// bridge and the background process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayMessage {
    #[serde(rename = "LOGIN_STATUS")]
    LoginStatus {
        #[serde(rename = "loggedIn")]
        logged_in: bool,
    },
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage {
        sender: String,
        content: String,
        channel: String,
    },
    #[serde(rename = "FRIEND_REQUEST")]
    FriendRequest {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "senderUsername")]
        sender_username: String,
        #[serde(rename = "friendshipId")]
        friendship_id: String,
    },
    #[serde(rename = "FRIEND_ACCEPTED")]
    FriendAccepted { username: String },
    #[serde(rename = "CHECK_LOGIN_STATUS")]
    CheckLoginStatus,
}

/// Decodes a client command from a raw text frame.
pub fn decode_command(data: &[u8]) -> Result<ClientCommand, ProtoError> {
    if data.len() > MAX_ENVELOPE_LEN {
        return Err(ProtoError::EnvelopeTooLarge);
    }
    serde_json::from_slice(data).map_err(|_| ProtoError::InvalidEnvelope)
}

/// Builds a success response carrying the given payload fields.
pub fn ok(payload: Value) -> Value {
    let mut body = json!({ "success": true });
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
        for (key, value) in extra {
            obj.insert(key.clone(), value.clone());
        }
    }
    body
}

/// Builds a failure response with a human-readable message.
pub fn fail(message: &str) -> Value {
    json!({ "success": false, "message": message })
}

/// True when the channel name denotes a direct message.
pub fn is_direct_channel(channel: &str) -> bool {
    channel.starts_with(DIRECT_CHANNEL_PREFIX)
}
