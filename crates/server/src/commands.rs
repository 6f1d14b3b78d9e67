use crate::friendcode;
use crate::friends;
use crate::state::AppState;
use flock_proto::{self as proto, ClientCommand, ServerEvent};
use flock_storage::{FriendshipStatus, StorageError, UserProfile};
use serde_json::{json, Value};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{error, info};

/// Failure modes surfaced to clients. Every variant renders as the exact
/// message the response carries; storage details never leak.
#[derive(Debug)]
pub enum CommandError {
    Unauthorized,
    Validation(String),
    NotFound(String),
    SelfReference,
    Conflict(String),
    Storage,
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "authentication required"),
            Self::Validation(message) => write!(f, "{}", message),
            Self::NotFound(message) => write!(f, "{}", message),
            Self::SelfReference => write!(f, "cannot send a friend request to yourself"),
            Self::Conflict(message) => write!(f, "{}", message),
            Self::Storage => write!(f, "server error"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Logs the storage failure with its operation context and collapses it to
/// the opaque client-facing variant.
pub fn storage_failure(operation: &'static str, error: StorageError) -> CommandError {
    error!(operation, error = %error, "storage failure");
    CommandError::Storage
}

/// Dispatches one decoded command and always yields a response envelope.
pub async fn handle_command(
    state: &Arc<AppState>,
    connection_id: &str,
    command: ClientCommand,
) -> Value {
    state.metrics.mark_command();
    let result = match command {
        ClientCommand::Authenticate { token } => {
            authenticate(state, connection_id, &token).await
        }
        ClientCommand::GenerateFriendCode => generate_friend_code(state, connection_id).await,
        ClientCommand::SendFriendRequestByCode { friend_code } => {
            send_friend_request(state, connection_id, &friend_code).await
        }
        ClientCommand::LookupUserByName { username } => {
            lookup_user(state, connection_id, &username).await
        }
        ClientCommand::AcceptFriendRequest { friendship_id } => {
            accept_friend_request(state, connection_id, &friendship_id).await
        }
        ClientCommand::BlockFriendRequest { friendship_id } => {
            block_friend_request(state, connection_id, &friendship_id).await
        }
        ClientCommand::SendDirectMessage {
            recipient_username,
            content,
        } => send_direct_message(state, connection_id, &recipient_username, &content).await,
    };
    match result {
        Ok(payload) => proto::ok(payload),
        Err(err) => proto::fail(&err.to_string()),
    }
}

async fn authenticate(
    state: &Arc<AppState>,
    connection_id: &str,
    token: &str,
) -> Result<Value, CommandError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(CommandError::Unauthorized);
    }
    let user_id = state
        .verifier
        .verify(trimmed)
        .await
        .map_err(|err| storage_failure("token verification", err))?
        .ok_or(CommandError::Unauthorized)?;
    let profile = match state.store.load_user(&user_id).await {
        Ok(profile) => profile,
        // A valid token for a vanished account is still a refusal.
        Err(StorageError::Missing) => return Err(CommandError::Unauthorized),
        Err(err) => return Err(storage_failure("user load", err)),
    };
    state.registry.register(connection_id, &profile.user_id).await;
    info!(connection = %connection_id, user = %profile.user_id, "session authenticated");
    Ok(json!({
        "userId": profile.user_id,
        "username": profile.username,
    }))
}

/// Resolves the authenticated user behind a connection or refuses.
async fn require_user(
    state: &Arc<AppState>,
    connection_id: &str,
) -> Result<UserProfile, CommandError> {
    let user_id = state
        .registry
        .user_for(connection_id)
        .await
        .ok_or(CommandError::Unauthorized)?;
    match state.store.load_user(&user_id).await {
        Ok(profile) => Ok(profile),
        Err(StorageError::Missing) => Err(CommandError::Unauthorized),
        Err(err) => Err(storage_failure("user load", err)),
    }
}

async fn generate_friend_code(
    state: &Arc<AppState>,
    connection_id: &str,
) -> Result<Value, CommandError> {
    let user = require_user(state, connection_id).await?;
    let code = friendcode::generate(state.store.as_ref(), &user.user_id).await?;
    Ok(json!({ "friendCode": code }))
}

async fn send_friend_request(
    state: &Arc<AppState>,
    connection_id: &str,
    friend_code: &str,
) -> Result<Value, CommandError> {
    let user = require_user(state, connection_id).await?;
    let (record, recipient) = friends::send_request(state, &user, friend_code).await?;
    Ok(json!({
        "friendship": {
            "id": record.id,
            "status": record.status.as_str(),
            "createdAt": record.created_at.to_rfc3339(),
        },
        "recipientUsername": recipient.username,
    }))
}

async fn lookup_user(
    state: &Arc<AppState>,
    connection_id: &str,
    username: &str,
) -> Result<Value, CommandError> {
    require_user(state, connection_id).await?;
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(CommandError::Validation("username is required".to_string()));
    }
    let profile = state
        .store
        .user_by_username(trimmed)
        .await
        .map_err(|err| storage_failure("user lookup", err))?
        .ok_or_else(|| CommandError::NotFound("user not found".to_string()))?;
    Ok(json!({
        "user": {
            "id": profile.user_id,
            "username": profile.username,
        }
    }))
}

async fn accept_friend_request(
    state: &Arc<AppState>,
    connection_id: &str,
    friendship_id: &str,
) -> Result<Value, CommandError> {
    let user = require_user(state, connection_id).await?;
    let record = friends::accept(state, &user, friendship_id).await?;
    Ok(json!({
        "friendship": {
            "id": record.id,
            "status": record.status.as_str(),
        }
    }))
}

async fn block_friend_request(
    state: &Arc<AppState>,
    connection_id: &str,
    friendship_id: &str,
) -> Result<Value, CommandError> {
    let user = require_user(state, connection_id).await?;
    let record = friends::block(state, &user, friendship_id).await?;
    Ok(json!({
        "friendship": {
            "id": record.id,
            "status": record.status.as_str(),
        }
    }))
}

async fn send_direct_message(
    state: &Arc<AppState>,
    connection_id: &str,
    recipient_username: &str,
    content: &str,
) -> Result<Value, CommandError> {
    let user = require_user(state, connection_id).await?;
    let trimmed_recipient = recipient_username.trim();
    if trimmed_recipient.is_empty() {
        return Err(CommandError::Validation("recipient is required".to_string()));
    }
    if content.trim().is_empty() {
        return Err(CommandError::Validation("message is empty".to_string()));
    }
    let recipient = state
        .store
        .user_by_username(trimmed_recipient)
        .await
        .map_err(|err| storage_failure("user lookup", err))?
        .ok_or_else(|| CommandError::NotFound("user not found".to_string()))?;
    if recipient.user_id == user.user_id {
        return Err(CommandError::SelfReference);
    }
    let friendship = state
        .store
        .friendship_between(&user.user_id, &recipient.user_id)
        .await
        .map_err(|err| storage_failure("friendship lookup", err))?;
    match friendship {
        Some(record) if record.status == FriendshipStatus::Accepted => {}
        _ => {
            return Err(CommandError::Conflict(
                "you are not friends with this user".to_string(),
            ))
        }
    }
    state
        .router
        .deliver(
            &recipient.user_id,
            &ServerEvent::NewMessage {
                sender: user.username.clone(),
                content: content.to_string(),
                channel: format!("{}{}", proto::DIRECT_CHANNEL_PREFIX, user.username),
            },
        )
        .await;
    Ok(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::config::{ServerConfig, StoreBackend, TokenEntry};
    use flock_storage::{MemoryStore, NewUser, RelationStore};
    use tokio::sync::mpsc;

    async fn scenario_state() -> Arc<AppState> {
        let store = Arc::new(MemoryStore::new());
        for name in ["alice", "bob"] {
            store
                .create_user(&NewUser {
                    user_id: name.to_string(),
                    username: name.to_string(),
                    display_name: None,
                })
                .await
                .unwrap();
        }
        let tokens = vec![
            TokenEntry {
                token: "tok-a".to_string(),
                user_id: "alice".to_string(),
            },
            TokenEntry {
                token: "tok-b".to_string(),
                user_id: "bob".to_string(),
            },
        ];
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            metrics_bind: None,
            store: StoreBackend::Memory,
            postgres_dsn: None,
            connection_buffer: 8,
            tokens: tokens.clone(),
        };
        AppState::new(
            config,
            store,
            Box::new(StaticTokenVerifier::new(&tokens)),
        )
    }

    async fn connect(
        state: &Arc<AppState>,
        connection_id: &str,
    ) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(8);
        state.registry.attach(connection_id, tx).await;
        rx
    }

    async fn login(state: &Arc<AppState>, connection_id: &str, token: &str) -> Value {
        handle_command(
            state,
            connection_id,
            ClientCommand::Authenticate {
                token: token.to_string(),
            },
        )
        .await
    }

    #[tokio::test]
    async fn unauthenticated_commands_are_refused() {
        let state = scenario_state().await;
        let _rx = connect(&state, "conn-1").await;
        let response =
            handle_command(&state, "conn-1", ClientCommand::GenerateFriendCode).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "authentication required");
    }

    #[tokio::test]
    async fn bad_token_is_refused() {
        let state = scenario_state().await;
        let _rx = connect(&state, "conn-1").await;
        let response = login(&state, "conn-1", "tok-unknown").await;
        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "authentication required");
    }

    #[tokio::test]
    async fn friend_request_scenario_end_to_end() {
        let state = scenario_state().await;
        let mut alice_rx = connect(&state, "conn-a").await;
        let _bob_rx = connect(&state, "conn-b").await;

        let login_alice = login(&state, "conn-a", "tok-a").await;
        assert_eq!(login_alice["success"], true);
        assert_eq!(login_alice["username"], "alice");
        assert_eq!(login(&state, "conn-b", "tok-b").await["success"], true);

        let code_response =
            handle_command(&state, "conn-a", ClientCommand::GenerateFriendCode).await;
        assert_eq!(code_response["success"], true);
        let code = code_response["friendCode"].as_str().unwrap().to_string();

        let request = handle_command(
            &state,
            "conn-b",
            ClientCommand::SendFriendRequestByCode {
                friend_code: code.clone(),
            },
        )
        .await;
        assert_eq!(request["success"], true);
        assert_eq!(request["recipientUsername"], "alice");
        assert_eq!(request["friendship"]["status"], "pending");
        let friendship_id = request["friendship"]["id"].as_str().unwrap().to_string();

        let notification = alice_rx.recv().await.unwrap();
        assert_eq!(notification["event"], "friend-request-received");
        assert_eq!(notification["senderUsername"], "bob");

        let retry = handle_command(
            &state,
            "conn-b",
            ClientCommand::SendFriendRequestByCode { friend_code: code },
        )
        .await;
        assert_eq!(retry["success"], false);
        assert_eq!(retry["message"], "friend request already pending");

        let accept = handle_command(
            &state,
            "conn-a",
            ClientCommand::AcceptFriendRequest { friendship_id },
        )
        .await;
        assert_eq!(accept["success"], true);
        assert_eq!(accept["friendship"]["status"], "accepted");
    }

    #[tokio::test]
    async fn direct_messages_require_friendship() {
        let state = scenario_state().await;
        let mut alice_rx = connect(&state, "conn-a").await;
        let _bob_rx = connect(&state, "conn-b").await;
        login(&state, "conn-a", "tok-a").await;
        login(&state, "conn-b", "tok-b").await;

        let refused = handle_command(
            &state,
            "conn-b",
            ClientCommand::SendDirectMessage {
                recipient_username: "alice".to_string(),
                content: "hi".to_string(),
            },
        )
        .await;
        assert_eq!(refused["success"], false);
        assert_eq!(refused["message"], "you are not friends with this user");

        let code = handle_command(&state, "conn-a", ClientCommand::GenerateFriendCode).await
            ["friendCode"]
            .as_str()
            .unwrap()
            .to_string();
        let request = handle_command(
            &state,
            "conn-b",
            ClientCommand::SendFriendRequestByCode { friend_code: code },
        )
        .await;
        let friendship_id = request["friendship"]["id"].as_str().unwrap().to_string();
        // Drain the friend-request notification before the message arrives.
        alice_rx.recv().await.unwrap();
        handle_command(
            &state,
            "conn-a",
            ClientCommand::AcceptFriendRequest { friendship_id },
        )
        .await;

        let sent = handle_command(
            &state,
            "conn-b",
            ClientCommand::SendDirectMessage {
                recipient_username: "alice".to_string(),
                content: "hello there".to_string(),
            },
        )
        .await;
        assert_eq!(sent["success"], true);

        let message = alice_rx.recv().await.unwrap();
        assert_eq!(message["event"], "new-message");
        assert_eq!(message["sender"], "bob");
        assert_eq!(message["content"], "hello there");
        assert_eq!(message["channel"], "@bob");
    }

    #[tokio::test]
    async fn lookup_requires_auth_and_finds_users() {
        let state = scenario_state().await;
        let _rx = connect(&state, "conn-a").await;
        let refused = handle_command(
            &state,
            "conn-a",
            ClientCommand::LookupUserByName {
                username: "bob".to_string(),
            },
        )
        .await;
        assert_eq!(refused["message"], "authentication required");

        login(&state, "conn-a", "tok-a").await;
        let found = handle_command(
            &state,
            "conn-a",
            ClientCommand::LookupUserByName {
                username: "bob".to_string(),
            },
        )
        .await;
        assert_eq!(found["success"], true);
        assert_eq!(found["user"]["username"], "bob");

        let missing = handle_command(
            &state,
            "conn-a",
            ClientCommand::LookupUserByName {
                username: "carol".to_string(),
            },
        )
        .await;
        assert_eq!(missing["success"], false);
        assert_eq!(missing["message"], "user not found");
    }
}
