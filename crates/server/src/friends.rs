use crate::commands::{storage_failure, CommandError};
use crate::friendcode;
use crate::state::AppState;
use crate::util::generate_id;
use flock_proto::ServerEvent;
use flock_storage::{FriendshipRecord, FriendshipStatus, StorageError, UserProfile};
use tracing::info;

fn conflict_for(status: FriendshipStatus) -> CommandError {
    match status {
        FriendshipStatus::Accepted => CommandError::Conflict("already friends".to_string()),
        FriendshipStatus::Pending => {
            CommandError::Conflict("friend request already pending".to_string())
        }
        FriendshipStatus::Blocked => CommandError::Conflict("user is blocked".to_string()),
    }
}

/// Creates a pending friendship from a friend code and notifies the recipient
/// if they are online. The pre-check is advisory; the insert itself is the
/// arbiter under concurrency.
pub async fn send_request(
    state: &AppState,
    requester: &UserProfile,
    friend_code: &str,
) -> Result<(FriendshipRecord, UserProfile), CommandError> {
    let recipient = friendcode::resolve(state.store.as_ref(), friend_code).await?;
    if recipient.user_id == requester.user_id {
        return Err(CommandError::SelfReference);
    }
    let existing = state
        .store
        .friendship_between(&requester.user_id, &recipient.user_id)
        .await
        .map_err(|err| storage_failure("friendship lookup", err))?;
    if let Some(record) = existing {
        return Err(conflict_for(record.status));
    }
    let id = generate_id(&format!("friendship:{}", requester.user_id));
    let record = match state
        .store
        .create_friendship(&id, &requester.user_id, &recipient.user_id)
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => {
            // Lost the race against a concurrent request for the same pair.
            return Err(CommandError::Conflict(
                "friend request already pending".to_string(),
            ));
        }
        Err(StorageError::Invalid) => return Err(CommandError::SelfReference),
        Err(err) => return Err(storage_failure("friendship create", err)),
    };
    info!(
        requester = %requester.user_id,
        recipient = %recipient.user_id,
        friendship = %record.id,
        "friend request created"
    );
    state
        .router
        .deliver(
            &recipient.user_id,
            &ServerEvent::FriendRequestReceived {
                sender_id: requester.user_id.clone(),
                sender_username: requester.username.clone(),
                friendship_id: record.id.clone(),
            },
        )
        .await;
    Ok((record, recipient))
}

/// Accepts a pending request. Only the recipient may accept; the requester
/// is notified on success.
pub async fn accept(
    state: &AppState,
    user: &UserProfile,
    friendship_id: &str,
) -> Result<FriendshipRecord, CommandError> {
    let record = transition(
        state,
        user,
        friendship_id,
        FriendshipStatus::Accepted,
    )
    .await?;
    info!(user = %user.user_id, friendship = %record.id, "friend request accepted");
    state
        .router
        .deliver(
            &record.requester,
            &ServerEvent::FriendRequestAccepted {
                username: user.username.clone(),
            },
        )
        .await;
    Ok(record)
}

/// Blocks a pending request. Terminal state; no notification is sent to the
/// requester.
pub async fn block(
    state: &AppState,
    user: &UserProfile,
    friendship_id: &str,
) -> Result<FriendshipRecord, CommandError> {
    let record = transition(state, user, friendship_id, FriendshipStatus::Blocked).await?;
    info!(user = %user.user_id, friendship = %record.id, "friend request blocked");
    Ok(record)
}

async fn transition(
    state: &AppState,
    user: &UserProfile,
    friendship_id: &str,
    next: FriendshipStatus,
) -> Result<FriendshipRecord, CommandError> {
    let trimmed = friendship_id.trim();
    if trimmed.is_empty() {
        return Err(CommandError::Validation(
            "friendship id is required".to_string(),
        ));
    }
    let record = match state.store.load_friendship(trimmed).await {
        Ok(record) => record,
        Err(StorageError::Missing) => {
            return Err(CommandError::NotFound("friend request not found".to_string()))
        }
        Err(err) => return Err(storage_failure("friendship load", err)),
    };
    if !record.involves(&user.user_id) {
        // Not a participant; indistinguishable from absent.
        return Err(CommandError::NotFound("friend request not found".to_string()));
    }
    if record.requester == user.user_id {
        return Err(CommandError::Validation(
            "only the recipient can act on a friend request".to_string(),
        ));
    }
    let updated = state
        .store
        .update_friendship_status(&record.id, FriendshipStatus::Pending, next)
        .await
        .map_err(|err| storage_failure("friendship transition", err))?;
    if !updated {
        return Err(CommandError::Conflict(
            "friend request is not pending".to_string(),
        ));
    }
    let mut record = record;
    record.status = next;
    Ok(record)
}
