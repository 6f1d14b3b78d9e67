use crate::commands::{storage_failure, CommandError};
use flock_storage::{RelationStore, UserProfile};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info};

pub const FRIEND_CODE_LENGTH: usize = 8;
pub const MAX_CLAIM_ATTEMPTS: usize = 16;
// Excludes 0, O, 1, I and L to keep codes unambiguous when read aloud.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Produces a candidate friend code. Uniqueness is enforced by the store, not
/// here.
pub fn generate_code() -> String {
    let mut buf = [0u8; FRIEND_CODE_LENGTH];
    OsRng.fill_bytes(&mut buf);
    buf.iter()
        .map(|byte| char::from(CODE_ALPHABET[(*byte as usize) % CODE_ALPHABET.len()]))
        .collect()
}

/// Mints a fresh friend code for the user, retrying on collision. The new
/// code replaces any previously issued one.
pub async fn generate(
    store: &dyn RelationStore,
    user_id: &str,
) -> Result<String, CommandError> {
    for _ in 0..MAX_CLAIM_ATTEMPTS {
        let code = generate_code();
        match store.claim_friend_code(user_id, &code).await {
            Ok(true) => {
                info!(user = %user_id, "friend code issued");
                return Ok(code);
            }
            Ok(false) => continue,
            Err(err) => return Err(storage_failure("claim friend code", err)),
        }
    }
    error!(user = %user_id, attempts = MAX_CLAIM_ATTEMPTS, "friend code space exhausted");
    Err(CommandError::Storage)
}

/// Resolves a friend code to its owner. Exact match only; padded or
/// case-shifted input does not resolve.
pub async fn resolve(
    store: &dyn RelationStore,
    code: &str,
) -> Result<UserProfile, CommandError> {
    if code.is_empty() {
        return Err(CommandError::NotFound("invalid code".to_string()));
    }
    match store.user_by_friend_code(code).await {
        Ok(Some(profile)) => Ok(profile),
        Ok(None) => Err(CommandError::NotFound("invalid code".to_string())),
        Err(err) => Err(storage_failure("resolve friend code", err)),
    }
}
