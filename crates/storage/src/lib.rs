use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Missing,
    Invalid,
    Serialization,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
            Self::Serialization => write!(f, "serialization failure"),
        }
    }
}

impl Error for StorageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Blocked,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Accepted => "accepted",
            FriendshipStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for FriendshipStatus {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(FriendshipStatus::Pending),
            "accepted" => Ok(FriendshipStatus::Accepted),
            "blocked" => Ok(FriendshipStatus::Blocked),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub friend_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One friendship row per unordered user pair. `user_lo < user_hi` holds for
/// every stored record; `requester` is one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendshipRecord {
    pub id: String,
    pub user_lo: String,
    pub user_hi: String,
    pub requester: String,
    pub status: FriendshipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FriendshipRecord {
    /// The pair member that did not initiate the request.
    pub fn recipient(&self) -> &str {
        if self.requester == self.user_lo {
            &self.user_hi
        } else {
            &self.user_lo
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.user_lo == user_id || self.user_hi == user_id
    }
}

/// Orders a user pair into its canonical (lo, hi) form.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Persistence contract for user identities, friend codes, and friendship
/// rows. Pair uniqueness is enforced here as a hard constraint: the losing
/// caller of a concurrent `create_friendship` observes `None`, never a
/// duplicate row.
#[async_trait]
pub trait RelationStore: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<UserProfile, StorageError>;

    async fn load_user(&self, user_id: &str) -> Result<UserProfile, StorageError>;

    async fn user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserProfile>, StorageError>;

    async fn user_by_friend_code(
        &self,
        code: &str,
    ) -> Result<Option<UserProfile>, StorageError>;

    /// Replaces the user's friend code. Returns false when the code is
    /// already owned by another user (uniqueness collision).
    async fn claim_friend_code(&self, user_id: &str, code: &str) -> Result<bool, StorageError>;

    /// Atomic conditional insert of a pending friendship for the unordered
    /// pair. Returns `None` when a row for the pair already exists.
    async fn create_friendship(
        &self,
        id: &str,
        requester: &str,
        recipient: &str,
    ) -> Result<Option<FriendshipRecord>, StorageError>;

    async fn friendship_between(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<FriendshipRecord>, StorageError>;

    async fn load_friendship(&self, id: &str) -> Result<FriendshipRecord, StorageError>;

    /// Guarded status transition. Returns false when the row is no longer in
    /// the expected state.
    async fn update_friendship_status(
        &self,
        id: &str,
        expected: FriendshipStatus,
        next: FriendshipStatus,
    ) -> Result<bool, StorageError>;
}

pub struct PgStore {
    client: Client,
    _pg_task: JoinHandle<()>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<PgStore, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(PgStore {
        client,
        _pg_task: task,
    })
}

const USER_COLUMNS: &str = "user_id, username, display_name, friend_code, created_at, updated_at";
const FRIENDSHIP_COLUMNS: &str =
    "id, user_lo, user_hi, requester, status, created_at, updated_at";

impl PgStore {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Executes a lightweight readiness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    fn user_from_row(row: &tokio_postgres::Row) -> UserProfile {
        UserProfile {
            user_id: row.get(0),
            username: row.get(1),
            display_name: row.get(2),
            friend_code: row.get(3),
            created_at: row.get(4),
            updated_at: row.get(5),
        }
    }

    fn friendship_from_row(row: &tokio_postgres::Row) -> Result<FriendshipRecord, StorageError> {
        let status: String = row.get(4);
        Ok(FriendshipRecord {
            id: row.get(0),
            user_lo: row.get(1),
            user_hi: row.get(2),
            requester: row.get(3),
            status: FriendshipStatus::from_str(status.as_str())?,
            created_at: row.get(5),
            updated_at: row.get(6),
        })
    }
}

#[async_trait]
impl RelationStore for PgStore {
    async fn create_user(&self, user: &NewUser) -> Result<UserProfile, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO app_user (user_id, username, display_name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING {USER_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                query.as_str(),
                &[&user.user_id, &user.username, &user.display_name, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(Self::user_from_row(&row))
    }

    async fn load_user(&self, user_id: &str) -> Result<UserProfile, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(Self::user_from_row(&row))
    }

    async fn user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserProfile>, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE username = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&username])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    async fn user_by_friend_code(
        &self,
        code: &str,
    ) -> Result<Option<UserProfile>, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE friend_code = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&code])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    async fn claim_friend_code(&self, user_id: &str, code: &str) -> Result<bool, StorageError> {
        let now = Utc::now();
        let result = self
            .client
            .execute(
                "UPDATE app_user SET friend_code = $2, updated_at = $3 WHERE user_id = $1",
                &[&user_id, &code, &now],
            )
            .await;
        match result {
            Ok(0) => Err(StorageError::Missing),
            Ok(_) => Ok(true),
            Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => Ok(false),
            Err(_) => Err(StorageError::Postgres),
        }
    }

    async fn create_friendship(
        &self,
        id: &str,
        requester: &str,
        recipient: &str,
    ) -> Result<Option<FriendshipRecord>, StorageError> {
        if requester == recipient {
            return Err(StorageError::Invalid);
        }
        let (lo, hi) = canonical_pair(requester, recipient);
        let now = Utc::now();
        let query = format!(
            "INSERT INTO friendship (id, user_lo, user_hi, requester, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (user_lo, user_hi) DO NOTHING
            RETURNING {FRIENDSHIP_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(
                query.as_str(),
                &[
                    &id,
                    &lo,
                    &hi,
                    &requester,
                    &FriendshipStatus::Pending.as_str(),
                    &now,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => Ok(Some(Self::friendship_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn friendship_between(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<FriendshipRecord>, StorageError> {
        let (lo, hi) = canonical_pair(a, b);
        let query = format!(
            "SELECT {FRIENDSHIP_COLUMNS} FROM friendship WHERE user_lo = $1 AND user_hi = $2"
        );
        let row = self
            .client
            .query_opt(query.as_str(), &[&lo, &hi])
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => Ok(Some(Self::friendship_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn load_friendship(&self, id: &str) -> Result<FriendshipRecord, StorageError> {
        let query = format!("SELECT {FRIENDSHIP_COLUMNS} FROM friendship WHERE id = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Self::friendship_from_row(&row)
    }

    async fn update_friendship_status(
        &self,
        id: &str,
        expected: FriendshipStatus,
        next: FriendshipStatus,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let affected = self
            .client
            .execute(
                "UPDATE friendship SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
                &[&id, &expected.as_str(), &next.as_str(), &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected == 1)
    }
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, UserProfile>,
    by_username: HashMap<String, String>,
    by_code: HashMap<String, String>,
    friendships: HashMap<String, FriendshipRecord>,
    by_pair: HashMap<(String, String), String>,
}

/// In-process store used by tests and the development profile. A single
/// mutex guards every table, so the existence check and the insert inside
/// `create_friendship` happen under one lock acquisition.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelationStore for MemoryStore {
    async fn create_user(&self, user: &NewUser) -> Result<UserProfile, StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.users.contains_key(&user.user_id)
            || inner.by_username.contains_key(&user.username)
        {
            return Err(StorageError::Invalid);
        }
        let now = Utc::now();
        let profile = UserProfile {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            friend_code: None,
            created_at: now,
            updated_at: now,
        };
        inner
            .by_username
            .insert(user.username.clone(), user.user_id.clone());
        inner.users.insert(user.user_id.clone(), profile.clone());
        Ok(profile)
    }

    async fn load_user(&self, user_id: &str) -> Result<UserProfile, StorageError> {
        let inner = self.inner.lock().await;
        inner
            .users
            .get(user_id)
            .cloned()
            .ok_or(StorageError::Missing)
    }

    async fn user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserProfile>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_username
            .get(username)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn user_by_friend_code(
        &self,
        code: &str,
    ) -> Result<Option<UserProfile>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_code
            .get(code)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn claim_friend_code(&self, user_id: &str, code: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(user_id) {
            return Err(StorageError::Missing);
        }
        if let Some(owner) = inner.by_code.get(code) {
            return Ok(owner == user_id);
        }
        let previous = {
            let user = inner.users.get_mut(user_id).ok_or(StorageError::Missing)?;
            let previous = user.friend_code.take();
            user.friend_code = Some(code.to_string());
            user.updated_at = Utc::now();
            previous
        };
        if let Some(old) = previous {
            inner.by_code.remove(&old);
        }
        inner.by_code.insert(code.to_string(), user_id.to_string());
        Ok(true)
    }

    async fn create_friendship(
        &self,
        id: &str,
        requester: &str,
        recipient: &str,
    ) -> Result<Option<FriendshipRecord>, StorageError> {
        if requester == recipient {
            return Err(StorageError::Invalid);
        }
        let mut inner = self.inner.lock().await;
        let (lo, hi) = canonical_pair(requester, recipient);
        let pair = (lo.to_string(), hi.to_string());
        if inner.by_pair.contains_key(&pair) {
            return Ok(None);
        }
        let now = Utc::now();
        let record = FriendshipRecord {
            id: id.to_string(),
            user_lo: pair.0.clone(),
            user_hi: pair.1.clone(),
            requester: requester.to_string(),
            status: FriendshipStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        inner.by_pair.insert(pair, id.to_string());
        inner.friendships.insert(id.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn friendship_between(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<FriendshipRecord>, StorageError> {
        let inner = self.inner.lock().await;
        let (lo, hi) = canonical_pair(a, b);
        Ok(inner
            .by_pair
            .get(&(lo.to_string(), hi.to_string()))
            .and_then(|id| inner.friendships.get(id))
            .cloned())
    }

    async fn load_friendship(&self, id: &str) -> Result<FriendshipRecord, StorageError> {
        let inner = self.inner.lock().await;
        inner
            .friendships
            .get(id)
            .cloned()
            .ok_or(StorageError::Missing)
    }

    async fn update_friendship_status(
        &self,
        id: &str,
        expected: FriendshipStatus,
        next: FriendshipStatus,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.friendships.get_mut(id) {
            Some(record) if record.status == expected => {
                record.status = next;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_user(id: &str) -> NewUser {
        NewUser {
            user_id: id.to_string(),
            username: id.to_string(),
            display_name: None,
        }
    }

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("app_user"));
        assert!(INIT_SQL.contains("friendship"));
        assert!(INIT_SQL.contains("friendship_pair_unique"));
        assert!(INIT_SQL.contains("CHECK (user_lo < user_hi)"));
    }

    #[test]
    fn status_roundtrip() {
        assert_eq!(FriendshipStatus::Pending.as_str(), "pending");
        assert_eq!(
            FriendshipStatus::from_str("accepted").unwrap(),
            FriendshipStatus::Accepted
        );
        assert!(FriendshipStatus::from_str("rejected").is_err());
    }

    #[test]
    fn canonical_pair_orders_lexicographically() {
        assert_eq!(canonical_pair("b", "a"), ("a", "b"));
        assert_eq!(canonical_pair("a", "b"), ("a", "b"));
    }

    #[tokio::test]
    async fn friend_code_claim_replaces_previous_code() {
        let store = MemoryStore::new();
        store.create_user(&new_user("u-1")).await.unwrap();
        assert!(store.claim_friend_code("u-1", "AAAA1111").await.unwrap());
        assert!(store.claim_friend_code("u-1", "BBBB2222").await.unwrap());
        assert!(
            store
                .user_by_friend_code("AAAA1111")
                .await
                .unwrap()
                .is_none()
        );
        let owner = store
            .user_by_friend_code("BBBB2222")
            .await
            .unwrap()
            .expect("owner");
        assert_eq!(owner.user_id, "u-1");
    }

    #[tokio::test]
    async fn friend_code_collision_reports_false() {
        let store = MemoryStore::new();
        store.create_user(&new_user("u-1")).await.unwrap();
        store.create_user(&new_user("u-2")).await.unwrap();
        assert!(store.claim_friend_code("u-1", "SAME1234").await.unwrap());
        assert!(!store.claim_friend_code("u-2", "SAME1234").await.unwrap());
    }

    #[tokio::test]
    async fn friendship_pair_is_unique_regardless_of_direction() {
        let store = MemoryStore::new();
        store.create_user(&new_user("alice")).await.unwrap();
        store.create_user(&new_user("bob")).await.unwrap();
        let created = store
            .create_friendship("f-1", "alice", "bob")
            .await
            .unwrap();
        assert!(created.is_some());
        let reversed = store
            .create_friendship("f-2", "bob", "alice")
            .await
            .unwrap();
        assert!(reversed.is_none());
        let record = store
            .friendship_between("bob", "alice")
            .await
            .unwrap()
            .expect("record");
        assert_eq!(record.id, "f-1");
        assert_eq!(record.requester, "alice");
        assert_eq!(record.recipient(), "bob");
    }

    #[tokio::test]
    async fn self_pair_is_rejected() {
        let store = MemoryStore::new();
        store.create_user(&new_user("alice")).await.unwrap();
        match store.create_friendship("f-1", "alice", "alice").await {
            Err(StorageError::Invalid) => {}
            other => panic!("expected invalid state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_transition_is_guarded() {
        let store = MemoryStore::new();
        store.create_user(&new_user("alice")).await.unwrap();
        store.create_user(&new_user("bob")).await.unwrap();
        store
            .create_friendship("f-1", "alice", "bob")
            .await
            .unwrap();
        assert!(
            store
                .update_friendship_status(
                    "f-1",
                    FriendshipStatus::Pending,
                    FriendshipStatus::Accepted
                )
                .await
                .unwrap()
        );
        // Accepted is stable; a second pending-guarded transition must fail.
        assert!(
            !store
                .update_friendship_status(
                    "f-1",
                    FriendshipStatus::Pending,
                    FriendshipStatus::Blocked
                )
                .await
                .unwrap()
        );
        let record = store.load_friendship("f-1").await.unwrap();
        assert_eq!(record.status, FriendshipStatus::Accepted);
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_one_row() {
        let store = Arc::new(MemoryStore::new());
        store.create_user(&new_user("alice")).await.unwrap();
        store.create_user(&new_user("bob")).await.unwrap();
        let mut tasks = Vec::new();
        for index in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let id = format!("f-{}", index);
                // Half the callers race from each direction.
                if index % 2 == 0 {
                    store.create_friendship(&id, "alice", "bob").await
                } else {
                    store.create_friendship(&id, "bob", "alice").await
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let dsn = match std::env::var("FLOCK_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: FLOCK_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let store = connect(&dsn).await?;
        store.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = store
            .create_user(&NewUser {
                user_id: format!("test-a-{}", suffix),
                username: format!("alice{}", suffix),
                display_name: Some("Alice".to_string()),
            })
            .await?;
        let bob = store
            .create_user(&NewUser {
                user_id: format!("test-b-{}", suffix),
                username: format!("bob{}", suffix),
                display_name: None,
            })
            .await?;
        assert!(
            store
                .claim_friend_code(&alice.user_id, &format!("CODE{}", suffix))
                .await?
        );
        let resolved = store
            .user_by_friend_code(&format!("CODE{}", suffix))
            .await?
            .expect("code resolves");
        assert_eq!(resolved.user_id, alice.user_id);
        let created = store
            .create_friendship(&format!("f-{}", suffix), &bob.user_id, &alice.user_id)
            .await?
            .expect("first insert wins");
        assert_eq!(created.status, FriendshipStatus::Pending);
        let duplicate = store
            .create_friendship(&format!("g-{}", suffix), &alice.user_id, &bob.user_id)
            .await?;
        assert!(duplicate.is_none());
        assert!(
            store
                .update_friendship_status(
                    &created.id,
                    FriendshipStatus::Pending,
                    FriendshipStatus::Accepted
                )
                .await?
        );
        Ok(())
    }
}
