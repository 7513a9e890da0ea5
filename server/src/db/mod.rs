//! Database layer for the MatchMates server using SQLite
//!
//! Provides persistent storage for accounts, sessions, the friend graph,
//! direct and group messages, favorites, and per-game matchmaking settings.
//!
//! Every statement is parameterized. Multi-row writes that must not be
//! observed half-done (accepting a friend request, creating a group) run in a
//! single transaction.

use crate::models::{
    CandidateRow, DirectMessage, FriendRequest, FriendRequestStatus, GameSettings, Group,
    GroupMessage, GroupSummary, PartnerPreferences, PendingRequest, User,
};
use anyhow::{anyhow, Context, Result};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool as Pool};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Open (or create) the database at `db_path`. `:memory:` gives a private
    /// in-memory database backed by a single connection.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let is_memory = db_path.as_ref().to_str() == Some(":memory:");

        let db_url = if is_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", db_path.as_ref().display())
        };

        // Each in-memory connection is its own database, so keep exactly one alive
        let options = if is_memory {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .min_connections(1)
                .idle_timeout(Duration::from_secs(300))
                .max_lifetime(Duration::from_secs(1800))
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        use sqlx::Executor;
                        conn.execute("PRAGMA busy_timeout = 5000").await?;
                        conn.execute("PRAGMA journal_mode = WAL").await?;
                        Ok(())
                    })
                })
        };

        let pool = options
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Close every pooled connection. Later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations to create or update schema
    async fn run_migrations(&self) -> Result<()> {
        const TABLES: &[(&str, &str)] = &[
            (
                "users",
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY NOT NULL,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "auth_tokens",
                r#"
                CREATE TABLE IF NOT EXISTS auth_tokens (
                    token TEXT PRIMARY KEY NOT NULL,
                    user_id TEXT NOT NULL,
                    expires_at INTEGER NOT NULL,
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "friend_requests",
                r#"
                CREATE TABLE IF NOT EXISTS friend_requests (
                    id TEXT PRIMARY KEY NOT NULL,
                    sender_id TEXT NOT NULL,
                    receiver_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at INTEGER NOT NULL,
                    responded_at INTEGER,
                    FOREIGN KEY (sender_id) REFERENCES users (id) ON DELETE CASCADE,
                    FOREIGN KEY (receiver_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "friends",
                r#"
                CREATE TABLE IF NOT EXISTS friends (
                    user_id TEXT NOT NULL,
                    friend_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, friend_id),
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE,
                    FOREIGN KEY (friend_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "messages",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY NOT NULL,
                    sender_id TEXT NOT NULL,
                    receiver_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    FOREIGN KEY (sender_id) REFERENCES users (id) ON DELETE CASCADE,
                    FOREIGN KEY (receiver_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "chat_groups",
                r#"
                CREATE TABLE IF NOT EXISTS chat_groups (
                    id TEXT PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL,
                    creator_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    FOREIGN KEY (creator_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "group_members",
                r#"
                CREATE TABLE IF NOT EXISTS group_members (
                    group_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    added_at INTEGER NOT NULL,
                    PRIMARY KEY (group_id, user_id),
                    FOREIGN KEY (group_id) REFERENCES chat_groups (id) ON DELETE CASCADE,
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "group_messages",
                r#"
                CREATE TABLE IF NOT EXISTS group_messages (
                    id TEXT PRIMARY KEY NOT NULL,
                    group_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    FOREIGN KEY (group_id) REFERENCES chat_groups (id) ON DELETE CASCADE,
                    FOREIGN KEY (sender_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "user_favorites",
                r#"
                CREATE TABLE IF NOT EXISTS user_favorites (
                    user_id TEXT NOT NULL,
                    game_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, game_id),
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "game_settings",
                r#"
                CREATE TABLE IF NOT EXISTS game_settings (
                    user_id TEXT NOT NULL,
                    game_id TEXT NOT NULL,
                    rank TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    options TEXT NOT NULL DEFAULT '{}',
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, game_id),
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
            (
                "partner_preferences",
                r#"
                CREATE TABLE IF NOT EXISTS partner_preferences (
                    user_id TEXT NOT NULL,
                    game_id TEXT NOT NULL,
                    preferred_ranks TEXT NOT NULL DEFAULT '[]',
                    tolerance INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, game_id),
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
                )
                "#,
            ),
        ];

        for (name, ddl) in TABLES {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {} table", name))?;
        }

        const INDEXES: &[&str] = &[
            "CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens (user_id)",
            "CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver ON friend_requests (receiver_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_friend_requests_sender ON friend_requests (sender_id, status)",
            // At most one pending request per unordered pair
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pending_pair \
             ON friend_requests (MIN(sender_id, receiver_id), MAX(sender_id, receiver_id)) \
             WHERE status = 'pending'",
            "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages (sender_id, receiver_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members (user_id)",
            "CREATE INDEX IF NOT EXISTS idx_group_messages_group ON group_messages (group_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_game_settings_game_mode ON game_settings (game_id, mode)",
        ];

        for ddl in INDEXES {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create index: {}", ddl))?;
        }

        Ok(())
    }

    // ── User operations ──

    pub async fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        let user_id = Uuid::new_v4();
        let created_at = now();

        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(created_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        Ok(User {
            id: user_id,
            username: username.to_string(),
            email: email.to_string(),
            created_at,
        })
    }

    pub async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, email, created_at FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by ID")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, email, created_at FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by username")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    /// Look up a user by username or email, returning the stored password hash alongside
    pub async fn get_credentials(&self, identifier: &str) -> Result<Option<(User, String)>> {
        let row = sqlx::query(
            "SELECT id, username, email, created_at, password_hash FROM users \
             WHERE username = ? OR email = ? LIMIT 1",
        )
        .bind(identifier)
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query user credentials")?;

        row.map(|r| Ok((parse_user(&r)?, r.get::<String, _>("password_hash"))))
            .transpose()
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn email_exists(&self, email: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn count_users(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    // ── Auth token operations ──

    pub async fn save_auth_token(&self, token: &str, user_id: Uuid, expires_at: u64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO auth_tokens (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(token)
            .bind(user_id.to_string())
            .bind(expires_at as i64)
            .execute(&self.pool)
            .await
            .context("Failed to save auth token")?;
        Ok(())
    }

    /// All tokens still valid at `current_time`
    pub async fn load_auth_tokens(&self, current_time: u64) -> Result<Vec<(String, Uuid, u64)>> {
        let rows = sqlx::query("SELECT token, user_id, expires_at FROM auth_tokens WHERE expires_at > ?")
            .bind(current_time as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load auth tokens")?;

        rows.iter()
            .map(|r| {
                Ok((
                    r.get::<String, _>("token"),
                    parse_uuid(r, "user_id")?,
                    r.get::<i64, _>("expires_at") as u64,
                ))
            })
            .collect()
    }

    pub async fn delete_auth_token(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("Failed to delete auth token")?;
        Ok(())
    }

    pub async fn delete_expired_auth_tokens(&self, current_time: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE expires_at <= ?")
            .bind(current_time as i64)
            .execute(&self.pool)
            .await
            .context("Failed to purge expired auth tokens")?;
        Ok(result.rows_affected())
    }

    // ── Friend request operations ──

    pub async fn create_friend_request(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<FriendRequest> {
        let request = FriendRequest {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            status: FriendRequestStatus::Pending,
            created_at: now(),
        };

        sqlx::query(
            "INSERT INTO friend_requests (id, sender_id, receiver_id, status, created_at) VALUES (?, ?, ?, 'pending', ?)",
        )
        .bind(request.id.to_string())
        .bind(sender_id.to_string())
        .bind(receiver_id.to_string())
        .bind(request.created_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert friend request")?;

        Ok(request)
    }

    pub async fn get_friend_request(&self, request_id: Uuid) -> Result<Option<FriendRequest>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, status, created_at FROM friend_requests WHERE id = ?",
        )
        .bind(request_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query friend request")?;

        row.map(|r| parse_friend_request(&r)).transpose()
    }

    /// The pending request between two users, in either direction
    pub async fn find_pending_request_between(&self, a: Uuid, b: Uuid) -> Result<Option<FriendRequest>> {
        let row = sqlx::query(
            r#"
            SELECT id, sender_id, receiver_id, status, created_at FROM friend_requests
            WHERE status = 'pending'
              AND ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))
            LIMIT 1
            "#,
        )
        .bind(a.to_string())
        .bind(b.to_string())
        .bind(b.to_string())
        .bind(a.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query pending friend request")?;

        row.map(|r| parse_friend_request(&r)).transpose()
    }

    /// Pending requests addressed to `user_id`, oldest first
    pub async fn get_incoming_requests(&self, user_id: Uuid) -> Result<Vec<PendingRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT fr.id, u.username, fr.created_at
            FROM friend_requests fr
            JOIN users u ON u.id = fr.sender_id
            WHERE fr.receiver_id = ? AND fr.status = 'pending'
            ORDER BY fr.created_at ASC, fr.rowid ASC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query incoming friend requests")?;

        rows.iter().map(parse_pending_request).collect()
    }

    /// Pending requests sent by `user_id`, oldest first
    pub async fn get_outgoing_requests(&self, user_id: Uuid) -> Result<Vec<PendingRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT fr.id, u.username, fr.created_at
            FROM friend_requests fr
            JOIN users u ON u.id = fr.receiver_id
            WHERE fr.sender_id = ? AND fr.status = 'pending'
            ORDER BY fr.created_at ASC, fr.rowid ASC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query outgoing friend requests")?;

        rows.iter().map(parse_pending_request).collect()
    }

    /// Move a pending request to rejected. Returns false if it was no longer pending.
    pub async fn reject_friend_request(&self, request_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE friend_requests SET status = ?, responded_at = ? WHERE id = ? AND status = ?",
        )
        .bind(FriendRequestStatus::Rejected.as_str())
        .bind(now() as i64)
        .bind(request_id.to_string())
        .bind(FriendRequestStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to reject friend request")?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a pending request accepted and insert the friend edge in both directions.
    ///
    /// Returns false, leaving everything untouched, if the request was no longer pending.
    pub async fn accept_friend_request(&self, request: &FriendRequest) -> Result<bool> {
        let accepted_at = now() as i64;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let updated = sqlx::query(
            "UPDATE friend_requests SET status = ?, responded_at = ? WHERE id = ? AND status = ?",
        )
        .bind(FriendRequestStatus::Accepted.as_str())
        .bind(accepted_at)
        .bind(request.id.to_string())
        .bind(FriendRequestStatus::Pending.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to accept friend request")?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.context("Failed to roll back friend acceptance")?;
            return Ok(false);
        }

        for (user_id, friend_id) in [
            (request.sender_id, request.receiver_id),
            (request.receiver_id, request.sender_id),
        ] {
            sqlx::query("INSERT OR IGNORE INTO friends (user_id, friend_id, created_at) VALUES (?, ?, ?)")
                .bind(user_id.to_string())
                .bind(friend_id.to_string())
                .bind(accepted_at)
                .execute(&mut *tx)
                .await
                .context("Failed to insert friend edge")?;
        }

        tx.commit().await.context("Failed to commit friend acceptance")?;
        Ok(true)
    }

    // ── Friend operations ──

    pub async fn are_friends(&self, user_id: Uuid, other_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM friends WHERE user_id = ? AND friend_id = ?")
            .bind(user_id.to_string())
            .bind(other_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Friends of `user_id` as (id, username), alphabetically
    pub async fn get_friends(&self, user_id: Uuid) -> Result<Vec<(Uuid, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.username
            FROM friends f
            JOIN users u ON u.id = f.friend_id
            WHERE f.user_id = ?
            ORDER BY u.username ASC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query friends")?;

        rows.iter()
            .map(|r| Ok((parse_uuid(r, "id")?, r.get::<String, _>("username"))))
            .collect()
    }

    // ── Direct message operations ──

    pub async fn store_message(
        &self,
        sender: &User,
        receiver_id: Uuid,
        content: &str,
    ) -> Result<DirectMessage> {
        let message = DirectMessage {
            id: Uuid::new_v4(),
            sender_id: sender.id,
            receiver_id,
            sender_username: sender.username.clone(),
            content: content.to_string(),
            created_at: now(),
        };

        sqlx::query(
            "INSERT INTO messages (id, sender_id, receiver_id, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(sender.id.to_string())
        .bind(receiver_id.to_string())
        .bind(content)
        .bind(message.created_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        Ok(message)
    }

    /// Both directions of the conversation between two users, oldest first
    pub async fn get_conversation(&self, a: Uuid, b: Uuid) -> Result<Vec<DirectMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.sender_id, m.receiver_id, u.username AS sender_username,
                   m.content, m.created_at
            FROM messages m
            JOIN users u ON u.id = m.sender_id
            WHERE (m.sender_id = ? AND m.receiver_id = ?)
               OR (m.sender_id = ? AND m.receiver_id = ?)
            ORDER BY m.created_at ASC, m.rowid ASC
            "#,
        )
        .bind(a.to_string())
        .bind(b.to_string())
        .bind(b.to_string())
        .bind(a.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query conversation")?;

        rows.iter().map(parse_direct_message).collect()
    }

    // ── Group operations ──

    /// Create a group and its initial membership. The creator is always a member.
    pub async fn create_group(&self, name: &str, creator_id: Uuid, members: &[Uuid]) -> Result<Group> {
        let group = Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
            creator_id,
            created_at: now(),
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("INSERT INTO chat_groups (id, name, creator_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(group.id.to_string())
            .bind(name)
            .bind(creator_id.to_string())
            .bind(group.created_at as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to insert group")?;

        for member_id in std::iter::once(&creator_id).chain(members.iter()) {
            sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id, added_at) VALUES (?, ?, ?)")
                .bind(group.id.to_string())
                .bind(member_id.to_string())
                .bind(group.created_at as i64)
                .execute(&mut *tx)
                .await
                .context("Failed to insert group member")?;
        }

        tx.commit().await.context("Failed to commit group creation")?;
        Ok(group)
    }

    pub async fn get_group(&self, group_id: Uuid) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT id, name, creator_id, created_at FROM chat_groups WHERE id = ?")
            .bind(group_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query group")?;

        row.map(|r| {
            Ok(Group {
                id: parse_uuid(&r, "id")?,
                name: r.get("name"),
                creator_id: parse_uuid(&r, "creator_id")?,
                created_at: r.get::<i64, _>("created_at") as u64,
            })
        })
        .transpose()
    }

    /// Groups `user_id` belongs to, in creation order
    pub async fn get_user_groups(&self, user_id: Uuid) -> Result<Vec<GroupSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.name,
                   (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id) AS member_count
            FROM chat_groups g
            JOIN group_members gm ON gm.group_id = g.id
            WHERE gm.user_id = ?
            ORDER BY g.created_at ASC, g.rowid ASC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query user groups")?;

        rows.iter()
            .map(|r| {
                Ok(GroupSummary {
                    id: parse_uuid(r, "id")?,
                    name: r.get("name"),
                    member_count: r.get::<i64, _>("member_count") as u64,
                })
            })
            .collect()
    }

    pub async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.to_string())
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn get_group_member_ids(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = ?")
            .bind(group_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to query group members")?;

        rows.iter().map(|r| parse_uuid(r, "user_id")).collect()
    }

    pub async fn store_group_message(&self, group_id: Uuid, sender: &User, content: &str) -> Result<GroupMessage> {
        let message = GroupMessage {
            id: Uuid::new_v4(),
            group_id,
            sender_id: sender.id,
            sender_username: sender.username.clone(),
            content: content.to_string(),
            created_at: now(),
        };

        sqlx::query(
            "INSERT INTO group_messages (id, group_id, sender_id, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(group_id.to_string())
        .bind(sender.id.to_string())
        .bind(content)
        .bind(message.created_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert group message")?;

        Ok(message)
    }

    pub async fn get_group_messages(&self, group_id: Uuid) -> Result<Vec<GroupMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT gm.id, gm.group_id, gm.sender_id, u.username AS sender_username,
                   gm.content, gm.created_at
            FROM group_messages gm
            JOIN users u ON u.id = gm.sender_id
            WHERE gm.group_id = ?
            ORDER BY gm.created_at ASC, gm.rowid ASC
            "#,
        )
        .bind(group_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query group messages")?;

        rows.iter()
            .map(|r| {
                Ok(GroupMessage {
                    id: parse_uuid(r, "id")?,
                    group_id: parse_uuid(r, "group_id")?,
                    sender_id: parse_uuid(r, "sender_id")?,
                    sender_username: r.get("sender_username"),
                    content: r.get("content"),
                    created_at: r.get::<i64, _>("created_at") as u64,
                })
            })
            .collect()
    }

    // ── Favorite operations ──

    /// Flip the favorite flag for (user, game) and return the new state
    pub async fn toggle_favorite(&self, user_id: Uuid, game_id: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM user_favorites WHERE user_id = ? AND game_id = ?")
            .bind(user_id.to_string())
            .bind(game_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove favorite")?;

        if removed.rows_affected() > 0 {
            return Ok(false);
        }

        sqlx::query("INSERT OR IGNORE INTO user_favorites (user_id, game_id, created_at) VALUES (?, ?, ?)")
            .bind(user_id.to_string())
            .bind(game_id)
            .bind(now() as i64)
            .execute(&self.pool)
            .await
            .context("Failed to add favorite")?;
        Ok(true)
    }

    /// Favorite game ids, in the order they were added
    pub async fn get_favorites(&self, user_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT game_id FROM user_favorites WHERE user_id = ? ORDER BY created_at ASC, rowid ASC")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to query favorites")?;

        Ok(rows.iter().map(|r| r.get::<String, _>("game_id")).collect())
    }

    // ── Game settings operations ──

    pub async fn upsert_game_settings(&self, user_id: Uuid, settings: &GameSettings) -> Result<()> {
        let options = serde_json::to_string(&settings.options).context("Failed to encode options")?;

        sqlx::query(
            r#"
            INSERT INTO game_settings (user_id, game_id, rank, mode, options, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, game_id) DO UPDATE SET
                rank = excluded.rank,
                mode = excluded.mode,
                options = excluded.options,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id.to_string())
        .bind(&settings.game_id)
        .bind(&settings.rank)
        .bind(&settings.mode)
        .bind(options)
        .bind(settings.updated_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save game settings")?;
        Ok(())
    }

    pub async fn get_game_settings(&self, user_id: Uuid, game_id: &str) -> Result<Option<GameSettings>> {
        let row = sqlx::query(
            "SELECT game_id, rank, mode, options, updated_at FROM game_settings WHERE user_id = ? AND game_id = ?",
        )
        .bind(user_id.to_string())
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query game settings")?;

        row.map(|r| parse_game_settings(&r, "updated_at")).transpose()
    }

    pub async fn upsert_preferences(&self, user_id: Uuid, preferences: &PartnerPreferences) -> Result<()> {
        let preferred_ranks =
            serde_json::to_string(&preferences.preferred_ranks).context("Failed to encode preferred ranks")?;

        sqlx::query(
            r#"
            INSERT INTO partner_preferences (user_id, game_id, preferred_ranks, tolerance, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, game_id) DO UPDATE SET
                preferred_ranks = excluded.preferred_ranks,
                tolerance = excluded.tolerance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id.to_string())
        .bind(&preferences.game_id)
        .bind(preferred_ranks)
        .bind(preferences.tolerance as i64)
        .bind(preferences.updated_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save partner preferences")?;
        Ok(())
    }

    pub async fn get_preferences(&self, user_id: Uuid, game_id: &str) -> Result<Option<PartnerPreferences>> {
        let row = sqlx::query(
            "SELECT game_id, preferred_ranks, tolerance, updated_at FROM partner_preferences WHERE user_id = ? AND game_id = ?",
        )
        .bind(user_id.to_string())
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query partner preferences")?;

        row.map(|r| {
            Ok(PartnerPreferences {
                game_id: r.get("game_id"),
                preferred_ranks: decode_ranks(&r.get::<String, _>("preferred_ranks"))?,
                tolerance: r.get::<i64, _>("tolerance") as u32,
                updated_at: r.get::<i64, _>("updated_at") as u64,
            })
        })
        .transpose()
    }

    /// Everyone else with settings for (game, mode), with their preferences if saved
    pub async fn get_match_candidates(
        &self,
        game_id: &str,
        mode: &str,
        exclude_user: Uuid,
    ) -> Result<Vec<CandidateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT s.user_id, u.username, s.game_id, s.rank, s.mode, s.options,
                   s.updated_at AS settings_updated_at,
                   p.preferred_ranks, p.tolerance, p.updated_at AS prefs_updated_at
            FROM game_settings s
            JOIN users u ON u.id = s.user_id
            LEFT JOIN partner_preferences p ON p.user_id = s.user_id AND p.game_id = s.game_id
            WHERE s.game_id = ? AND s.mode = ? AND s.user_id != ?
            ORDER BY s.rowid ASC
            "#,
        )
        .bind(game_id)
        .bind(mode)
        .bind(exclude_user.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query match candidates")?;

        rows.iter()
            .map(|r| {
                let preferences = match r.get::<Option<String>, _>("preferred_ranks") {
                    Some(ranks) => Some(PartnerPreferences {
                        game_id: game_id.to_string(),
                        preferred_ranks: decode_ranks(&ranks)?,
                        tolerance: r.get::<Option<i64>, _>("tolerance").unwrap_or_default() as u32,
                        updated_at: r.get::<Option<i64>, _>("prefs_updated_at").unwrap_or_default()
                            as u64,
                    }),
                    None => None,
                };

                Ok(CandidateRow {
                    user_id: parse_uuid(r, "user_id")?,
                    username: r.get("username"),
                    settings: parse_game_settings(r, "settings_updated_at")?,
                    preferences,
                })
            })
            .collect()
    }
}

/// Whether an error came from a UNIQUE constraint
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|e| e.is_unique_violation())
}

/// Current UNIX time in seconds
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw = row.get::<String, _>(column);
    Uuid::parse_str(&raw).with_context(|| format!("Invalid UUID in column {}: {}", column, raw))
}

fn parse_user(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: parse_uuid(row, "id")?,
        username: row.get("username"),
        email: row.get("email"),
        created_at: row.get::<i64, _>("created_at") as u64,
    })
}

fn parse_friend_request(row: &SqliteRow) -> Result<FriendRequest> {
    let status = row.get::<String, _>("status");
    Ok(FriendRequest {
        id: parse_uuid(row, "id")?,
        sender_id: parse_uuid(row, "sender_id")?,
        receiver_id: parse_uuid(row, "receiver_id")?,
        status: FriendRequestStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown friend request status: {}", status))?,
        created_at: row.get::<i64, _>("created_at") as u64,
    })
}

fn parse_pending_request(row: &SqliteRow) -> Result<PendingRequest> {
    Ok(PendingRequest {
        id: parse_uuid(row, "id")?,
        username: row.get("username"),
        created_at: row.get::<i64, _>("created_at") as u64,
    })
}

fn parse_direct_message(row: &SqliteRow) -> Result<DirectMessage> {
    Ok(DirectMessage {
        id: parse_uuid(row, "id")?,
        sender_id: parse_uuid(row, "sender_id")?,
        receiver_id: parse_uuid(row, "receiver_id")?,
        sender_username: row.get("sender_username"),
        content: row.get("content"),
        created_at: row.get::<i64, _>("created_at") as u64,
    })
}

fn parse_game_settings(row: &SqliteRow, updated_at_column: &str) -> Result<GameSettings> {
    let options = row.get::<String, _>("options");
    Ok(GameSettings {
        game_id: row.get("game_id"),
        rank: row.get("rank"),
        mode: row.get("mode"),
        options: serde_json::from_str(&options).context("Corrupt options column")?,
        updated_at: row.get::<i64, _>(updated_at_column) as u64,
    })
}

fn decode_ranks(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).context("Corrupt preferred_ranks column")
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchmates_core::GameOptions;

    async fn db_with_users(names: &[&str]) -> (Database, Vec<User>) {
        let db = Database::new(":memory:").await.unwrap();
        let mut users = Vec::new();
        for name in names {
            let user = db
                .create_user(name, &format!("{}@example.com", name), "hash")
                .await
                .unwrap();
            users.push(user);
        }
        (db, users)
    }

    #[tokio::test]
    async fn test_database_initialization() {
        let db = Database::new(":memory:").await.unwrap();
        // Migrations are idempotent
        db.run_migrations().await.unwrap();
        assert_eq!(db.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_user_operations() {
        let (db, users) = db_with_users(&["alice"]).await;
        let alice = &users[0];

        let found = db.get_user_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(found.username, "alice");

        let (by_email, hash) = db.get_credentials("alice@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, alice.id);
        assert_eq!(hash, "hash");
        assert!(db.get_credentials("alice").await.unwrap().is_some());
        assert!(db.get_credentials("bob").await.unwrap().is_none());

        assert!(db.username_exists("alice").await.unwrap());
        assert!(db.email_exists("alice@example.com").await.unwrap());
        assert!(!db.username_exists("bob").await.unwrap());

        let dup = db.create_user("alice", "other@example.com", "x").await.unwrap_err();
        assert!(is_unique_violation(&dup));
    }

    #[tokio::test]
    async fn test_auth_tokens() {
        let (db, users) = db_with_users(&["alice"]).await;
        let t = now();

        db.save_auth_token("live", users[0].id, t + 100).await.unwrap();
        db.save_auth_token("dead", users[0].id, t - 1).await.unwrap();

        let loaded = db.load_auth_tokens(t).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "live");

        assert_eq!(db.delete_expired_auth_tokens(t).await.unwrap(), 1);
        db.delete_auth_token("live").await.unwrap();
        assert!(db.load_auth_tokens(t).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_pending_request_per_pair() {
        let (db, users) = db_with_users(&["alice", "bob"]).await;
        let (alice, bob) = (users[0].id, users[1].id);

        let request = db.create_friend_request(alice, bob).await.unwrap();

        // Same pair, either direction, is refused by the partial unique index
        let err = db.create_friend_request(bob, alice).await.unwrap_err();
        assert!(is_unique_violation(&err));

        let pending = db.find_pending_request_between(bob, alice).await.unwrap().unwrap();
        assert_eq!(pending.id, request.id);

        // Once handled, a new request may be created
        assert!(db.reject_friend_request(request.id).await.unwrap());
        assert!(!db.reject_friend_request(request.id).await.unwrap());
        assert!(db.find_pending_request_between(alice, bob).await.unwrap().is_none());
        db.create_friend_request(bob, alice).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_creates_symmetric_edge() {
        let (db, users) = db_with_users(&["alice", "bob"]).await;
        let (alice, bob) = (users[0].id, users[1].id);

        let request = db.create_friend_request(alice, bob).await.unwrap();
        assert_eq!(db.get_incoming_requests(bob).await.unwrap().len(), 1);
        assert_eq!(db.get_outgoing_requests(alice).await.unwrap()[0].username, "bob");

        assert!(db.accept_friend_request(&request).await.unwrap());

        assert!(db.are_friends(alice, bob).await.unwrap());
        assert!(db.are_friends(bob, alice).await.unwrap());
        assert_eq!(db.get_friends(alice).await.unwrap(), vec![(bob, "bob".to_string())]);

        let stored = db.get_friend_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FriendRequestStatus::Accepted);
        assert!(db.get_incoming_requests(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accept_after_reject_is_refused() {
        let (db, users) = db_with_users(&["alice", "bob"]).await;
        let (alice, bob) = (users[0].id, users[1].id);

        // Snapshot taken while pending, then rejected underneath it
        let snapshot = db.create_friend_request(alice, bob).await.unwrap();
        assert!(db.reject_friend_request(snapshot.id).await.unwrap());

        assert!(!db.accept_friend_request(&snapshot).await.unwrap());

        let stored = db.get_friend_request(snapshot.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FriendRequestStatus::Rejected);
        assert!(!db.are_friends(alice, bob).await.unwrap());
        assert!(!db.are_friends(bob, alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_conversation_order() {
        let (db, users) = db_with_users(&["alice", "bob", "carol"]).await;
        let (alice, bob, carol) = (&users[0], &users[1], &users[2]);

        db.store_message(alice, bob.id, "one").await.unwrap();
        db.store_message(bob, alice.id, "two").await.unwrap();
        db.store_message(carol, alice.id, "elsewhere").await.unwrap();
        db.store_message(alice, bob.id, "three").await.unwrap();

        let convo = db.get_conversation(bob.id, alice.id).await.unwrap();
        let contents: Vec<_> = convo.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(convo[1].sender_username, "bob");
    }

    #[tokio::test]
    async fn test_group_operations() {
        let (db, users) = db_with_users(&["alice", "bob", "carol"]).await;
        let (alice, bob, carol) = (&users[0], &users[1], &users[2]);

        // Creator listed again in members is ignored
        let group = db.create_group("squad", alice.id, &[bob.id, alice.id]).await.unwrap();

        assert!(db.is_group_member(group.id, alice.id).await.unwrap());
        assert!(db.is_group_member(group.id, bob.id).await.unwrap());
        assert!(!db.is_group_member(group.id, carol.id).await.unwrap());

        let groups = db.get_user_groups(bob.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_count, 2);
        assert!(db.get_user_groups(carol.id).await.unwrap().is_empty());

        db.store_group_message(group.id, bob, "gg").await.unwrap();
        let messages = db.get_group_messages(group.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_username, "bob");
    }

    #[tokio::test]
    async fn test_toggle_favorite() {
        let (db, users) = db_with_users(&["alice"]).await;
        let alice = users[0].id;

        assert!(db.toggle_favorite(alice, "lol").await.unwrap());
        assert!(db.toggle_favorite(alice, "wow").await.unwrap());
        assert_eq!(db.get_favorites(alice).await.unwrap(), vec!["lol", "wow"]);

        assert!(!db.toggle_favorite(alice, "lol").await.unwrap());
        assert_eq!(db.get_favorites(alice).await.unwrap(), vec!["wow"]);
    }

    #[tokio::test]
    async fn test_settings_upsert_and_candidates() {
        let (db, users) = db_with_users(&["alice", "bob", "carol"]).await;
        let settings = |rank: &str, mode: &str| GameSettings {
            game_id: "lol".into(),
            rank: rank.into(),
            mode: mode.into(),
            options: GameOptions::default(),
            updated_at: now(),
        };

        db.upsert_game_settings(users[0].id, &settings("gold", "ranked")).await.unwrap();
        db.upsert_game_settings(users[1].id, &settings("silver", "ranked")).await.unwrap();
        db.upsert_game_settings(users[2].id, &settings("gold", "flex")).await.unwrap();

        // Overwrite keeps a single row
        db.upsert_game_settings(users[0].id, &settings("platinum", "ranked")).await.unwrap();
        let mine = db.get_game_settings(users[0].id, "lol").await.unwrap().unwrap();
        assert_eq!(mine.rank, "platinum");
        assert!(db.get_game_settings(users[0].id, "valorant").await.unwrap().is_none());

        db.upsert_preferences(
            users[1].id,
            &PartnerPreferences {
                game_id: "lol".into(),
                preferred_ranks: vec!["diamond".into()],
                tolerance: 2,
                updated_at: now(),
            },
        )
        .await
        .unwrap();

        let candidates = db.get_match_candidates("lol", "ranked", users[0].id).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].username, "bob");
        let prefs = candidates[0].preferences.as_ref().unwrap();
        assert_eq!(prefs.tolerance, 2);
        assert_eq!(prefs.preferred_ranks, vec!["diamond"]);
    }
}
