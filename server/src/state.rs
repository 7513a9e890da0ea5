//! State management for the MatchMates server with SQLite persistence

use crate::auth::{generate_token, hash_password, verify_password};
use crate::db::{is_unique_violation, now, Database};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    AuthToken, ConversationMessage, FriendInfo, FriendRequestStatus, FriendRequestsResponse,
    GameSettings, GameSettingsBody, GroupMessage, GroupSummary, MatchResult, PartnerPreferences,
    PreferencesBody, SessionResponse, User, WsEvent,
};
use crate::rate_limit::{ActionType, RateLimitError, RateLimiter};
use crate::validation::{
    message_within_limit, validate_email, validate_group_name, validate_password,
    validate_username,
};
use anyhow::Result;
use matchmates_core::games::normalize_rank;
use matchmates_core::{
    find_game, find_matches, Game, MatchCandidate, MatchPolicy, MatchProfile, DEFAULT_TOLERANCE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default session lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Demo account created by `--seed-demo-user`
pub const DEMO_USERNAME: &str = "testuser";
pub const DEMO_EMAIL: &str = "test@example.com";
pub const DEMO_PASSWORD: &str = "password";

/// A registered WebSocket connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub sender: broadcast::Sender<String>,
}

/// Application state shared across handlers
pub struct AppState {
    /// Database connection for persistent storage
    pub db: Database,
    /// Active authentication tokens, mirrored from the database
    pub auth_tokens: RwLock<HashMap<String, AuthToken>>,
    /// Active WebSocket connections indexed by user ID, one per user
    pub connections: RwLock<HashMap<Uuid, Connection>>,
    pub rate_limiter: RateLimiter,
    pub match_policy: MatchPolicy,
    pub token_ttl: Duration,
    /// Server start time
    pub start_time: u64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &"<Database>")
            .field("match_policy", &self.match_policy)
            .field("token_ttl", &self.token_ttl)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    /// Create new application state with database connection.
    ///
    /// Unexpired sessions stored by a previous run are loaded back into memory.
    pub async fn new(db_path: &str) -> Result<Self> {
        let db = Database::new(db_path).await?;

        let current = now();
        let purged = db.delete_expired_auth_tokens(current).await?;
        let tokens: HashMap<String, AuthToken> = db
            .load_auth_tokens(current)
            .await?
            .into_iter()
            .map(|(token, user_id, expires_at)| {
                (
                    token.clone(),
                    AuthToken {
                        token,
                        user_id,
                        expires_at,
                    },
                )
            })
            .collect();
        debug!(restored = tokens.len(), purged, "Loaded sessions");

        Ok(Self {
            db,
            auth_tokens: RwLock::new(tokens),
            connections: RwLock::new(HashMap::new()),
            rate_limiter: RateLimiter::new(),
            match_policy: MatchPolicy::default(),
            token_ttl: DEFAULT_TOKEN_TTL,
            start_time: current,
        })
    }

    /// Create new application state with in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    // ── Account operations ──

    pub async fn signup(&self, username: &str, email: &str, password: &str) -> ApiResult<SessionResponse> {
        let username = username.trim();
        let email = email.trim().to_lowercase();

        if username.is_empty() || email.is_empty() || password.is_empty() {
            return Err(ApiError::MissingFields);
        }
        validate_username(username).map_err(ApiError::InvalidUsername)?;
        validate_email(&email).map_err(ApiError::InvalidEmail)?;
        validate_password(password).map_err(ApiError::InvalidPassword)?;

        if self.db.username_exists(username).await? {
            return Err(ApiError::UsernameTaken);
        }
        if self.db.email_exists(&email).await? {
            return Err(ApiError::EmailTaken);
        }

        let user = match self.db.create_user(username, &email, &hash_password(password)).await {
            Ok(user) => user,
            // Lost a race with a concurrent signup
            Err(e) if is_unique_violation(&e) => {
                return Err(if self.db.username_exists(username).await? {
                    ApiError::UsernameTaken
                } else {
                    ApiError::EmailTaken
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(user_id = %user.id, username = %user.username, "New account");
        self.open_session(&user).await
    }

    /// Log in by username or email
    pub async fn login(&self, identifier: &str, password: &str) -> ApiResult<SessionResponse> {
        let identifier = identifier.trim();
        if identifier.is_empty() || password.is_empty() {
            return Err(ApiError::MissingFields);
        }

        let lookup = if identifier.contains('@') {
            identifier.to_lowercase()
        } else {
            identifier.to_string()
        };

        let (user, password_hash) = self
            .db
            .get_credentials(&lookup)
            .await?
            .ok_or(ApiError::InvalidCredentials)?;

        if !verify_password(password, &password_hash) {
            warn!(username = %user.username, "Failed login attempt");
            return Err(ApiError::InvalidCredentials);
        }

        self.open_session(&user).await
    }

    async fn open_session(&self, user: &User) -> ApiResult<SessionResponse> {
        let token = generate_token();
        let expires_at = now() + self.token_ttl.as_secs();

        self.db.save_auth_token(&token, user.id, expires_at).await?;
        self.auth_tokens.write().await.insert(
            token.clone(),
            AuthToken {
                token: token.clone(),
                user_id: user.id,
                expires_at,
            },
        );

        Ok(SessionResponse {
            token,
            user_id: user.id,
            username: user.username.clone(),
            expires_at,
        })
    }

    pub async fn logout(&self, token: &str) -> ApiResult<()> {
        self.auth_tokens.write().await.remove(token);
        self.db.delete_auth_token(token).await?;
        Ok(())
    }

    /// Resolve a token to its user id, evicting it if expired
    pub async fn validate_token(&self, token: &str) -> Option<Uuid> {
        {
            let auth_tokens = self.auth_tokens.read().await;
            let auth_token = auth_tokens.get(token)?;
            if auth_token.expires_at > now() {
                return Some(auth_token.user_id);
            }
        }

        self.auth_tokens.write().await.remove(token);
        if let Err(e) = self.db.delete_auth_token(token).await {
            warn!("Failed to delete expired token: {:#}", e);
        }
        None
    }

    /// The user owning `token`, or `unauthorized`
    pub async fn authenticate(&self, token: &str) -> ApiResult<User> {
        let user_id = self.validate_token(token).await.ok_or(ApiError::Unauthorized)?;
        self.db
            .get_user_by_id(user_id)
            .await?
            .ok_or(ApiError::Unauthorized)
    }

    /// Create the demo account if it does not exist yet
    pub async fn seed_demo_user(&self) -> Result<()> {
        if self.db.username_exists(DEMO_USERNAME).await? {
            debug!("Demo user already present");
            return Ok(());
        }
        self.db
            .create_user(DEMO_USERNAME, DEMO_EMAIL, &hash_password(DEMO_PASSWORD))
            .await?;
        info!("Seeded demo user '{}'", DEMO_USERNAME);
        Ok(())
    }

    // ── Friend operations ──

    pub async fn send_friend_request(&self, from: &User, to_username: &str) -> ApiResult<Uuid> {
        let to_username = to_username.trim();
        if to_username.is_empty() {
            return Err(ApiError::MissingFields);
        }

        let receiver = self
            .db
            .get_user_by_username(to_username)
            .await?
            .ok_or(ApiError::UserNotFound)?;

        if receiver.id == from.id {
            return Err(ApiError::CannotAddSelf);
        }
        if self.db.are_friends(from.id, receiver.id).await? {
            return Err(ApiError::AlreadyFriends);
        }
        if self.db.find_pending_request_between(from.id, receiver.id).await?.is_some() {
            return Err(ApiError::RequestAlreadyPending);
        }

        self.rate_limit(from.id, ActionType::FriendRequest).await?;

        let request = match self.db.create_friend_request(from.id, receiver.id).await {
            Ok(request) => request,
            Err(e) if is_unique_violation(&e) => return Err(ApiError::RequestAlreadyPending),
            Err(e) => return Err(e.into()),
        };

        debug!(from = %from.username, to = %receiver.username, "Friend request sent");
        self.send_to_user(
            receiver.id,
            WsEvent::FriendRequest {
                request_id: request.id,
                from: from.username.clone(),
            },
        )
        .await;

        Ok(request.id)
    }

    pub async fn list_friends(&self, user: &User) -> ApiResult<Vec<FriendInfo>> {
        let friends = self.db.get_friends(user.id).await?;
        let connections = self.connections.read().await;
        Ok(friends
            .into_iter()
            .map(|(id, username)| FriendInfo {
                online: connections.contains_key(&id),
                id,
                username,
            })
            .collect())
    }

    pub async fn list_friend_requests(&self, user: &User) -> ApiResult<FriendRequestsResponse> {
        Ok(FriendRequestsResponse {
            incoming: self.db.get_incoming_requests(user.id).await?,
            outgoing: self.db.get_outgoing_requests(user.id).await?,
        })
    }

    /// Accept or reject a request addressed to `user`
    pub async fn respond_to_request(
        &self,
        user: &User,
        request_id: Uuid,
        action: &str,
    ) -> ApiResult<FriendRequestStatus> {
        let accept = match action {
            "accept" => true,
            "reject" => false,
            _ => return Err(ApiError::InvalidAction),
        };

        let request = self
            .db
            .get_friend_request(request_id)
            .await?
            .filter(|r| r.receiver_id == user.id)
            .ok_or(ApiError::RequestNotFound)?;

        if request.status != FriendRequestStatus::Pending {
            return Err(ApiError::RequestAlreadyHandled);
        }

        // Both transitions re-check pending status inside the store
        if !accept {
            if !self.db.reject_friend_request(request.id).await? {
                return Err(ApiError::RequestAlreadyHandled);
            }
            debug!(request_id = %request.id, "Friend request rejected");
            return Ok(FriendRequestStatus::Rejected);
        }

        if !self.db.accept_friend_request(&request).await? {
            return Err(ApiError::RequestAlreadyHandled);
        }
        info!(a = %request.sender_id, b = %request.receiver_id, "Friendship created");

        self.send_to_user(
            request.sender_id,
            WsEvent::FriendAccept {
                request_id: request.id,
                username: user.username.clone(),
            },
        )
        .await;

        Ok(FriendRequestStatus::Accepted)
    }

    // ── Direct messages ──

    pub async fn send_message(&self, from: &User, to_username: &str, content: &str) -> ApiResult<Uuid> {
        let content = checked_content(content)?;

        let receiver = self
            .db
            .get_user_by_username(to_username.trim())
            .await?
            .ok_or(ApiError::UserNotFound)?;

        self.rate_limit(from.id, ActionType::DirectMessage).await?;

        let message = self.db.store_message(from, receiver.id, content).await?;
        self.send_to_user(
            receiver.id,
            WsEvent::NewMessage {
                id: message.id,
                from: from.username.clone(),
                content: message.content,
                created_at: message.created_at,
            },
        )
        .await;

        Ok(message.id)
    }

    pub async fn get_conversation(&self, user: &User, other_username: &str) -> ApiResult<Vec<ConversationMessage>> {
        let other = self
            .db
            .get_user_by_username(other_username)
            .await?
            .ok_or(ApiError::UserNotFound)?;

        let messages = self.db.get_conversation(user.id, other.id).await?;
        Ok(messages
            .into_iter()
            .map(|m| ConversationMessage {
                id: m.id,
                from_self: m.sender_id == user.id,
                sender_username: m.sender_username,
                content: m.content,
                created_at: m.created_at,
            })
            .collect())
    }

    // ── Groups ──

    pub async fn create_group(&self, creator: &User, name: &str, members: &[String]) -> ApiResult<Uuid> {
        validate_group_name(name).map_err(ApiError::InvalidGroupName)?;

        let mut member_ids = Vec::with_capacity(members.len());
        for username in members {
            let member = self
                .db
                .get_user_by_username(username.trim())
                .await?
                .ok_or(ApiError::UserNotFound)?;
            if member.id != creator.id && !member_ids.contains(&member.id) {
                member_ids.push(member.id);
            }
        }

        let group = self.db.create_group(name.trim(), creator.id, &member_ids).await?;
        info!(group_id = %group.id, members = member_ids.len() + 1, "Group created");
        Ok(group.id)
    }

    pub async fn list_groups(&self, user: &User) -> ApiResult<Vec<GroupSummary>> {
        Ok(self.db.get_user_groups(user.id).await?)
    }

    async fn require_membership(&self, user: &User, group_id: Uuid) -> ApiResult<()> {
        if self.db.get_group(group_id).await?.is_none() {
            return Err(ApiError::GroupNotFound);
        }
        if !self.db.is_group_member(group_id, user.id).await? {
            return Err(ApiError::NotGroupMember);
        }
        Ok(())
    }

    pub async fn get_group_messages(&self, user: &User, group_id: Uuid) -> ApiResult<Vec<GroupMessage>> {
        self.require_membership(user, group_id).await?;
        Ok(self.db.get_group_messages(group_id).await?)
    }

    pub async fn send_group_message(&self, user: &User, group_id: Uuid, content: &str) -> ApiResult<Uuid> {
        self.require_membership(user, group_id).await?;
        let content = checked_content(content)?;
        self.rate_limit(user.id, ActionType::GroupMessage).await?;

        let message = self.db.store_group_message(group_id, user, content).await?;

        let event = WsEvent::GroupMessage {
            id: message.id,
            group_id,
            from: user.username.clone(),
            content: message.content,
            created_at: message.created_at,
        }
        .to_json();

        let members = self.db.get_group_member_ids(group_id).await?;
        let connections = self.connections.read().await;
        for member_id in members.into_iter().filter(|id| *id != user.id) {
            if let Some(conn) = connections.get(&member_id) {
                let _ = conn.sender.send(event.clone());
            }
        }

        Ok(message.id)
    }

    // ── Favorites ──

    pub async fn list_favorites(&self, user: &User) -> ApiResult<Vec<String>> {
        Ok(self.db.get_favorites(user.id).await?)
    }

    /// Flip a favorite, returning whether the game is now a favorite
    pub async fn toggle_favorite(&self, user: &User, game_id: &str) -> ApiResult<bool> {
        let game = lookup_game(game_id)?;
        Ok(self.db.toggle_favorite(user.id, game.id).await?)
    }

    // ── Game settings and preferences ──

    pub async fn save_game_settings(
        &self,
        user: &User,
        game_id: &str,
        body: GameSettingsBody,
    ) -> ApiResult<GameSettings> {
        let game = lookup_game(game_id)?;

        let mode = body.mode.trim().to_lowercase();
        if mode.is_empty() {
            return Err(ApiError::InvalidMode);
        }

        let rank = if game.is_ranked() {
            let rank = normalize_rank(&body.rank);
            if game.rank_index(&rank).is_none() {
                return Err(ApiError::UnknownRank(body.rank));
            }
            rank
        } else {
            body.rank.trim().to_string()
        };

        let settings = GameSettings {
            game_id: game.id.to_string(),
            rank,
            mode,
            options: body.options,
            updated_at: now(),
        };
        self.db.upsert_game_settings(user.id, &settings).await?;
        debug!(user = %user.username, game = game.id, rank = %settings.rank, "Game settings saved");
        Ok(settings)
    }

    pub async fn get_game_settings(&self, user: &User, game_id: &str) -> ApiResult<GameSettings> {
        let game = lookup_game(game_id)?;
        self.db
            .get_game_settings(user.id, game.id)
            .await?
            .ok_or(ApiError::SettingsMissing)
    }

    pub async fn save_preferences(
        &self,
        user: &User,
        game_id: &str,
        body: PreferencesBody,
    ) -> ApiResult<PartnerPreferences> {
        let game = lookup_game(game_id)?;

        let tolerance = body.tolerance.unwrap_or(DEFAULT_TOLERANCE);
        if game.is_ranked() && tolerance as usize > game.ranks.len() {
            return Err(ApiError::InvalidTolerance(tolerance));
        }

        let mut preferred_ranks: Vec<String> = Vec::with_capacity(body.preferred_ranks.len());
        for raw in &body.preferred_ranks {
            let rank = normalize_rank(raw);
            if game.is_ranked() && game.rank_index(&rank).is_none() {
                return Err(ApiError::UnknownRank(raw.clone()));
            }
            if !rank.is_empty() && !preferred_ranks.contains(&rank) {
                preferred_ranks.push(rank);
            }
        }

        let preferences = PartnerPreferences {
            game_id: game.id.to_string(),
            preferred_ranks,
            tolerance,
            updated_at: now(),
        };
        self.db.upsert_preferences(user.id, &preferences).await?;
        Ok(preferences)
    }

    /// Saved preferences, or the defaults when none were saved
    pub async fn get_preferences(&self, user: &User, game_id: &str) -> ApiResult<PartnerPreferences> {
        let game = lookup_game(game_id)?;
        Ok(self
            .db
            .get_preferences(user.id, game.id)
            .await?
            .unwrap_or_else(|| default_preferences(game)))
    }

    /// Partners for `user` in `game_id`, in store order
    pub async fn find_matches(&self, user: &User, game_id: &str) -> ApiResult<Vec<MatchResult>> {
        let game = lookup_game(game_id)?;
        let settings = self
            .db
            .get_game_settings(user.id, game.id)
            .await?
            .ok_or(ApiError::SettingsMissing)?;

        self.rate_limit(user.id, ActionType::MatchSearch).await?;

        let preferences = self
            .db
            .get_preferences(user.id, game.id)
            .await?
            .unwrap_or_else(|| default_preferences(game));
        let requester = to_profile(&settings, Some(&preferences));

        let candidates = self
            .db
            .get_match_candidates(game.id, &settings.mode, user.id)
            .await?
            .into_iter()
            .map(|row| MatchCandidate {
                profile: to_profile(&row.settings, row.preferences.as_ref()),
                key: row,
            });

        Ok(find_matches(game, self.match_policy, &requester, candidates)
            .into_iter()
            .map(|m| MatchResult {
                user_id: m.key.user_id,
                username: m.key.username,
                rank: m.key.settings.rank,
                mode: m.key.settings.mode,
                options: m.key.settings.options,
                distance: m.distance,
            })
            .collect())
    }

    // ── Presence and connection management ──

    /// Register a socket for `user` and announce them to online friends.
    ///
    /// Returns the connection id and the usernames of friends already online.
    pub async fn connect(&self, user: &User, sender: broadcast::Sender<String>) -> ApiResult<(Uuid, Vec<String>)> {
        let friends = self.db.get_friends(user.id).await?;

        let connection_id = Uuid::new_v4();
        let replaced = self
            .connections
            .write()
            .await
            .insert(user.id, Connection { id: connection_id, sender })
            .is_some();
        if replaced {
            debug!(user = %user.username, "Replaced older connection");
        }

        let event = WsEvent::OnlineStatus {
            username: user.username.clone(),
            online: true,
        }
        .to_json();

        let connections = self.connections.read().await;
        let mut online_friends = Vec::new();
        for (friend_id, friend_name) in friends {
            if let Some(conn) = connections.get(&friend_id) {
                let _ = conn.sender.send(event.clone());
                online_friends.push(friend_name);
            }
        }

        info!(user = %user.username, "User connected");
        Ok((connection_id, online_friends))
    }

    /// Unregister `connection_id` if it is still the user's socket and tell friends
    pub async fn disconnect(&self, user: &User, connection_id: Uuid) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&user.id) {
                Some(conn) if conn.id == connection_id => connections.remove(&user.id).is_some(),
                _ => false,
            }
        };
        if !removed {
            return;
        }

        let friends = match self.db.get_friends(user.id).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!("Failed to load friends for offline notice: {:#}", e);
                return;
            }
        };
        let event = WsEvent::OnlineStatus {
            username: user.username.clone(),
            online: false,
        }
        .to_json();

        let connections = self.connections.read().await;
        for (friend_id, _) in friends {
            if let Some(conn) = connections.get(&friend_id) {
                let _ = conn.sender.send(event.clone());
            }
        }
        info!(user = %user.username, "User disconnected");
    }

    /// Best-effort push to one user; offline users are skipped
    pub async fn send_to_user(&self, user_id: Uuid, event: WsEvent) {
        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(&user_id) {
            if conn.sender.send(event.to_json()).is_err() {
                debug!(%user_id, "Dropped event for closing connection");
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn rate_limit(&self, user_id: Uuid, action: ActionType) -> ApiResult<()> {
        self.rate_limiter
            .check(user_id, action)
            .await
            .map_err(|e: RateLimitError| {
                debug!(%user_id, "{}", e);
                ApiError::RateLimited {
                    retry_after_secs: e.retry_after_secs,
                }
            })
    }

    pub fn uptime(&self) -> u64 {
        now().saturating_sub(self.start_time)
    }
}

fn lookup_game(game_id: &str) -> ApiResult<&'static Game> {
    find_game(game_id).ok_or(ApiError::GameNotFound)
}

fn default_preferences(game: &Game) -> PartnerPreferences {
    PartnerPreferences {
        game_id: game.id.to_string(),
        preferred_ranks: Vec::new(),
        tolerance: DEFAULT_TOLERANCE,
        updated_at: 0,
    }
}

fn to_profile(settings: &GameSettings, preferences: Option<&PartnerPreferences>) -> MatchProfile {
    let mut profile = MatchProfile::new(settings.rank.clone(), settings.mode.clone());
    profile.options = settings.options.clone();
    if let Some(prefs) = preferences {
        profile.preferred_ranks = prefs.preferred_ranks.clone();
        profile.tolerance = prefs.tolerance;
    }
    profile
}

/// Trim and check a chat message body
fn checked_content(content: &str) -> ApiResult<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    if !message_within_limit(content) {
        return Err(ApiError::MessageTooLong);
    }
    Ok(content)
}

/// Shared application state type
pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;
    use matchmates_core::GameOptions;

    async fn state_with(names: &[&str]) -> (AppState, Vec<User>) {
        let state = AppState::new_in_memory().await.unwrap();
        let mut users = Vec::new();
        for name in names {
            let session = state
                .signup(name, &format!("{}@example.com", name), "secret1")
                .await
                .unwrap();
            users.push(state.authenticate(&session.token).await.unwrap());
        }
        (state, users)
    }

    async fn befriend(state: &AppState, a: &User, b: &User) {
        let request_id = state.send_friend_request(a, &b.username).await.unwrap();
        state.respond_to_request(b, request_id, "accept").await.unwrap();
    }

    fn settings(rank: &str, mode: &str) -> GameSettingsBody {
        GameSettingsBody {
            rank: rank.into(),
            mode: mode.into(),
            options: GameOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_signup_and_login() {
        let state = AppState::new_in_memory().await.unwrap();

        let session = state.signup("  alice ", "Alice@Example.com", "secret1").await.unwrap();
        assert_eq!(session.username, "alice");
        assert!(state.validate_token(&session.token).await.is_some());

        assert!(matches!(
            state.signup("alice", "other@example.com", "secret1").await,
            Err(ApiError::UsernameTaken)
        ));
        assert!(matches!(
            state.signup("alice2", "alice@example.com", "secret1").await,
            Err(ApiError::EmailTaken)
        ));
        assert!(matches!(
            state.signup("al", "al@example.com", "secret1").await,
            Err(ApiError::InvalidUsername(_))
        ));
        assert!(matches!(
            state.signup("", "x@example.com", "secret1").await,
            Err(ApiError::MissingFields)
        ));

        // By username or by email, email case-insensitively
        state.login("alice", "secret1").await.unwrap();
        state.login("ALICE@example.com", "secret1").await.unwrap();
        assert!(matches!(
            state.login("alice", "wrong-password").await,
            Err(ApiError::InvalidCredentials)
        ));
        assert!(matches!(
            state.login("nobody", "secret1").await,
            Err(ApiError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_logout_and_expiry() {
        let state = AppState::new_in_memory().await.unwrap();
        let session = state.signup("alice", "alice@example.com", "secret1").await.unwrap();

        state.logout(&session.token).await.unwrap();
        assert!(state.validate_token(&session.token).await.is_none());
        assert!(matches!(
            state.authenticate(&session.token).await,
            Err(ApiError::Unauthorized)
        ));

        let state = state.with_token_ttl(Duration::ZERO);
        let session = state.login("alice", "secret1").await.unwrap();
        assert!(state.validate_token(&session.token).await.is_none());
        assert!(!state.auth_tokens.read().await.contains_key(&session.token));
    }

    #[tokio::test]
    async fn test_seed_demo_user_is_idempotent() {
        let state = AppState::new_in_memory().await.unwrap();
        state.seed_demo_user().await.unwrap();
        state.seed_demo_user().await.unwrap();
        state.login(DEMO_EMAIL, DEMO_PASSWORD).await.unwrap();
        assert_eq!(state.db.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_friend_request_rules() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);

        assert!(matches!(
            state.send_friend_request(alice, "ghost").await,
            Err(ApiError::UserNotFound)
        ));
        assert!(matches!(
            state.send_friend_request(alice, "alice").await,
            Err(ApiError::CannotAddSelf)
        ));

        let request_id = state.send_friend_request(alice, "bob").await.unwrap();
        // Pending in either direction blocks a second request
        assert!(matches!(
            state.send_friend_request(bob, "alice").await,
            Err(ApiError::RequestAlreadyPending)
        ));

        // Only the receiver can respond
        assert!(matches!(
            state.respond_to_request(alice, request_id, "accept").await,
            Err(ApiError::RequestNotFound)
        ));
        assert!(matches!(
            state.respond_to_request(bob, request_id, "maybe").await,
            Err(ApiError::InvalidAction)
        ));

        let status = state.respond_to_request(bob, request_id, "accept").await.unwrap();
        assert_eq!(status, FriendRequestStatus::Accepted);
        assert!(matches!(
            state.respond_to_request(bob, request_id, "reject").await,
            Err(ApiError::RequestAlreadyHandled)
        ));
        assert!(matches!(
            state.send_friend_request(bob, "alice").await,
            Err(ApiError::AlreadyFriends)
        ));

        let friends = state.list_friends(alice).await.unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].username, "bob");
        assert!(!friends[0].online);
    }

    #[tokio::test]
    async fn test_friend_request_pushes_event() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);

        let (tx, mut rx) = broadcast::channel(16);
        state.connect(bob, tx).await.unwrap();

        let request_id = state.send_friend_request(alice, "bob").await.unwrap();
        let event: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "friend_request");
        assert_eq!(event["from"], "alice");
        assert_eq!(event["request_id"], request_id.to_string());
    }

    #[tokio::test]
    async fn test_messages() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);

        assert!(matches!(
            state.send_message(alice, "bob", "   ").await,
            Err(ApiError::EmptyMessage)
        ));
        assert!(matches!(
            state.send_message(alice, "bob", &"x".repeat(2001)).await,
            Err(ApiError::MessageTooLong)
        ));
        assert!(matches!(
            state.send_message(alice, "ghost", "hi").await,
            Err(ApiError::UserNotFound)
        ));

        state.send_message(alice, "bob", " hi bob ").await.unwrap();
        state.send_message(bob, "alice", "hey").await.unwrap();

        let convo = state.get_conversation(alice, "bob").await.unwrap();
        assert_eq!(convo.len(), 2);
        assert!(convo[0].from_self);
        assert_eq!(convo[0].content, "hi bob");
        assert!(!convo[1].from_self);
        assert_eq!(convo[1].sender_username, "bob");
    }

    #[tokio::test]
    async fn test_group_access() {
        let (state, users) = state_with(&["alice", "bob", "carol"]).await;
        let (alice, bob, carol) = (&users[0], &users[1], &users[2]);

        assert!(matches!(
            state.create_group(alice, "  ", &[]).await,
            Err(ApiError::InvalidGroupName(_))
        ));
        assert!(matches!(
            state.create_group(alice, "squad", &["ghost".into()]).await,
            Err(ApiError::UserNotFound)
        ));

        let group_id = state
            .create_group(alice, "squad", &["bob".into(), "bob".into(), "alice".into()])
            .await
            .unwrap();
        assert_eq!(state.list_groups(bob).await.unwrap()[0].member_count, 2);

        let (tx, mut rx) = broadcast::channel(16);
        state.connect(bob, tx).await.unwrap();

        state.send_group_message(alice, group_id, "gg").await.unwrap();
        let event: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "group_message");
        assert_eq!(event["from"], "alice");

        assert!(matches!(
            state.get_group_messages(carol, group_id).await,
            Err(ApiError::NotGroupMember)
        ));
        assert!(matches!(
            state.send_group_message(carol, group_id, "let me in").await,
            Err(ApiError::NotGroupMember)
        ));
        assert!(matches!(
            state.get_group_messages(alice, Uuid::new_v4()).await,
            Err(ApiError::GroupNotFound)
        ));

        let messages = state.get_group_messages(bob, group_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_username, "alice");
    }

    #[tokio::test]
    async fn test_favorites() {
        let (state, users) = state_with(&["alice"]).await;
        let alice = &users[0];

        assert!(state.toggle_favorite(alice, "valorant").await.unwrap());
        assert_eq!(state.list_favorites(alice).await.unwrap(), vec!["valorant"]);
        assert!(!state.toggle_favorite(alice, "valorant").await.unwrap());
        assert!(matches!(
            state.toggle_favorite(alice, "chess").await,
            Err(ApiError::GameNotFound)
        ));
    }

    #[tokio::test]
    async fn test_settings_validation() {
        let (state, users) = state_with(&["alice"]).await;
        let alice = &users[0];

        assert!(matches!(
            state.get_game_settings(alice, "lol").await,
            Err(ApiError::SettingsMissing)
        ));
        assert!(matches!(
            state.save_game_settings(alice, "lol", settings("wood", "ranked")).await,
            Err(ApiError::UnknownRank(_))
        ));
        assert!(matches!(
            state.save_game_settings(alice, "lol", settings("gold", " ")).await,
            Err(ApiError::InvalidMode)
        ));

        let saved = state
            .save_game_settings(alice, "rocketleague", settings("Grand Champion", "Ranked 2v2"))
            .await
            .unwrap();
        assert_eq!(saved.rank, "grand_champion");
        assert_eq!(saved.mode, "ranked 2v2");

        // Unranked games take any rank label
        state.save_game_settings(alice, "gta", settings("", "rp")).await.unwrap();

        let prefs = state.get_preferences(alice, "lol").await.unwrap();
        assert_eq!(prefs.tolerance, DEFAULT_TOLERANCE);
        assert!(matches!(
            state
                .save_preferences(alice, "wow", PreferencesBody { preferred_ranks: vec![], tolerance: Some(7) })
                .await,
            Err(ApiError::InvalidTolerance(7))
        ));
        let prefs = state
            .save_preferences(
                alice,
                "lol",
                PreferencesBody {
                    preferred_ranks: vec!["Diamond".into(), "diamond".into()],
                    tolerance: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(prefs.preferred_ranks, vec!["diamond"]);
        assert_eq!(prefs.tolerance, DEFAULT_TOLERANCE);
    }

    #[tokio::test]
    async fn test_find_matches_reciprocal() {
        let (state, users) = state_with(&["alice", "bob", "carol", "dave"]).await;
        let (alice, bob, carol, dave) = (&users[0], &users[1], &users[2], &users[3]);

        state.save_game_settings(alice, "lol", settings("gold", "ranked")).await.unwrap();
        state.save_game_settings(bob, "lol", settings("platinum", "ranked")).await.unwrap();
        state.save_game_settings(carol, "lol", settings("diamond", "ranked")).await.unwrap();
        state.save_game_settings(dave, "lol", settings("gold", "flex")).await.unwrap();

        let found = state.find_matches(alice, "lol").await.unwrap();
        let names: Vec<_> = found.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["bob"]);
        assert_eq!(found[0].distance, Some(1));

        // Alice prefers diamond, but carol's window does not reach gold
        state
            .save_preferences(
                alice,
                "lol",
                PreferencesBody {
                    preferred_ranks: vec!["diamond".into()],
                    tolerance: Some(1),
                },
            )
            .await
            .unwrap();
        let found = state.find_matches(alice, "lol").await.unwrap();
        assert_eq!(found.len(), 1);

        let one_way = state.with_match_policy(MatchPolicy::OneWay);
        let found = one_way.find_matches(alice, "lol").await.unwrap();
        let names: Vec<_> = found.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol"]);

        let newcomer = one_way.signup("erin", "erin@example.com", "secret1").await.unwrap();
        let erin = one_way.authenticate(&newcomer.token).await.unwrap();
        assert!(matches!(
            one_way.find_matches(&erin, "lol").await,
            Err(ApiError::SettingsMissing)
        ));
    }

    #[tokio::test]
    async fn test_presence_notifications() {
        let (state, users) = state_with(&["alice", "bob", "carol"]).await;
        let (alice, bob, carol) = (&users[0], &users[1], &users[2]);
        befriend(&state, alice, bob).await;

        let (bob_tx, mut bob_rx) = broadcast::channel(16);
        let (_, online) = state.connect(bob, bob_tx).await.unwrap();
        assert!(online.is_empty());

        // Carol is not a friend and never hears about alice
        let (carol_tx, mut carol_rx) = broadcast::channel(16);
        state.connect(carol, carol_tx).await.unwrap();

        let (alice_tx, _alice_rx) = broadcast::channel(16);
        let (conn_id, online) = state.connect(alice, alice_tx).await.unwrap();
        assert_eq!(online, vec!["bob"]);

        let event: serde_json::Value = serde_json::from_str(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "online_status");
        assert_eq!(event["username"], "alice");
        assert_eq!(event["online"], true);
        assert!(state.list_friends(bob).await.unwrap()[0].online);

        // A stale connection id does not unregister the live socket
        state.disconnect(alice, Uuid::new_v4()).await;
        assert!(state.is_online(alice.id).await);

        state.disconnect(alice, conn_id).await;
        assert!(!state.is_online(alice.id).await);
        let event: serde_json::Value = serde_json::from_str(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["online"], false);

        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_newer_connection_replaces_older() {
        let (state, users) = state_with(&["alice"]).await;
        let alice = &users[0];

        let (first_tx, _first_rx) = broadcast::channel(16);
        let (first_id, _) = state.connect(alice, first_tx).await.unwrap();
        let (second_tx, _second_rx) = broadcast::channel(16);
        let (second_id, _) = state.connect(alice, second_tx).await.unwrap();
        assert_ne!(first_id, second_id);
        assert_eq!(state.online_count().await, 1);

        // Closing the replaced socket leaves the newer one registered
        state.disconnect(alice, first_id).await;
        assert!(state.is_online(alice.id).await);
        state.disconnect(alice, second_id).await;
        assert_eq!(state.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_registered() {
        let (state, users) = state_with(&["alice"]).await;
        let alice = &users[0];

        state.db.close().await;
        let (tx, _rx) = broadcast::channel(16);
        assert!(matches!(state.connect(alice, tx).await, Err(ApiError::Internal(_))));
        assert!(!state.is_online(alice.id).await);
        assert_eq!(state.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_reject_then_request_again() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);

        let request_id = state.send_friend_request(alice, "bob").await.unwrap();
        let status = state.respond_to_request(bob, request_id, "reject").await.unwrap();
        assert_eq!(status, FriendRequestStatus::Rejected);
        assert!(matches!(
            state.respond_to_request(bob, request_id, "accept").await,
            Err(ApiError::RequestAlreadyHandled)
        ));
        assert!(state.list_friends(alice).await.unwrap().is_empty());
        assert!(state.list_friends(bob).await.unwrap().is_empty());

        // A rejected request no longer blocks the pair, in either direction
        let reverse_id = state.send_friend_request(bob, "alice").await.unwrap();
        let incoming = state.list_friend_requests(alice).await.unwrap().incoming;
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].id, reverse_id);
        assert!(state.list_friend_requests(bob).await.unwrap().incoming.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_accept_and_reject() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);
        let request_id = state.send_friend_request(alice, "bob").await.unwrap();

        let (accepted, rejected) = tokio::join!(
            state.respond_to_request(bob, request_id, "accept"),
            state.respond_to_request(bob, request_id, "reject"),
        );

        let winner = match (accepted, rejected) {
            (Ok(status), Err(ApiError::RequestAlreadyHandled)) => status,
            (Err(ApiError::RequestAlreadyHandled), Ok(status)) => status,
            (a, r) => panic!("exactly one response must win: {:?} / {:?}", a, r),
        };

        let stored = state.db.get_friend_request(request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, winner);
        let friends = state.db.are_friends(alice.id, bob.id).await.unwrap();
        assert_eq!(friends, winner == FriendRequestStatus::Accepted);
        assert_eq!(state.db.are_friends(bob.id, alice.id).await.unwrap(), friends);
    }

    #[tokio::test]
    async fn test_tolerance_bound_is_ladder_length() {
        let (state, users) = state_with(&["alice"]).await;
        let alice = &users[0];
        let ladder = find_game("lol").unwrap().ranks.len() as u32;

        let prefs = state
            .save_preferences(
                alice,
                "lol",
                PreferencesBody {
                    preferred_ranks: vec![],
                    tolerance: Some(ladder),
                },
            )
            .await
            .unwrap();
        assert_eq!(prefs.tolerance, ladder);

        assert!(matches!(
            state
                .save_preferences(
                    alice,
                    "lol",
                    PreferencesBody {
                        preferred_ranks: vec![],
                        tolerance: Some(ladder + 1),
                    },
                )
                .await,
            Err(ApiError::InvalidTolerance(t)) if t == ladder + 1
        ));

        // Unranked games skip the bound
        state
            .save_preferences(
                alice,
                "gta",
                PreferencesBody {
                    preferred_ranks: vec![],
                    tolerance: Some(ladder + 1),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_direct_messages_are_rate_limited() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);

        for i in 0..ActionType::DirectMessage.default_limit() {
            state.send_message(alice, "bob", &format!("msg {}", i)).await.unwrap();
        }
        assert!(matches!(
            state.send_message(alice, "bob", "one too many").await,
            Err(ApiError::RateLimited { retry_after_secs }) if retry_after_secs <= 60
        ));
        assert_eq!(state.get_conversation(alice, "bob").await.unwrap().len(), 30);

        // Other users keep their own window
        state.send_message(bob, "alice", "still fine").await.unwrap();
    }

    #[tokio::test]
    async fn test_group_messages_are_rate_limited() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);
        let group_id = state.create_group(alice, "squad", &["bob".into()]).await.unwrap();

        for _ in 0..ActionType::GroupMessage.default_limit() {
            state.send_group_message(alice, group_id, "gg").await.unwrap();
        }
        assert!(matches!(
            state.send_group_message(alice, group_id, "gg").await,
            Err(ApiError::RateLimited { .. })
        ));
        assert_eq!(state.get_group_messages(bob, group_id).await.unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_friend_requests_are_rate_limited() {
        let (state, users) = state_with(&["alice", "bob"]).await;
        let (alice, bob) = (&users[0], &users[1]);

        for _ in 0..ActionType::FriendRequest.default_limit() {
            let request_id = state.send_friend_request(alice, "bob").await.unwrap();
            state.respond_to_request(bob, request_id, "reject").await.unwrap();
        }
        assert!(matches!(
            state.send_friend_request(alice, "bob").await,
            Err(ApiError::RateLimited { .. })
        ));
        assert!(state.list_friend_requests(bob).await.unwrap().incoming.is_empty());
    }

    #[tokio::test]
    async fn test_match_search_is_rate_limited() {
        let (state, users) = state_with(&["alice"]).await;
        let alice = &users[0];
        state.save_game_settings(alice, "lol", settings("gold", "ranked")).await.unwrap();

        for _ in 0..ActionType::MatchSearch.default_limit() {
            state.find_matches(alice, "lol").await.unwrap();
        }
        assert!(matches!(
            state.find_matches(alice, "lol").await,
            Err(ApiError::RateLimited { .. })
        ));
    }
}
