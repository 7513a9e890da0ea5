//! Data models for the MatchMates server

use matchmates_core::GameOptions;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: u64,
}

/// Authentication token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: u64,
}

// ── Friends ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendRequestStatus::Pending => "pending",
            FriendRequestStatus::Accepted => "accepted",
            FriendRequestStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FriendRequestStatus::Pending),
            "accepted" => Some(FriendRequestStatus::Accepted),
            "rejected" => Some(FriendRequestStatus::Rejected),
            _ => None,
        }
    }
}

/// Directed friend proposal
#[derive(Debug, Clone, Serialize)]
pub struct FriendRequest {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub status: FriendRequestStatus,
    pub created_at: u64,
}

/// A confirmed friend as seen by the owner of the list
#[derive(Debug, Clone, Serialize)]
pub struct FriendInfo {
    pub id: Uuid,
    pub username: String,
    pub online: bool,
}

/// Pending request as listed to one of its two parties
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub id: Uuid,
    /// The other party's username
    pub username: String,
    pub created_at: u64,
}

#[derive(Debug, Serialize)]
pub struct FriendRequestsResponse {
    pub incoming: Vec<PendingRequest>,
    pub outgoing: Vec<PendingRequest>,
}

#[derive(Debug, Deserialize)]
pub struct FriendRequestBody {
    #[serde(default)]
    pub to_username: String,
}

// ── Messages ──

/// A direct message row
#[derive(Debug, Clone, Serialize)]
pub struct DirectMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub sender_username: String,
    pub content: String,
    pub created_at: u64,
}

/// A message rendered for the viewer of a conversation
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub from_self: bool,
    pub sender_username: String,
    pub content: String,
    pub created_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub to_username: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupMessageBody {
    #[serde(default)]
    pub content: String,
}

// ── Groups ──

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub id: Uuid,
    pub name: String,
    pub member_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMessage {
    pub id: Uuid,
    pub group_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub content: String,
    pub created_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupBody {
    #[serde(default)]
    pub name: String,
    /// Usernames of the initial members, the creator is added implicitly
    #[serde(default)]
    pub members: Vec<String>,
}

// ── Games ──

/// Saved per-game settings, insert-or-replace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSettings {
    pub game_id: String,
    pub rank: String,
    pub mode: String,
    pub options: GameOptions,
    pub updated_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct GameSettingsBody {
    #[serde(default)]
    pub rank: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub options: GameOptions,
}

/// Which partners a player is willing to play with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerPreferences {
    pub game_id: String,
    pub preferred_ranks: Vec<String>,
    pub tolerance: u32,
    pub updated_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct PreferencesBody {
    #[serde(default)]
    pub preferred_ranks: Vec<String>,
    pub tolerance: Option<u32>,
}

/// Another player's settings, as scanned by a match search
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub user_id: Uuid,
    pub username: String,
    pub settings: GameSettings,
    pub preferences: Option<PartnerPreferences>,
}

/// A partner returned by a match search
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub user_id: Uuid,
    pub username: String,
    pub rank: String,
    pub mode: String,
    pub options: GameOptions,
    pub distance: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GameSearchQuery {
    #[serde(default)]
    pub q: String,
}

// ── Auth ──

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub password: String,
}

/// Returned by signup and login
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user_id: Uuid,
    pub username: String,
    pub expires_at: u64,
}

// ── Generic responses ──

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub online_users: usize,
}

// ── WebSocket ──

/// Events pushed to connected clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    Hello {
        online_friends: Vec<String>,
    },
    OnlineStatus {
        username: String,
        online: bool,
    },
    NewMessage {
        id: Uuid,
        from: String,
        content: String,
        created_at: u64,
    },
    GroupMessage {
        id: Uuid,
        group_id: Uuid,
        from: String,
        content: String,
        created_at: u64,
    },
    FriendRequest {
        request_id: Uuid,
        from: String,
    },
    FriendAccept {
        request_id: Uuid,
        username: String,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        error: String,
    },
}

impl WsEvent {
    pub fn to_json(&self) -> String {
        // Serializing a plain enum of strings and numbers cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frames a client may send over the socket
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Ping,
}
