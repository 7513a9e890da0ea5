//! Route table and middleware stack

use crate::handlers::{
    create_group_handler, find_matches_handler, get_conversation_handler,
    get_group_messages_handler, get_preferences_handler, get_settings_handler, health_handler,
    list_favorites_handler, list_friend_requests_handler, list_friends_handler,
    list_games_handler, list_groups_handler, login_handler, logout_handler, me_handler,
    put_preferences_handler, put_settings_handler, respond_friend_request_handler,
    send_friend_request_handler, send_group_message_handler, send_message_handler,
    signup_handler, toggle_favorite_handler, ws_handler,
};
use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// (method, path, description) for every route, logged at startup
pub const ENDPOINTS: &[(&str, &str, &str)] = &[
    ("GET", "/health", "Health check"),
    ("POST", "/api/signup", "Create an account"),
    ("POST", "/api/login", "Log in by username or email"),
    ("POST", "/api/logout", "End the session"),
    ("GET", "/api/me", "Current user"),
    ("GET", "/api/friends", "Friends with presence"),
    ("POST", "/api/friends/request", "Send a friend request"),
    ("GET", "/api/friends/requests", "Pending requests"),
    ("POST", "/api/friends/requests/:id/:action", "Accept or reject"),
    ("GET", "/api/messages/:username", "Conversation history"),
    ("POST", "/api/messages", "Send a direct message"),
    ("POST", "/api/groups", "Create a group"),
    ("GET", "/api/groups", "List groups"),
    ("GET", "/api/groups/:id/messages", "Group history"),
    ("POST", "/api/groups/:id/messages", "Send to a group"),
    ("GET", "/api/games", "Game catalog (?q=)"),
    ("GET", "/api/favorites", "Favorite games"),
    ("POST", "/api/favorites/:game_id", "Toggle a favorite"),
    ("GET/PUT", "/api/games/:game_id/settings", "Rank and mode"),
    ("GET/PUT", "/api/games/:game_id/preferences", "Partner preferences"),
    ("GET", "/api/games/:game_id/matches", "Find partners"),
    ("WS", "/ws", "Presence and chat events (?token=)"),
];

/// Build the application router with all endpoints and middleware
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Accounts
        .route("/api/signup", post(signup_handler))
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/me", get(me_handler))
        // Friends
        .route("/api/friends", get(list_friends_handler))
        .route("/api/friends/request", post(send_friend_request_handler))
        .route("/api/friends/requests", get(list_friend_requests_handler))
        .route(
            "/api/friends/requests/:id/:action",
            post(respond_friend_request_handler),
        )
        // Messages
        .route("/api/messages", post(send_message_handler))
        .route("/api/messages/:username", get(get_conversation_handler))
        // Groups
        .route("/api/groups", post(create_group_handler).get(list_groups_handler))
        .route(
            "/api/groups/:id/messages",
            get(get_group_messages_handler).post(send_group_message_handler),
        )
        // Games
        .route("/api/games", get(list_games_handler))
        .route("/api/favorites", get(list_favorites_handler))
        .route("/api/favorites/:game_id", post(toggle_favorite_handler))
        .route(
            "/api/games/:game_id/settings",
            get(get_settings_handler).put(put_settings_handler),
        )
        .route(
            "/api/games/:game_id/preferences",
            get(get_preferences_handler).put(put_preferences_handler),
        )
        .route("/api/games/:game_id/matches", get(find_matches_handler))
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                ),
        )
}
