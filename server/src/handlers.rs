//! HTTP and WebSocket handlers for the MatchMates server

use crate::auth::token_from_request;
use crate::db::now;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    CreateGroupBody, FriendRequestBody, GameSearchQuery, GameSettings, GameSettingsBody,
    GroupMessageBody, HealthResponse, LoginRequest, PartnerPreferences, PreferencesBody,
    SendMessageBody, SessionResponse, SignupRequest, User, WsClientMessage, WsEvent,
};
use crate::state::SharedState;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Params = Query<HashMap<String, String>>;

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime(),
        online_users: state.online_count().await,
    })
}

// ── Accounts ──

pub async fn signup_handler(
    State(state): State<SharedState>,
    body: Result<Json<SignupRequest>, JsonRejection>,
) -> ApiResult<Json<SessionResponse>> {
    let request = parse_body(body)?;
    let session = state
        .signup(&request.username, &request.email, &request.password)
        .await?;
    Ok(Json(session))
}

pub async fn login_handler(
    State(state): State<SharedState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<SessionResponse>> {
    let request = parse_body(body)?;
    let session = state.login(&request.identifier, &request.password).await?;
    info!("User logged in: {}", session.username);
    Ok(Json(session))
}

pub async fn logout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let token = token_from_request(&headers, &params).ok_or(ApiError::Unauthorized)?;
    state.authenticate(&token).await?;
    state.logout(&token).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn me_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
    })))
}

// ── Friends ──

pub async fn list_friends_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let friends = state.list_friends(&user).await?;
    Ok(Json(json!({ "friends": friends })))
}

pub async fn send_friend_request_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
    body: Result<Json<FriendRequestBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let request = parse_body(body)?;
    let request_id = state.send_friend_request(&user, &request.to_username).await?;
    Ok(Json(json!({ "ok": true, "request_id": request_id })))
}

pub async fn list_friend_requests_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let requests = state.list_friend_requests(&user).await?;
    Ok(Json(json!(requests)))
}

/// Accept or reject (POST /api/friends/requests/:id/:action)
pub async fn respond_friend_request_handler(
    State(state): State<SharedState>,
    Path((request_id, action)): Path<(String, String)>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let request_id = Uuid::parse_str(&request_id).map_err(|_| ApiError::RequestNotFound)?;
    let status = state.respond_to_request(&user, request_id, &action).await?;
    Ok(Json(json!({ "ok": true, "status": status })))
}

// ── Direct messages ──

pub async fn get_conversation_handler(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let messages = state.get_conversation(&user, &username).await?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn send_message_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let request = parse_body(body)?;
    if request.to_username.trim().is_empty() {
        return Err(ApiError::MissingFields);
    }
    let id = state
        .send_message(&user, &request.to_username, &request.content)
        .await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

// ── Groups ──

pub async fn create_group_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
    body: Result<Json<CreateGroupBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let request = parse_body(body)?;
    let group_id = state.create_group(&user, &request.name, &request.members).await?;
    Ok(Json(json!({ "ok": true, "group_id": group_id })))
}

pub async fn list_groups_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let groups = state.list_groups(&user).await?;
    Ok(Json(json!({ "groups": groups })))
}

pub async fn get_group_messages_handler(
    State(state): State<SharedState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let group_id = parse_group_id(&group_id)?;
    let messages = state.get_group_messages(&user, group_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn send_group_message_handler(
    State(state): State<SharedState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
    body: Result<Json<GroupMessageBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let group_id = parse_group_id(&group_id)?;
    let request = parse_body(body)?;
    let id = state.send_group_message(&user, group_id, &request.content).await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

// ── Games ──

/// Public catalog, optionally filtered by `?q=`
pub async fn list_games_handler(Query(query): Query<GameSearchQuery>) -> Json<Value> {
    let games = matchmates_core::search(&query.q);
    Json(json!({ "games": games }))
}

pub async fn list_favorites_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let favorites = state.list_favorites(&user).await?;
    Ok(Json(json!({ "favorites": favorites })))
}

pub async fn toggle_favorite_handler(
    State(state): State<SharedState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let favorite = state.toggle_favorite(&user, &game_id).await?;
    Ok(Json(json!({ "game_id": game_id, "favorite": favorite })))
}

pub async fn get_settings_handler(
    State(state): State<SharedState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<GameSettings>> {
    let user = current_user(&state, &headers, &params).await?;
    Ok(Json(state.get_game_settings(&user, &game_id).await?))
}

pub async fn put_settings_handler(
    State(state): State<SharedState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
    body: Result<Json<GameSettingsBody>, JsonRejection>,
) -> ApiResult<Json<GameSettings>> {
    let user = current_user(&state, &headers, &params).await?;
    let request = parse_body(body)?;
    Ok(Json(state.save_game_settings(&user, &game_id, request).await?))
}

pub async fn get_preferences_handler(
    State(state): State<SharedState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<PartnerPreferences>> {
    let user = current_user(&state, &headers, &params).await?;
    Ok(Json(state.get_preferences(&user, &game_id).await?))
}

pub async fn put_preferences_handler(
    State(state): State<SharedState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
    body: Result<Json<PreferencesBody>, JsonRejection>,
) -> ApiResult<Json<PartnerPreferences>> {
    let user = current_user(&state, &headers, &params).await?;
    let request = parse_body(body)?;
    Ok(Json(state.save_preferences(&user, &game_id, request).await?))
}

pub async fn find_matches_handler(
    State(state): State<SharedState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
    Query(params): Params,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers, &params).await?;
    let matches = state.find_matches(&user, &game_id).await?;
    debug!(user = %user.username, game = %game_id, found = matches.len(), "Match search");
    Ok(Json(json!({ "game_id": game_id, "matches": matches })))
}

/// Resolve the bearer token (header or `?token=`) to a user
async fn current_user(
    state: &SharedState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> ApiResult<User> {
    let token = token_from_request(headers, params).ok_or(ApiError::Unauthorized)?;
    state.authenticate(&token).await
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            debug!("Rejected request body: {}", rejection);
            Err(ApiError::MissingFields)
        }
    }
}

fn parse_group_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::GroupNotFound)
}

// ── WebSocket ──

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Params,
    State(state): State<SharedState>,
) -> Response {
    let user = match current_user(&state, &headers, &params).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    info!("WebSocket connection established for user: {}", user.username);
    ws.on_upgrade(move |socket| websocket_handler(socket, user, state))
}

async fn websocket_handler(socket: WebSocket, user: User, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = broadcast::channel::<String>(100);

    let (connection_id, online_friends) = match state.connect(&user, tx.clone()).await {
        Ok(registered) => registered,
        Err(err) => {
            warn!("Failed to register connection for {}: {}", user.username, err);
            let _ = sender
                .send(Message::Text(WsEvent::Error { error: err.to_string() }.to_json()))
                .await;
            return;
        }
    };
    let _ = tx.send(WsEvent::Hello { online_friends }.to_json());

    let outgoing_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    if sender.send(Message::Text(message)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Slow WebSocket consumer dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(WsClientMessage::Ping) => WsEvent::Pong { timestamp: now() },
                    Err(err) => {
                        debug!("Unrecognized WebSocket frame from {}: {}", user.username, err);
                        WsEvent::Error {
                            error: "invalid_message".to_string(),
                        }
                    }
                };
                if tx.send(reply.to_json()).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket closed for user: {}", user.username);
                break;
            }
            Ok(Message::Binary(_)) => {
                let _ = tx.send(
                    WsEvent::Error {
                        error: "invalid_message".to_string(),
                    }
                    .to_json(),
                );
            }
            // Protocol pings are answered by the transport
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!("WebSocket error for user {}: {}", user.username, err);
                break;
            }
        }
    }

    state.disconnect(&user, connection_id).await;
    outgoing_task.abort();
    debug!("WebSocket handler terminated for user: {}", user.username);
}
