//! HTTP surface
//!
//! Thin wrapper around the repository for room CRUD, plus the WebSocket
//! upgrade that hands each connection to the router's join protocol. The
//! front-end lives elsewhere; everything here speaks JSON (room creation
//! also accepts form posts and answers with a redirect).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Request, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, RequestExt};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use huddle_core::{Phase, Role, Room, Status, User};

use crate::connection::Client;
use crate::identity::Identity;
use crate::router::Router;

pub fn app(router: Arc<Router>) -> axum::Router {
    axum::Router::new()
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/{id}", get(get_room).delete(delete_room))
        .route("/ws/{id}", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(router)
}

type AppResult<T> = Result<T, AppError>;

/// Repository failures surface as a 500; expected outcomes (403, 404) are
/// built inline by the handlers.
struct AppError(huddle_core::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Something went wrong: {}", self.0),
        )
            .into_response()
    }
}

impl From<huddle_core::Error> for AppError {
    fn from(err: huddle_core::Error) -> Self {
        Self(err)
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "room not found"})),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct RoomSummary {
    id: Uuid,
    name: String,
    phase: Phase,
    votes_per_user: u32,
    owner_id: String,
    created_at: DateTime<Utc>,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            phase: room.phase,
            votes_per_user: room.votes_per_user,
            owner_id: room.owner_id.clone(),
            created_at: room.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateRoomRequest {
    name: String,
    votes_per_user: u32,
}

fn room_defaults(req: CreateRoomRequest) -> (String, u32) {
    let name = if req.name.trim().is_empty() {
        "Retrospective".to_string()
    } else {
        req.name
    };
    let votes_per_user = if req.votes_per_user == 0 {
        3
    } else {
        req.votes_per_user
    };
    (name, votes_per_user)
}

async fn create_room(
    State(router): State<Arc<Router>>,
    Identity(user): Identity,
    request: Request,
) -> AppResult<Response> {
    let wants_json = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));
    let json_body = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.starts_with("application/json"));

    let req: CreateRoomRequest = if json_body {
        match request.extract::<Json<CreateRoomRequest>, _>().await {
            Ok(Json(req)) => req,
            Err(rejection) => return Ok(rejection.into_response()),
        }
    } else {
        match request.extract::<Form<CreateRoomRequest>, _>().await {
            Ok(Form(req)) => req,
            Err(rejection) => return Ok(rejection.into_response()),
        }
    };

    let (name, votes_per_user) = room_defaults(req);
    let mut room = Room::new(name, user.id.clone(), votes_per_user);
    room.add_participant(user, Role::Owner, Status::Approved);
    router.repo.create(&room)?;
    let summary = RoomSummary::from(&room);
    router.registry.insert(room).await;

    if wants_json {
        Ok((StatusCode::CREATED, Json(summary)).into_response())
    } else {
        Ok(Redirect::to(&format!("/rooms/{}", summary.id)).into_response())
    }
}

async fn list_rooms(
    State(router): State<Arc<Router>>,
    Identity(user): Identity,
) -> AppResult<Json<Vec<RoomSummary>>> {
    let rooms = router.repo.list_by_participant(&user.id)?;
    Ok(Json(rooms.iter().map(RoomSummary::from).collect()))
}

async fn get_room(
    State(router): State<Arc<Router>>,
    Identity(user): Identity,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let Some(room_ref) = router.registry.get(id).await? else {
        return Ok(not_found());
    };

    let mut room = room_ref.write().await;
    if !room.is_member(&user.id) {
        // first contact through the page: remember the caller so the
        // moderators see them waiting even before the socket opens
        let status = if room.auto_approve {
            Status::Approved
        } else {
            Status::Pending
        };
        room.add_participant(user, Role::Participant, status);
        let snapshot = room.clone();
        drop(room);
        router.repo.update(&snapshot)?;
        return Ok(Json(RoomSummary::from(&snapshot)).into_response());
    }
    let summary = RoomSummary::from(&*room);
    Ok(Json(summary).into_response())
}

async fn delete_room(
    State(router): State<Arc<Router>>,
    Identity(user): Identity,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let Some(room) = router.repo.get(id)? else {
        return Ok(not_found());
    };
    if room.owner_id != user.id {
        return Ok((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "only the room owner can delete it"})),
        )
            .into_response());
    }
    router.repo.delete(id)?;
    router.registry.evict(id).await;
    Ok(Json(json!({"message": "room deleted"})).into_response())
}

async fn ws_upgrade(
    State(router): State<Arc<Router>>,
    Identity(user): Identity,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    if router.registry.get(id).await?.is_none() {
        return Ok(not_found());
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, router, id, user)))
}

/// Runs the two connection tasks: a writer draining the client's bounded
/// outbound queue, and this task reading inbound frames for the router.
async fn handle_socket(socket: WebSocket, router: Arc<Router>, room_id: Uuid, user: User) {
    let (mut sink, mut stream) = socket.split();
    let (client, mut rx) = Client::new(user.id.clone(), room_id);

    router.hub.register(client.clone()).await;
    router.join(&client, &user).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => router.handle_frame(&client, text.as_str()).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    router.leave(&client).await;
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
