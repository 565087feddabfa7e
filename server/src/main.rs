use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use gatework_protocol::*;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::services::{ServeDir, ServeFile};
use uuid::Uuid;

mod game;
mod ranking;
#[cfg(test)]
mod tests;

use game::{Connections, Rooms, Tx};
use ranking::RankingStore;

// ==== knobs ====
const GRACE_PERIOD_SECS: u64 = 3; // how long a disconnected seat is held
const DEFAULT_PORT: u16 = 10000;

#[derive(Clone)]
struct AppState {
    /// roomId -> authoritative room state. One process-wide lock keeps every
    /// check-then-write sequence atomic across connections.
    rooms: Arc<Mutex<Rooms>>,
    /// playerId -> outbound channel of that player's live socket.
    connections: Arc<Mutex<Connections>>,
    /// playerId -> pending disconnect-removal task, aborted on rejoin.
    grace_timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    ranking: Arc<RankingStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ranking = RankingStore::new("./data/rankings.csv")?;
    let state = AppState {
        rooms: Arc::new(Mutex::new(HashMap::new())),
        connections: Arc::new(Mutex::new(HashMap::new())),
        grace_timers: Arc::new(Mutex::new(HashMap::new())),
        ranking: Arc::new(ranking),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/rooms", post(allocate_room))
        .route("/api/rooms/:room_id/join", post(allocate_player))
        .with_state(state.clone());
    let app = match resolve_static_dir() {
        Some(static_dir) => {
            println!("[API] serving static files from {}", static_dir.display());
            let index_file = static_dir.join("index.html");
            app.fallback_service(ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)))
        }
        None => app,
    };

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("server listening on ws://{addr}/ws");
    axum::serve(listener, app).await?;
    Ok(())
}

fn resolve_static_dir() -> Option<PathBuf> {
    let candidate = PathBuf::from("dist");
    candidate.join("index.html").is_file().then_some(candidate)
}

/* ---------------- HTTP surface ---------------- */

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// Issues a short shareable room id, re-rolling until it is unused.
async fn allocate_room(State(state): State<AppState>) -> impl IntoResponse {
    let room_id = {
        let rooms = state.rooms.lock();
        let mut rng = rand::thread_rng();
        loop {
            let candidate = format!("{:06}", rng.gen_range(0..1_000_000));
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        }
    };
    println!("[API] allocated room {room_id}");
    (StatusCode::CREATED, Json(json!({ "roomId": room_id })))
}

async fn allocate_player(Path(room_id): Path<String>) -> impl IntoResponse {
    let player_id = Uuid::new_v4().to_string();
    println!("[API] issued player {player_id} for room {room_id}");
    Json(json!({ "playerId": player_id }))
}

/* ---------------- WebSocket lifecycle ---------------- */

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (tx_out, mut rx_out) = mpsc::unbounded_channel::<ServerToClient>();
    tokio::spawn(async move {
        while let Some(msg) = rx_out.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("[WS] failed to serialize outbound message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Identity bound by the first successful joinRoom on this socket.
    let mut bound: Option<(String, String)> = None;

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientToServer>(&text) {
                Ok(cmd) => route_cmd(cmd, &state, &mut bound, &tx_out).await,
                Err(e) => {
                    eprintln!("[WS] dropping unparsable message: {e}");
                    let _ = tx_out.send(ServerToClient::Error {
                        message: "invalid message".into(),
                    });
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Runs for a clean close frame and an abrupt drop alike.
    if let Some((room_id, player_id)) = bound {
        release_connection(&state, &room_id, &player_id, &tx_out);
    }
}

/// Unregisters this socket's outbound channel and starts the grace period.
/// A newer socket may already have rebound the player id (reconnect before
/// the old transport noticed); then this socket owns nothing and must not
/// start a removal timer.
fn release_connection(state: &AppState, room_id: &str, player_id: &str, tx_out: &Tx) {
    {
        let mut connections = state.connections.lock();
        match connections.get(player_id) {
            Some(current) if current.same_channel(tx_out) => {
                connections.remove(player_id);
            }
            _ => return,
        }
    }
    start_grace_timer(state, room_id, player_id);
}

fn start_grace_timer(state: &AppState, room_id: &str, player_id: &str) {
    eprintln!("[GRACE] starting {GRACE_PERIOD_SECS}s grace period for player {player_id} in room {room_id}");
    let task_state = state.clone();
    let task_room = room_id.to_string();
    let task_player = player_id.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(GRACE_PERIOD_SECS)).await;
        eprintln!("[GRACE] grace period for {task_player} expired, removing from room {task_room}");
        {
            let mut rooms = task_state.rooms.lock();
            let connections = task_state.connections.lock();
            game::remove_player(&mut rooms, &connections, &task_room, &task_player);
        }
        task_state.grace_timers.lock().remove(&task_player);
    });
    if let Some(previous) = state
        .grace_timers
        .lock()
        .insert(player_id.to_string(), handle)
    {
        previous.abort();
    }
}

/* ---------------- message dispatch ---------------- */

async fn route_cmd(
    cmd: ClientToServer,
    state: &AppState,
    bound: &mut Option<(String, String)>,
    tx_out: &Tx,
) {
    match cmd {
        ClientToServer::JoinRoom { room_id, player_id } => {
            // A rejoin inside the grace window keeps the seat untouched.
            if let Some(timer) = state.grace_timers.lock().remove(&player_id) {
                timer.abort();
                eprintln!("[GRACE] player {player_id} reconnected within the grace period");
            }
            let joined = {
                let mut rooms = state.rooms.lock();
                let mut connections = state.connections.lock();
                connections.insert(player_id.clone(), tx_out.clone());
                match game::join_room(&mut rooms, &connections, &room_id, &player_id) {
                    Ok(()) => true,
                    Err(e) => {
                        eprintln!("[JOIN] rejected: {e}");
                        connections.remove(&player_id);
                        let _ = tx_out.send(ServerToClient::Error {
                            message: e.to_string(),
                        });
                        false
                    }
                }
            };
            if joined {
                *bound = Some((room_id, player_id));
            }
        }
        ClientToServer::StartGame {
            room_id,
            player_id,
            mode,
        } => {
            let mut rooms = state.rooms.lock();
            let connections = state.connections.lock();
            if let Err(e) = game::start_game(&mut rooms, &connections, &room_id, &player_id, mode) {
                eprintln!("[START] rejected: {e}");
                if e.should_report() {
                    let _ = tx_out.send(ServerToClient::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
        ClientToServer::PlayerInput {
            room_id,
            player_id,
            gate_id,
            input_value,
        } => {
            let mut rooms = state.rooms.lock();
            let connections = state.connections.lock();
            if let Err(e) = game::player_input(
                &mut rooms,
                &connections,
                &room_id,
                &player_id,
                &gate_id,
                input_value,
            ) {
                // Precondition violations deny silently; the shared state
                // the other players see is untouched.
                eprintln!("[INPUT] denied for {player_id}: {e}");
            }
        }
        ClientToServer::SelectGameMode {
            room_id,
            player_id,
            mode,
        } => {
            let mut rooms = state.rooms.lock();
            let connections = state.connections.lock();
            if let Err(e) =
                game::select_game_mode(&mut rooms, &connections, &room_id, &player_id, mode)
            {
                eprintln!("[MODE] denied for {player_id}: {e}");
            }
        }
        ClientToServer::RegisterScore {
            team_name,
            score,
            player_id,
        } => {
            if team_name.trim().is_empty() {
                eprintln!("[RANK] invalid registration from {player_id}: blank team name");
                let _ = tx_out.send(ServerToClient::Error {
                    message: "invalid score registration".into(),
                });
                return;
            }
            match state.ranking.append(&team_name, score, &player_id).await {
                Ok(()) => {
                    println!("[RANK] registered {score} for team {team_name} (player {player_id})");
                    let _ = tx_out.send(ServerToClient::ScoreRegistered { success: true });
                }
                Err(e) => {
                    eprintln!("[RANK] failed to append score for {player_id}: {e}");
                    let _ = tx_out.send(ServerToClient::Error {
                        message: "failed to register score".into(),
                    });
                }
            }
        }
    }
}
