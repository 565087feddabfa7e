use chrono::Utc;
use gatework_protocol::*;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::mpsc;

pub const MIN_PLAYERS_TO_START: usize = 2;

pub type Tx = mpsc::UnboundedSender<ServerToClient>;
pub type Rooms = HashMap<String, GameState>;
pub type Connections = HashMap<String, Tx>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("only the host can start the game")]
    NotHost,
    #[error("at least 2 players are required to start")]
    NotEnoughPlayers,
    #[error("room is not waiting for a game to start")]
    AlreadyStarted,
    #[error("room is not in progress")]
    NotInProgress,
    #[error("gate {0} is not part of the current circuit")]
    UnknownGate(String),
    #[error("gate {0} is not assigned to this player")]
    NotAssigned(String),
    #[error("gate {0} is already resolved")]
    AlreadyResolved(String),
    #[error("no problems available for mode {0}")]
    EmptyProblemSet(GameMode),
}

impl GameError {
    /// Whether the offending client gets an explicit `error` reply. The
    /// rest are silent denials: logged, no state change, no reply.
    pub fn should_report(&self) -> bool {
        matches!(
            self,
            GameError::NotEnoughPlayers | GameError::EmptyProblemSet(_)
        )
    }
}

/// ---- broadcast ----

pub fn broadcast_room(connections: &Connections, room: &GameState, msg: &ServerToClient) {
    for player in &room.players {
        match connections.get(&player.player_id) {
            Some(tx) => {
                if tx.send(msg.clone()).is_err() {
                    eprintln!(
                        "[BROADCAST] room={} failed to send to {}",
                        room.room_id, player.player_id
                    );
                }
            }
            None => {
                // Seat preserved during a grace period; nothing to send to.
            }
        }
    }
}

fn send_to(connections: &Connections, player_id: &str, msg: ServerToClient) {
    if let Some(tx) = connections.get(player_id) {
        let _ = tx.send(msg);
    }
}

/// ---- gate assignment ----

/// Partitions the circuit's gates across the seated players: gates sorted
/// by ascending stage (stable, so early-stage work is handed out first),
/// then dealt round-robin starting from the first seat. Every player gets
/// an entry, possibly empty.
pub fn assign_gates(players: &[Player], gates: &[Gate]) -> HashMap<String, Vec<String>> {
    let mut assignments: HashMap<String, Vec<String>> = players
        .iter()
        .map(|player| (player.player_id.clone(), vec![]))
        .collect();

    let mut sorted_gates: Vec<&Gate> = gates.iter().collect();
    sorted_gates.sort_by_key(|gate| gate.stage);

    for (index, gate) in sorted_gates.iter().enumerate() {
        let player = &players[index % players.len()];
        if let Some(list) = assignments.get_mut(&player.player_id) {
            list.push(gate.id.clone());
        }
    }
    assignments
}

/// ---- join / reconnect ----

/// Create-or-join. The caller has already registered the connection under
/// `player_id` and cancelled any pending grace timer, so a known player id
/// is a reconnect: the seat, order and host role all survive untouched.
pub fn join_room(
    rooms: &mut Rooms,
    connections: &Connections,
    room_id: &str,
    player_id: &str,
) -> Result<(), GameError> {
    if !rooms.contains_key(room_id) {
        let initial_question = problems_for_mode(GameMode::Tutorial)
            .into_iter()
            .next()
            .ok_or(GameError::EmptyProblemSet(GameMode::Tutorial))?;
        eprintln!("[JOIN] new room {room_id} created with status: waiting");
        rooms.insert(
            room_id.to_string(),
            GameState::new(room_id.to_string(), player_id.to_string(), initial_question),
        );
    }
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| GameError::RoomNotFound(room_id.to_string()))?;

    if room.players.iter().any(|p| p.player_id == player_id) {
        eprintln!("[JOIN] player {player_id} reconnected to room {room_id}");
    } else {
        let player_order = room.players.len() + 1;
        room.players.push(Player {
            player_id: player_id.to_string(),
            player_order,
        });
        eprintln!("[JOIN] player {player_id} joined room {room_id} as {player_order}P");
    }

    send_to(
        connections,
        player_id,
        ServerToClient::JoinSuccess {
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
        },
    );
    // The snapshot carries the live question, gate values and scores, so a
    // mid-game rejoiner resumes from this broadcast alone.
    broadcast_room(connections, room, &ServerToClient::RoomUpdate(room.clone()));
    Ok(())
}

/// ---- game start ----

pub fn start_game(
    rooms: &mut Rooms,
    connections: &Connections,
    room_id: &str,
    player_id: &str,
    mode: GameMode,
) -> Result<(), GameError> {
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| GameError::RoomNotFound(room_id.to_string()))?;
    if room.host_id.as_deref() != Some(player_id) {
        return Err(GameError::NotHost);
    }
    if room.players.len() < MIN_PLAYERS_TO_START {
        return Err(GameError::NotEnoughPlayers);
    }
    if room.status != RoomStatus::Waiting {
        return Err(GameError::AlreadyStarted);
    }

    let questions = problems_for_mode(mode);
    let first_question = questions
        .into_iter()
        .next()
        .ok_or(GameError::EmptyProblemSet(mode))?;

    room.status = RoomStatus::InProgress;
    room.mode = Some(mode);
    room.round_count = 0;
    room.team_score = 0;

    shuffle_player_order(&mut room.players);
    room.player_gate_assignments = assign_gates(&room.players, &first_question.circuit.gates);
    room.reset_round(first_question);

    eprintln!(
        "[START] room={} mode={} players={} status={}",
        room.room_id,
        mode,
        room.players.len(),
        room.status
    );
    broadcast_room(connections, room, &ServerToClient::GameStart(room.clone()));
    Ok(())
}

/// ---- player input ----

/// One gate-resolution attempt. Every attempt is logged; only a correct one
/// writes the gate value, and a resolved gate never accepts a second
/// submission. When the last gate resolves the round is scored immediately.
pub fn player_input(
    rooms: &mut Rooms,
    connections: &Connections,
    room_id: &str,
    player_id: &str,
    gate_id: &str,
    input_value: bool,
) -> Result<(), GameError> {
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| GameError::RoomNotFound(room_id.to_string()))?;
    if room.status != RoomStatus::InProgress {
        return Err(GameError::NotInProgress);
    }
    let assigned = room
        .player_gate_assignments
        .get(player_id)
        .map(|gates| gates.iter().any(|id| id == gate_id))
        .unwrap_or(false);
    if !assigned {
        return Err(GameError::NotAssigned(gate_id.to_string()));
    }
    if let Some(Some(_)) = room.gate_values.get(gate_id) {
        return Err(GameError::AlreadyResolved(gate_id.to_string()));
    }
    let gate = room
        .current_question
        .circuit
        .gates
        .iter()
        .find(|gate| gate.id == gate_id)
        .ok_or_else(|| GameError::UnknownGate(gate_id.to_string()))?;

    let input_values: Vec<Option<bool>> = gate
        .inputs
        .iter()
        .map(|signal| room.gate_values.get(signal).copied().flatten())
        .collect();
    // Unresolved upstream signals make the expected output unknowable, so
    // the attempt counts as incorrect.
    let expected = evaluate_gate(gate.kind, &input_values);
    let is_correct = expected == Some(input_value);

    room.player_input_log.push(InputLogEntry {
        player_id: player_id.to_string(),
        gate_id: gate_id.to_string(),
        input_value,
        is_correct,
        timestamp: Utc::now().timestamp_millis(),
    });
    if is_correct {
        room.gate_values.insert(gate_id.to_string(), Some(input_value));
        eprintln!("[INPUT] {player_id} resolved {gate_id}={input_value} in room {room_id}");
    } else {
        eprintln!("[INPUT] {player_id} answered {gate_id}={input_value} incorrectly in room {room_id}");
    }

    broadcast_room(
        connections,
        room,
        &ServerToClient::GameStateUpdate(room.clone()),
    );

    if room.all_gates_resolved() {
        eprintln!(
            "[SCORE] all gates resolved for round {} in room {room_id}",
            room.round_count
        );
        room.status = RoomStatus::Scoring;
        score_and_advance(rooms, connections, room_id);
    }
    Ok(())
}

/// ---- round scoring ----

fn compute_score(room: &GameState) -> ScoreSummary {
    let correct_gates: HashSet<&str> = room
        .player_input_log
        .iter()
        .filter(|entry| entry.is_correct)
        .map(|entry| entry.gate_id.as_str())
        .collect();
    let gate_correct_score = 10 * correct_gates.len() as u32;

    let outputs = &room.current_question.circuit.outputs;
    let final_c = room.gate_values.get(&outputs.c).copied().flatten();
    let final_s = room.gate_values.get(&outputs.s).copied().flatten();
    let expected = room.current_question.expected_output;
    let is_final_output_correct = final_c == Some(expected.c) && final_s == Some(expected.s);
    let final_output_score = if is_final_output_correct { 50 } else { 0 };

    // Perfect means the latest submission for every gate was correct: a
    // wrong guess that was later corrected still costs the bonus.
    let all_gates_perfect = room.current_question.circuit.gates.iter().all(|gate| {
        room.player_input_log
            .iter()
            .rev()
            .find(|entry| entry.gate_id == gate.id)
            .map(|entry| entry.is_correct)
            .unwrap_or(false)
    });
    let bonus_score = if all_gates_perfect && is_final_output_correct {
        20
    } else {
        0
    };

    let round_score = gate_correct_score + final_output_score + bonus_score;
    ScoreSummary {
        gate_correct_score,
        final_output_score,
        bonus_score,
        round_score,
        total_score: room.team_score + round_score,
        is_final_output_correct,
    }
}

/// Score the finished round, then either load the next problem of the
/// room's mode or end the game and drop the room from the registry.
fn score_and_advance(rooms: &mut Rooms, connections: &Connections, room_id: &str) {
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };

    let summary = compute_score(room);
    room.team_score = summary.total_score;
    eprintln!(
        "[SCORE] room={} gates={} final={} bonus={} round={} total={}",
        room.room_id,
        summary.gate_correct_score,
        summary.final_output_score,
        summary.bonus_score,
        summary.round_score,
        summary.total_score
    );
    broadcast_room(
        connections,
        room,
        &ServerToClient::RoundComplete {
            score_summary: summary,
            player_input_log: room.player_input_log.clone(),
            current_question: room.current_question.clone(),
            gate_values: room.gate_values.clone(),
        },
    );

    room.round_count += 1;
    let questions = problems_for_mode(room.mode.unwrap_or_default());
    if let Some(next_question) = questions.into_iter().nth(room.round_count as usize) {
        shuffle_player_order(&mut room.players);
        room.player_gate_assignments = assign_gates(&room.players, &next_question.circuit.gates);
        room.reset_round(next_question);
        room.status = RoomStatus::InProgress;
        eprintln!(
            "[SCORE] room={} advancing to round {}",
            room.room_id, room.round_count
        );
        broadcast_room(connections, room, &ServerToClient::NextRound(room.clone()));
    } else {
        room.status = RoomStatus::Ended;
        eprintln!(
            "[SCORE] room={} finished with team score {}",
            room.room_id, room.team_score
        );
        broadcast_room(
            connections,
            room,
            &ServerToClient::GameEnd {
                final_team_score: room.team_score,
                is_tutorial_complete: room.current_question.is_tutorial,
            },
        );
        rooms.remove(room_id);
    }
}

/// ---- pre-game mode preference ----

pub fn select_game_mode(
    rooms: &mut Rooms,
    connections: &Connections,
    room_id: &str,
    player_id: &str,
    mode: GameMode,
) -> Result<(), GameError> {
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| GameError::RoomNotFound(room_id.to_string()))?;
    if room.status != RoomStatus::Waiting {
        return Err(GameError::AlreadyStarted);
    }
    room.player_choices.insert(player_id.to_string(), mode);
    eprintln!("[MODE] player {player_id} prefers {mode} in room {room_id}");
    broadcast_room(connections, room, &ServerToClient::RoomUpdate(room.clone()));
    Ok(())
}

/// ---- departure ----

/// Called when a disconnect grace period expires without a rejoin: frees
/// the seat, reseats the remaining players contiguously, hands the host
/// role to the first remaining player if needed, and deletes the room when
/// it emptied.
pub fn remove_player(
    rooms: &mut Rooms,
    connections: &Connections,
    room_id: &str,
    player_id: &str,
) {
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };
    let before = room.players.len();
    room.players.retain(|player| player.player_id != player_id);
    if room.players.len() == before {
        return;
    }
    eprintln!(
        "[LEAVE] player {player_id} removed from room {room_id}, remaining: {}",
        room.players.len()
    );

    if room.players.is_empty() {
        eprintln!("[LEAVE] room {room_id} is empty, deleting");
        rooms.remove(room_id);
        return;
    }

    if room.host_id.as_deref() == Some(player_id) {
        room.host_id = room.players.first().map(|p| p.player_id.clone());
        eprintln!(
            "[LEAVE] host left, new host of room {room_id}: {:?}",
            room.host_id
        );
    }
    room.reseat();
    broadcast_room(connections, room, &ServerToClient::RoomUpdate(room.clone()));
}
