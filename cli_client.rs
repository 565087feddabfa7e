use futures_util::{SinkExt, StreamExt};
use gatework_protocol::{ClientToServer, GameMode, GameState, ServerToClient};
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🧩 Gatework CLI Client");
    println!("======================");

    let room_id = prompt("Enter room id: ")?;
    if room_id.is_empty() {
        println!("❌ Room id cannot be empty");
        return Ok(());
    }
    let player_id = prompt("Enter your player id: ")?;
    if player_id.is_empty() {
        println!("❌ Player id cannot be empty");
        return Ok(());
    }

    let url = "ws://127.0.0.1:10000/ws";
    println!("🔗 Connecting to {}...", url);

    let (ws_stream, _) = connect_async(url).await?;
    println!("✅ Connected to server!");

    let (mut write, mut read) = ws_stream.split();

    let join_msg = ClientToServer::JoinRoom {
        room_id: room_id.clone(),
        player_id: player_id.clone(),
    };
    write
        .send(Message::Text(serde_json::to_string(&join_msg)?))
        .await?;
    println!("🚪 Joining room '{}'...", room_id);

    // Print everything the server pushes, as it arrives.
    tokio::spawn({
        let player_id = player_id.clone();
        async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(server_msg) = serde_json::from_str::<ServerToClient>(&text) {
                            handle_server_message(server_msg, &player_id);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        println!("🔌 Connection closed by server");
                        break;
                    }
                    Err(e) => {
                        println!("❌ WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    });

    println!("\n📋 Commands available:");
    println!("  start <tutorial|timeAttack|circuitPrediction> - start the game (host only)");
    println!("  mode <tutorial|timeAttack|circuitPrediction>  - record your mode preference");
    println!("  gate <gateId> <true|false>                    - resolve one of your gates");
    println!("  score <teamName> <points>                     - register the team score");
    println!("  quit                                          - exit");
    println!("\nType commands and press Enter:");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();

        if line == "quit" {
            break;
        }

        if let Some(msg) = parse_command(line, &room_id, &player_id) {
            write.send(Message::Text(serde_json::to_string(&msg)?)).await?;
        } else {
            println!("❓ Unknown command: {}", line);
        }
    }

    println!("👋 Goodbye!");
    Ok(())
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

fn handle_server_message(msg: ServerToClient, player_id: &str) {
    match msg {
        ServerToClient::JoinSuccess {
            room_id,
            player_id,
        } => {
            println!("🎯 Joined room {} as {}", room_id, player_id);
        }
        ServerToClient::RoomUpdate(state) => {
            print_game_state(&state, player_id);
        }
        ServerToClient::GameStart(state) => {
            println!("\n🏁 GAME START!");
            print_game_state(&state, player_id);
        }
        ServerToClient::GameStateUpdate(state) => {
            print_game_state(&state, player_id);
        }
        ServerToClient::RoundComplete { score_summary, .. } => {
            println!("\n🏆 ROUND COMPLETE!");
            println!("  Gates:       {}", score_summary.gate_correct_score);
            println!("  Final output: {}", score_summary.final_output_score);
            println!("  Bonus:       {}", score_summary.bonus_score);
            println!(
                "  Round score: {} (team total {})",
                score_summary.round_score, score_summary.total_score
            );
        }
        ServerToClient::NextRound(state) => {
            println!("\n➡️  Next round!");
            print_game_state(&state, player_id);
        }
        ServerToClient::GameEnd {
            final_team_score,
            is_tutorial_complete,
        } => {
            println!("\n🎉 GAME OVER! Final team score: {}", final_team_score);
            if is_tutorial_complete {
                println!("📖 Tutorial complete!");
            }
        }
        ServerToClient::ScoreRegistered { success } => {
            println!("📝 Score registered: {}", success);
        }
        ServerToClient::Error { message } => {
            println!("❌ Error: {}", message);
        }
    }
}

fn print_game_state(state: &GameState, player_id: &str) {
    println!("\n🧩 === ROOM STATE ===");
    println!("🏠 Room: {}", state.room_id);
    println!("🕹️  Status: {}", state.status);
    println!("🎰 Round: {}", state.round_count);
    println!("⭐ Team score: {}", state.team_score);

    println!("👥 Players ({}):", state.players.len());
    for player in &state.players {
        let host = if state.host_id.as_deref() == Some(player.player_id.as_str()) {
            " 👑 HOST"
        } else {
            ""
        };
        let me = if player.player_id == player_id { " (you)" } else { "" };
        println!("  {}P: {}{}{}", player.player_order, player.player_id, me, host);
    }

    if let Some(my_gates) = state.player_gate_assignments.get(player_id) {
        if !my_gates.is_empty() {
            println!("🔌 Your gates: {}", my_gates.join(", "));
        }
    }
    let mut signals: Vec<(&String, &Option<bool>)> = state.gate_values.iter().collect();
    signals.sort_by(|a, b| a.0.cmp(b.0));
    for (signal, value) in signals {
        let shown = match value {
            Some(v) => v.to_string(),
            None => "?".to_string(),
        };
        println!("  {} = {}", signal, shown);
    }
    println!("==================\n");
}

fn parse_command(input: &str, room_id: &str, player_id: &str) -> Option<ClientToServer> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    if parts.is_empty() {
        return None;
    }

    match parts[0].to_lowercase().as_str() {
        "start" => Some(ClientToServer::StartGame {
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            mode: parse_mode(parts.get(1)?)?,
        }),
        "mode" => Some(ClientToServer::SelectGameMode {
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            mode: parse_mode(parts.get(1)?)?,
        }),
        "gate" => Some(ClientToServer::PlayerInput {
            room_id: room_id.to_string(),
            player_id: player_id.to_string(),
            gate_id: parts.get(1)?.to_string(),
            input_value: parts.get(2)?.parse().ok()?,
        }),
        "score" => Some(ClientToServer::RegisterScore {
            team_name: parts.get(1)?.to_string(),
            score: parts.get(2)?.parse().ok()?,
            player_id: player_id.to_string(),
        }),
        _ => None,
    }
}

fn parse_mode(raw: &str) -> Option<GameMode> {
    match raw {
        "tutorial" => Some(GameMode::Tutorial),
        "timeAttack" => Some(GameMode::TimeAttack),
        "circuitPrediction" => Some(GameMode::CircuitPrediction),
        _ => None,
    }
}
