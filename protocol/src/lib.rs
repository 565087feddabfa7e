use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// ---- Game Modes ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum GameMode {
    Tutorial,
    TimeAttack,
    CircuitPrediction,
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Tutorial => write!(f, "tutorial"),
            GameMode::TimeAttack => write!(f, "timeAttack"),
            GameMode::CircuitPrediction => write!(f, "circuitPrediction"),
        }
    }
}

impl Default for GameMode {
    fn default() -> Self {
        GameMode::Tutorial
    }
}

/// ---- Room Status ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RoomStatus {
    Waiting,
    InProgress,
    Scoring,
    Ended,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomStatus::Waiting => write!(f, "waiting"),
            RoomStatus::InProgress => write!(f, "inProgress"),
            RoomStatus::Scoring => write!(f, "scoring"),
            RoomStatus::Ended => write!(f, "ended"),
        }
    }
}

/// ---- Circuits ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateKind {
    And,
    Or,
    Not,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateKind::And => write!(f, "AND"),
            GateKind::Or => write!(f, "OR"),
            GateKind::Not => write!(f, "NOT"),
        }
    }
}

/// A single gate: consumes the named input signals, produces the signal
/// named by its own id. `stage` orders gates so that a gate's inputs are
/// produced in an earlier stage (primary inputs carry no stage).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: GateKind,
    pub inputs: Vec<String>,
    pub stage: u32,
}

/// The two designated final-output signals of a circuit (carry and sum).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitOutputs {
    #[serde(rename = "C")]
    pub c: String,
    #[serde(rename = "S")]
    pub s: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Circuit {
    pub gates: Vec<Gate>,
    pub outputs: CircuitOutputs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpectedOutput {
    #[serde(rename = "C")]
    pub c: bool,
    #[serde(rename = "S")]
    pub s: bool,
}

/// One problem of a mode's sequence: a circuit, the boolean values driven
/// onto its primary inputs, and the final outputs the team must reach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub circuit: Circuit,
    pub input_assignments: HashMap<String, bool>,
    pub expected_output: ExpectedOutput,
    pub is_tutorial: bool,
}

/// ---- Gate evaluation ----
///
/// Returns `None` ("unresolved") as soon as any input is unresolved, so a
/// gate can only be judged once everything upstream of it has been solved.
/// NOT takes exactly one input; AND/OR take at least one. Arity abuse is a
/// data error in the problem table, logged and answered with `None` rather
/// than tearing the room down.
pub fn evaluate_gate(kind: GateKind, inputs: &[Option<bool>]) -> Option<bool> {
    let mut values = Vec::with_capacity(inputs.len());
    for input in inputs {
        values.push((*input)?);
    }
    match kind {
        GateKind::Not => {
            if values.len() != 1 {
                eprintln!("[EVAL] NOT expects exactly 1 input, got {}", values.len());
                return None;
            }
            Some(!values[0])
        }
        GateKind::And | GateKind::Or if values.is_empty() => {
            eprintln!("[EVAL] {} expects at least 1 input", kind);
            None
        }
        GateKind::And => Some(values.iter().all(|v| *v)),
        GateKind::Or => Some(values.iter().any(|v| *v)),
    }
}

/// ---- Players ----
///
/// The domain player is wire-safe: the live connection lives in the
/// server's connection registry keyed by `player_id`, never here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub player_id: String,
    pub player_order: usize,
}

/// Random seat order for a fresh round, then player_order reseated 1..=N.
pub fn shuffle_player_order(players: &mut Vec<Player>) {
    players.shuffle(&mut thread_rng());
    for (index, player) in players.iter_mut().enumerate() {
        player.player_order = index + 1;
    }
}

/// ---- Game State ----
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputLogEntry {
    pub player_id: String,
    pub gate_id: String,
    pub input_value: bool,
    pub is_correct: bool,
    /// Submission time, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub gate_correct_score: u32,
    pub final_output_score: u32,
    pub bonus_score: u32,
    pub round_score: u32,
    pub total_score: u32,
    pub is_final_output_correct: bool,
}

/// The authoritative state of one room. Fully serializable: broadcasts send
/// this struct as-is, there is nothing transport-shaped to strip first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub room_id: String,
    pub players: Vec<Player>,
    pub status: RoomStatus,
    pub host_id: Option<String>,
    pub mode: Option<GameMode>,
    /// Zero-based index into the mode's problem sequence; -1 until started.
    pub round_count: i32,
    pub team_score: u32,
    pub current_question: Problem,
    /// Every signal name (primary input or gate id) to its current value;
    /// `None` means unresolved.
    pub gate_values: HashMap<String, Option<bool>>,
    pub player_gate_assignments: HashMap<String, Vec<String>>,
    pub player_input_log: Vec<InputLogEntry>,
    pub player_choices: HashMap<String, GameMode>,
}

impl GameState {
    pub fn new(room_id: String, host_id: String, initial_question: Problem) -> Self {
        GameState {
            room_id,
            players: vec![],
            status: RoomStatus::Waiting,
            host_id: Some(host_id),
            mode: None,
            round_count: -1,
            team_score: 0,
            current_question: initial_question,
            gate_values: HashMap::new(),
            player_gate_assignments: HashMap::new(),
            player_input_log: vec![],
            player_choices: HashMap::new(),
        }
    }

    /// Load `question` and reset the per-round state: primary inputs take
    /// their assigned values, every gate output starts unresolved, and the
    /// input log is cleared.
    pub fn reset_round(&mut self, question: Problem) {
        self.gate_values = question
            .input_assignments
            .iter()
            .map(|(signal, value)| (signal.clone(), Some(*value)))
            .collect();
        for gate in &question.circuit.gates {
            self.gate_values.insert(gate.id.clone(), None);
        }
        self.current_question = question;
        self.player_input_log.clear();
    }

    pub fn all_gates_resolved(&self) -> bool {
        self.current_question
            .circuit
            .gates
            .iter()
            .all(|gate| matches!(self.gate_values.get(&gate.id), Some(Some(_))))
    }

    /// Reassign player_order to the contiguous 1..=N matching seat order.
    /// Run after every membership change.
    pub fn reseat(&mut self) {
        for (index, player) in self.players.iter_mut().enumerate() {
            player.player_order = index + 1;
        }
    }
}

/// ---- Problem catalog ----
///
/// The fixed problem table: a half adder evaluated under each of its four
/// input combinations. `C` is the carry output, `S` the sum.
pub fn half_adder_circuit() -> Circuit {
    Circuit {
        gates: vec![
            Gate {
                id: "gate1".into(),
                kind: GateKind::And,
                inputs: vec!["A".into(), "B".into()],
                stage: 1,
            },
            Gate {
                id: "gate2".into(),
                kind: GateKind::Or,
                inputs: vec!["A".into(), "B".into()],
                stage: 1,
            },
            Gate {
                id: "gate3".into(),
                kind: GateKind::Not,
                inputs: vec!["gate1".into()],
                stage: 2,
            },
            Gate {
                id: "gate4".into(),
                kind: GateKind::And,
                inputs: vec!["gate2".into(), "gate3".into()],
                stage: 3,
            },
        ],
        outputs: CircuitOutputs {
            c: "gate1".into(),
            s: "gate4".into(),
        },
    }
}

fn half_adder_problem(a: bool, b: bool, is_tutorial: bool) -> Problem {
    Problem {
        circuit: half_adder_circuit(),
        input_assignments: HashMap::from([("A".to_string(), a), ("B".to_string(), b)]),
        expected_output: ExpectedOutput {
            c: a && b,
            s: a != b,
        },
        is_tutorial,
    }
}

pub fn all_problems() -> Vec<Problem> {
    vec![
        half_adder_problem(false, false, true),
        half_adder_problem(false, true, true),
        half_adder_problem(true, false, false),
        half_adder_problem(true, true, true),
    ]
}

/// The ordered problem sequence a room walks for a given mode.
pub fn problems_for_mode(mode: GameMode) -> Vec<Problem> {
    match mode {
        GameMode::Tutorial => all_problems()
            .into_iter()
            .filter(|problem| problem.is_tutorial)
            .collect(),
        GameMode::TimeAttack | GameMode::CircuitPrediction => all_problems(),
    }
}

/// ---- Wire messages ----
///
/// Every message is `{"type": ..., "payload": ...}` with camelCase names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientToServer {
    JoinRoom {
        room_id: String,
        player_id: String,
    },
    StartGame {
        room_id: String,
        player_id: String,
        mode: GameMode,
    },
    PlayerInput {
        room_id: String,
        player_id: String,
        gate_id: String,
        input_value: bool,
    },
    SelectGameMode {
        room_id: String,
        player_id: String,
        mode: GameMode,
    },
    RegisterScore {
        team_name: String,
        score: u32,
        player_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerToClient {
    JoinSuccess {
        room_id: String,
        player_id: String,
    },
    RoomUpdate(GameState),
    GameStart(GameState),
    GameStateUpdate(GameState),
    RoundComplete {
        score_summary: ScoreSummary,
        player_input_log: Vec<InputLogEntry>,
        current_question: Problem,
        gate_values: HashMap<String, Option<bool>>,
    },
    NextRound(GameState),
    GameEnd {
        final_team_score: u32,
        is_tutorial_complete: bool,
    },
    ScoreRegistered {
        success: bool,
    },
    Error {
        message: String,
    },
}
