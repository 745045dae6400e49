//! Core game data model: players, phases, the shared [`GameState`] and the
//! [`GameConfig`] threaded into the orchestrator at construction.
//!
//! `GameState` is created once per game and mutated only by the round
//! controller, always on a single thread after a phase's fan-in completes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spygame::belief::VoteRecord;

/// Stable player identifier, unique for the lifetime of a game.
pub type PlayerId = u32;

/// Hidden role class. The outlier holds the semantically-different word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Majority,
    Outlier,
}

/// Round phases driven by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Description,
    Voting,
    Check,
    End,
}

/// Which side won the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Majority,
    Outlier,
}

/// One majority/outlier word pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordPair {
    pub majority: String,
    pub outlier: String,
}

impl WordPair {
    pub fn new(majority: impl Into<String>, outlier: impl Into<String>) -> Self {
        Self {
            majority: majority.into(),
            outlier: outlier.into(),
        }
    }
}

/// Built-in word pairs used when the configuration does not supply its own.
///
/// This is an explicit config default rather than ambient module state;
/// callers override it through [`GameConfig::word_pairs`].
pub fn default_word_pairs() -> Vec<WordPair> {
    vec![
        WordPair::new("apple", "pear"),
        WordPair::new("milk", "soy milk"),
        WordPair::new("steamed bun", "dumpling"),
        WordPair::new("eyebrow", "eyelash"),
        WordPair::new("doctor", "nurse"),
        WordPair::new("rose", "tulip"),
        WordPair::new("cookie", "potato chip"),
        WordPair::new("watermelon", "cantaloupe"),
    ]
}

/// A single player's public state.
///
/// `alive` only ever transitions true → false. `votes_received` is reset at
/// the start of every voting phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub role: Role,
    pub word: String,
    pub alive: bool,
    pub votes_received: u32,
}

impl Player {
    pub fn new(id: PlayerId, role: Role, word: impl Into<String>) -> Self {
        Self {
            id,
            name: format!("PLAYER{}", id),
            role,
            word: word.into(),
            alive: true,
            votes_received: 0,
        }
    }
}

/// One description spoken during a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionEntry {
    pub round: u32,
    pub player_id: PlayerId,
    pub text: String,
}

/// Append-only record of an elimination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EliminationRecord {
    pub round: u32,
    pub player_id: PlayerId,
    pub role: Role,
    pub votes: u32,
}

/// Authoritative shared game state, owned by the round controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub game_id: String,
    pub round: u32,
    pub phase: Phase,
    pub players: Vec<Player>,
    pub current_descriptions: Vec<DescriptionEntry>,
    pub current_votes: Vec<VoteRecord>,
    pub elimination_history: Vec<EliminationRecord>,
    pub winner: Option<Winner>,
    pub game_over: bool,
}

impl GameState {
    pub fn new(game_id: impl Into<String>, players: Vec<Player>) -> Self {
        Self {
            game_id: game_id.into(),
            round: 1,
            phase: Phase::Init,
            players,
            current_descriptions: Vec::new(),
            current_votes: Vec::new(),
            elimination_history: Vec::new(),
            winner: None,
            game_over: false,
        }
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn player_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    /// Alive player ids in fixed (id) order — the deterministic speaking and
    /// fan-out order used by every phase.
    pub fn alive_ids(&self) -> Vec<PlayerId> {
        self.players
            .iter()
            .filter(|p| p.alive)
            .map(|p| p.id)
            .collect()
    }

    /// `(majority, outlier)` counts among alive players.
    pub fn alive_counts(&self) -> (usize, usize) {
        let mut majority = 0;
        let mut outlier = 0;
        for p in self.players.iter().filter(|p| p.alive) {
            match p.role {
                Role::Majority => majority += 1,
                Role::Outlier => outlier += 1,
            }
        }
        (majority, outlier)
    }
}

/// Tunable parameters for a game, passed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub num_players: usize,
    pub num_outliers: usize,
    /// Round ceiling; reaching it without a majority win counts as an
    /// outlier win (the majority failed to converge).
    pub round_cap: u32,
    /// Per agent-call timeout inside a fan-out.
    pub call_timeout: Duration,
    /// Upper bound on the total wait for one fan-out to complete.
    pub phase_deadline: Duration,
    /// Cap on concurrently running agent calls within a fan-out.
    pub max_concurrency: usize,
    pub enable_strategy_cache: bool,
    pub word_pairs: Vec<WordPair>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            num_players: 5,
            num_outliers: 1,
            round_cap: 6,
            call_timeout: Duration::from_secs(120),
            phase_deadline: Duration::from_secs(600),
            max_concurrency: 8,
            enable_strategy_cache: false,
            word_pairs: default_word_pairs(),
        }
    }
}
