//! # spygame
//!
//! A multi-agent engine for the "who is the impostor" social-deduction word
//! game. Several model-backed players each hold a secret word; all but a few
//! hold the same one. Players take turns describing their word, reflect on
//! what everyone said, and vote to eliminate the suspected outlier, round
//! after round until one side wins.
//!
//! The crate provides layered abstractions for:
//!
//! * **Game orchestration**: [`GameOrchestrator`] runs single games or whole
//!   batches, persists per-game records, and maintains the cross-game
//!   strategy cache.
//! * **Round control**: [`RoundController`] drives the phase state machine
//!   (description, voting, win check) over the shared game state and the
//!   per-player belief stores. Any single agent failure degrades to a
//!   documented fallback; a round always completes.
//! * **Concurrent fan-out**: [`PhaseExecutor`] runs one bounded, per-call
//!   timed agent task per player and hands results back in deterministic
//!   order for serial application.
//! * **Agent seams**: [`AgentProxy`] and [`ModelClient`] traits keep the
//!   model backend swappable; [`ModelAgentProxy`] renders prompts and
//!   salvages loose JSON replies.
//! * **Belief memory**: [`BeliefStore`] holds each player's descriptions,
//!   votes, and round-indexed analyses of every other player.
//! * **Strategy retrieval**: [`RetrievalCache`] keeps one-line strategies
//!   from past games, embedding-indexed and persisted across runs.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spygame::{GameConfig, GameOrchestrator, ModelAgentProxy};
//! # use spygame::ModelClient;
//! # async fn client() -> Arc<dyn ModelClient> { unimplemented!() }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! spygame::init_logger();
//!
//! let proxy = Arc::new(ModelAgentProxy::new(client().await));
//! let mut orchestrator = GameOrchestrator::new(GameConfig::default(), proxy, "runs");
//!
//! let summary = orchestrator.run_game().await?;
//! println!("{:?} won in round {}", summary.winner, summary.final_round);
//! # Ok(())
//! # }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications opt in to `RUST_LOG` driven diagnostics without the library
/// forcing a logging backend on them.
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

pub mod spygame;

// Re-exporting key items for easier external access.
pub use spygame::agent_proxy::{
    AgentCallError, AgentProxy, DescribeRequest, DescribeResult, ModelAgentProxy, ModelClient,
    ReflectRequest, ReflectResult, VoteRequest, VoteResult,
};
pub use spygame::belief::{
    Analysis, BeliefPhase, BeliefStore, Confidence, RoleGuess, SelfAnalysis, VoteRecord,
};
pub use spygame::executor::{PhaseExecutor, PhaseOutcome};
pub use spygame::orchestrator::{GameOrchestrator, OrchestratorError};
pub use spygame::round::{GameError, GameSummary, RoundController};
pub use spygame::state::{
    default_word_pairs, GameConfig, GameState, Phase, Player, PlayerId, Role, Winner, WordPair,
};
pub use spygame::strategy_cache::{
    cosine_similarity, CacheError, Embedder, HttpEmbedder, Reducer, RetrievalCache,
    StrategyCurator,
};
