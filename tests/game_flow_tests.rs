//! End-to-end game scenarios through the public API, using scripted agent
//! proxies and a deterministic embedder.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use spygame::{
    AgentCallError, AgentProxy, DescribeRequest, DescribeResult, Embedder, GameConfig,
    PlayerId, ReflectRequest, ReflectResult, RoleGuess, RoundController, VoteRequest,
    VoteResult, Winner, WordPair,
};

/// Votes are scripted per `(round, voter)`; rounds without a script entry
/// fall back to a self-referential (invalid) target, which the controller
/// replaces deterministically.
struct ScriptProxy {
    votes: HashMap<(u32, PlayerId), PlayerId>,
    seen_scores: Mutex<HashMap<PlayerId, f32>>,
}

impl ScriptProxy {
    fn new(votes: HashMap<(u32, PlayerId), PlayerId>) -> Self {
        Self {
            votes,
            seen_scores: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentProxy for ScriptProxy {
    async fn describe(&self, req: DescribeRequest) -> Result<DescribeResult, AgentCallError> {
        Ok(DescribeResult {
            text: format!("round {} hint from {}", req.round, req.player_id),
            thinking: String::new(),
        })
    }

    async fn reflect(&self, req: ReflectRequest) -> Result<ReflectResult, AgentCallError> {
        if let Some(score) = req.outlier_score {
            self.seen_scores.lock().await.insert(req.player_id, score);
        }
        Ok(ReflectResult::default())
    }

    async fn vote(&self, req: VoteRequest) -> Result<VoteResult, AgentCallError> {
        let target = self
            .votes
            .get(&(req.round, req.player_id))
            .copied()
            .unwrap_or(req.player_id);
        Ok(VoteResult {
            target,
            reason: "scripted".to_string(),
            thinking: String::new(),
        })
    }
}

/// One fixed unit direction per known word.
struct WordEmbedder;

#[async_trait]
impl Embedder for WordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        Ok(match text {
            "apple" => vec![1.0, 0.0, 0.0],
            "pear" => vec![0.0, 1.0, 0.0],
            _ => vec![0.0, 0.0, 1.0],
        })
    }
}

fn fast_config() -> GameConfig {
    GameConfig {
        call_timeout: Duration::from_secs(2),
        phase_deadline: Duration::from_secs(10),
        ..GameConfig::default()
    }
}

fn cycle_round(round: u32, votes: &mut HashMap<(u32, PlayerId), PlayerId>) {
    for voter in 1..=5u32 {
        let target = voter % 5 + 1;
        votes.insert((round, voter), target);
    }
}

#[tokio::test]
async fn majority_converges_on_the_outlier_by_round_three() {
    // Rounds 1 and 2 are perfect tie cycles; in round 3 everyone has figured
    // out player 5 and piles on.
    let mut votes = HashMap::new();
    cycle_round(1, &mut votes);
    cycle_round(2, &mut votes);
    for voter in 1..=4u32 {
        votes.insert((3, voter), 5);
    }
    votes.insert((3, 5), 1);

    let mut controller = RoundController::with_setup(
        fast_config(),
        Arc::new(ScriptProxy::new(votes)),
        None,
        Vec::new(),
        &[5],
        WordPair::new("apple", "pear"),
    )
    .expect("setup");

    let summary = controller.run().await;
    assert_eq!(summary.winner, Winner::Majority);
    assert_eq!(summary.final_round, 3);
    assert_eq!(summary.eliminations, 1);

    let (state, beliefs) = controller.into_parts();
    assert!(!state.player(5).unwrap().alive);
    // The elimination reached every surviving player's memory.
    for id in 1..=4u32 {
        let table = beliefs[&id].latest_other_analyses(3, &[5]);
        assert_eq!(table[&5].role_guess, RoleGuess::Eliminated);
    }
}

#[tokio::test]
async fn perpetual_ties_exhaust_the_round_cap() {
    let mut votes = HashMap::new();
    for round in 1..=6 {
        cycle_round(round, &mut votes);
    }
    let mut controller = RoundController::with_setup(
        fast_config(),
        Arc::new(ScriptProxy::new(votes)),
        None,
        Vec::new(),
        &[5],
        WordPair::new("apple", "pear"),
    )
    .expect("setup");

    let summary = controller.run().await;
    assert_eq!(summary.winner, Winner::Outlier);
    assert_eq!(summary.final_round, 6);
    assert_eq!(summary.eliminations, 0);
}

#[tokio::test]
async fn grounding_scores_single_out_the_different_word() {
    // One tied round so the game ends at the cap quickly with cap 1.
    let mut votes = HashMap::new();
    cycle_round(1, &mut votes);
    let mut config = fast_config();
    config.round_cap = 1;

    let proxy = Arc::new(ScriptProxy::new(votes));
    let mut controller = RoundController::with_setup(
        config,
        Arc::clone(&proxy) as Arc<dyn AgentProxy>,
        Some(Arc::new(WordEmbedder)),
        Vec::new(),
        &[5],
        WordPair::new("apple", "pear"),
    )
    .expect("setup");
    controller.run().await;

    let scores = proxy.seen_scores.lock().await;
    // Four players share "apple": three of their four neighbours agree, so
    // their oddness is 0.25. The "pear" holder is orthogonal to everyone.
    assert_eq!(scores[&5], 1.0);
    for id in 1..=4u32 {
        assert!((scores[&id] - 0.25).abs() < 1e-3);
    }
}

#[tokio::test]
async fn full_game_descriptions_accumulate_per_round() {
    let mut votes = HashMap::new();
    cycle_round(1, &mut votes);
    cycle_round(2, &mut votes);
    let mut config = fast_config();
    config.round_cap = 2;

    let mut controller = RoundController::with_setup(
        config,
        Arc::new(ScriptProxy::new(votes)),
        None,
        Vec::new(),
        &[5],
        WordPair::new("apple", "pear"),
    )
    .expect("setup");
    controller.run().await;

    let (_, beliefs) = controller.into_parts();
    // Two rounds with five speakers each, remembered by every player.
    for store in beliefs.values() {
        assert_eq!(store.descriptions().len(), 10);
        assert_eq!(
            store
                .descriptions()
                .iter()
                .filter(|d| d.round == 2)
                .count(),
            5
        );
    }
}
