//! Round state machine: Init → Description → Voting → Check → {Description |
//! End}.
//!
//! The controller owns the [`GameState`] and every player's [`BeliefStore`]
//! and mutates them only between fan-outs, on its own task. Any single agent
//! failure degrades to a documented fallback (neutral description, first
//! eligible vote target, skipped belief update) so a round always completes.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::spygame::agent_proxy::{
    AgentProxy, DescribeRequest, ReflectRequest, VoteRequest,
};
use crate::spygame::belief::{BeliefPhase, BeliefStore, VoteRecord};
use crate::spygame::executor::{PhaseExecutor, PhaseOutcome};
use crate::spygame::state::{
    DescriptionEntry, EliminationRecord, GameConfig, GameState, Phase, Player, PlayerId, Role,
    Winner, WordPair,
};
use crate::spygame::strategy_cache::{cosine_similarity, Embedder};

/// Spoken for a player whose describe call failed; keeps the round moving
/// without leaking the word.
const FALLBACK_DESCRIPTION: &str = "It is something you come across in everyday life.";

/// Construction-time failures. Once a controller exists, a game always runs
/// to completion.
#[derive(Debug)]
pub enum GameError {
    InvalidConfig(String),
}

impl fmt::Display for GameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameError::InvalidConfig(msg) => write!(f, "invalid game config: {}", msg),
        }
    }
}

impl Error for GameError {}

/// Outcome of one finished game.
#[derive(Debug, Clone)]
pub struct GameSummary {
    pub game_id: String,
    pub winner: Winner,
    pub final_round: u32,
    pub eliminations: usize,
}

pub struct RoundController {
    state: GameState,
    beliefs: BTreeMap<PlayerId, BeliefStore>,
    proxy: Arc<dyn AgentProxy>,
    executor: PhaseExecutor,
    embedder: Option<Arc<dyn Embedder>>,
    strategy_notes: Vec<String>,
    config: GameConfig,
}

impl RoundController {
    /// Build a game with uniformly random outlier assignment and word pair.
    pub fn new(
        config: GameConfig,
        proxy: Arc<dyn AgentProxy>,
        embedder: Option<Arc<dyn Embedder>>,
        strategy_notes: Vec<String>,
    ) -> Result<Self, GameError> {
        let pair = config
            .word_pairs
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| GameError::InvalidConfig("no word pairs configured".to_string()))?;
        let mut ids: Vec<PlayerId> = (1..=config.num_players as PlayerId).collect();
        ids.shuffle(&mut rand::thread_rng());
        let outliers: Vec<PlayerId> = ids.iter().take(config.num_outliers).copied().collect();
        Self::with_setup(config, proxy, embedder, strategy_notes, &outliers, pair)
    }

    /// Deterministic construction with explicit outlier ids and word pair.
    /// Used for replays and scripted games.
    pub fn with_setup(
        config: GameConfig,
        proxy: Arc<dyn AgentProxy>,
        embedder: Option<Arc<dyn Embedder>>,
        strategy_notes: Vec<String>,
        outlier_ids: &[PlayerId],
        pair: WordPair,
    ) -> Result<Self, GameError> {
        if config.num_players < 3 {
            return Err(GameError::InvalidConfig(
                "need at least 3 players".to_string(),
            ));
        }
        if config.num_outliers == 0 || config.num_outliers >= config.num_players {
            return Err(GameError::InvalidConfig(format!(
                "{} outliers among {} players",
                config.num_outliers, config.num_players
            )));
        }
        if outlier_ids.len() != config.num_outliers {
            return Err(GameError::InvalidConfig(format!(
                "expected {} outlier ids, got {}",
                config.num_outliers,
                outlier_ids.len()
            )));
        }

        let all_ids: Vec<PlayerId> = (1..=config.num_players as PlayerId).collect();
        let players: Vec<Player> = all_ids
            .iter()
            .map(|&id| {
                if outlier_ids.contains(&id) {
                    Player::new(id, Role::Outlier, pair.outlier.clone())
                } else {
                    Player::new(id, Role::Majority, pair.majority.clone())
                }
            })
            .collect();

        let mut beliefs = BTreeMap::new();
        for &id in &all_ids {
            let mut store = BeliefStore::new(id);
            store.seed_initial(&all_ids);
            beliefs.insert(id, store);
        }

        let game_id = Uuid::new_v4().to_string();
        info!(
            "game {} starting: {} players, {} outlier(s), pair {}/{}",
            game_id, config.num_players, config.num_outliers, pair.majority, pair.outlier
        );

        let executor = PhaseExecutor::new(
            config.max_concurrency,
            config.call_timeout,
            config.phase_deadline,
        );

        Ok(Self {
            state: GameState::new(game_id, players),
            beliefs,
            proxy,
            executor,
            embedder,
            strategy_notes,
            config,
        })
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Drive the game to completion. Infallible by construction: every agent
    /// failure has a fallback and every round terminates.
    pub async fn run(&mut self) -> GameSummary {
        loop {
            match self.state.phase {
                Phase::Init => {
                    self.state.phase = Phase::Description;
                }
                Phase::Description => {
                    self.description_phase().await;
                    self.state.phase = Phase::Voting;
                }
                Phase::Voting => {
                    self.voting_phase().await;
                    self.state.phase = Phase::Check;
                }
                Phase::Check => {
                    self.check_phase().await;
                }
                Phase::End => break,
            }
        }
        // check_phase is the only transition into End and always latches a
        // winner first.
        debug_assert!(
            self.state.winner.is_some(),
            "End phase entered without a winner"
        );
        let winner = self.state.winner.unwrap_or(Winner::Outlier);
        GameSummary {
            game_id: self.state.game_id.clone(),
            winner,
            final_round: self.state.round,
            eliminations: self.state.elimination_history.len(),
        }
    }

    /// Surrender state and belief stores for persistence.
    pub fn into_parts(self) -> (GameState, BTreeMap<PlayerId, BeliefStore>) {
        (self.state, self.beliefs)
    }

    /// `1 - mean(cosine(my word, each other alive word))`, rounded to three
    /// decimals. Computed once per description phase; absent without an
    /// embedder or when embedding fails.
    async fn outlier_scores(&self) -> HashMap<PlayerId, f32> {
        let embedder = match &self.embedder {
            Some(e) => Arc::clone(e),
            None => return HashMap::new(),
        };
        let alive = self.state.alive_ids();
        let mut word_vectors: HashMap<PlayerId, Vec<f32>> = HashMap::new();
        let mut by_word: HashMap<String, Vec<f32>> = HashMap::new();
        for &id in &alive {
            let word = match self.state.player(id) {
                Some(p) => p.word.clone(),
                None => continue,
            };
            let vector = match by_word.get(&word) {
                Some(v) => v.clone(),
                None => match embedder.embed(&word).await {
                    Ok(v) => {
                        by_word.insert(word.clone(), v.clone());
                        v
                    }
                    Err(e) => {
                        warn!("word embedding failed, skipping grounding scores: {}", e);
                        return HashMap::new();
                    }
                },
            };
            word_vectors.insert(id, vector);
        }

        let mut scores = HashMap::new();
        for &id in &alive {
            let mine = match word_vectors.get(&id) {
                Some(v) => v,
                None => continue,
            };
            let others: Vec<f32> = alive
                .iter()
                .filter(|other| **other != id)
                .filter_map(|other| word_vectors.get(other))
                .map(|v| cosine_similarity(mine, v))
                .collect();
            if others.is_empty() {
                continue;
            }
            let mean = others.iter().sum::<f32>() / others.len() as f32;
            let score = ((1.0 - mean) * 1000.0).round() / 1000.0;
            scores.insert(id, score);
        }
        scores
    }

    /// Alive players speak in id order; each description is broadcast to all
    /// stores immediately and followed by a reflection fan-out over the other
    /// alive players.
    async fn description_phase(&mut self) {
        let round = self.state.round;
        let scores = self.outlier_scores().await;
        let speakers = self.state.alive_ids();
        info!("game {} round {} description phase", self.state.game_id, round);

        for speaker in speakers.clone() {
            let text = self.obtain_description(speaker, &speakers).await;
            self.state.current_descriptions.push(DescriptionEntry {
                round,
                player_id: speaker,
                text: text.clone(),
            });
            for &listener in &speakers {
                if let Some(store) = self.beliefs.get_mut(&listener) {
                    store.record_description(round, speaker, &text);
                }
            }
            self.reflection_fan_out(Some(speaker), BeliefPhase::DescriptionReflection, &scores)
                .await;
        }
    }

    async fn obtain_description(&self, speaker: PlayerId, order: &[PlayerId]) -> String {
        let word = self
            .state
            .player(speaker)
            .map(|p| p.word.clone())
            .unwrap_or_default();
        let store = &self.beliefs[&speaker];
        let round = self.state.round;
        let request = DescribeRequest {
            round,
            player_id: speaker,
            word,
            speaking_order: order.to_vec(),
            history: store.descriptions_before(round),
            current_round_descriptions: self.state.current_descriptions.clone(),
            self_belief: store.latest_self_analysis(round).cloned(),
            other_beliefs: store.latest_other_analyses(round, order),
            strategy_notes: self.strategy_notes.clone(),
        };

        let proxy = Arc::clone(&self.proxy);
        let mut outcomes = self
            .executor
            .fan_out(vec![(speaker, request)], move |_, req| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.describe(req).await }
            })
            .await;
        match outcomes.pop() {
            Some((_, PhaseOutcome::Present(result))) => result.text,
            _ => {
                warn!(
                    "player {} description fell back to neutral text",
                    speaker
                );
                FALLBACK_DESCRIPTION.to_string()
            }
        }
    }

    /// Concurrent reflection over alive players other than `speaker`
    /// (everyone, after a vote). Failed reflections leave that player's
    /// beliefs untouched.
    async fn reflection_fan_out(
        &mut self,
        speaker: Option<PlayerId>,
        phase: BeliefPhase,
        scores: &HashMap<PlayerId, f32>,
    ) {
        let round = self.state.round;
        let alive = self.state.alive_ids();
        let mut jobs = Vec::new();
        for &id in &alive {
            if Some(id) == speaker {
                continue;
            }
            let store = &self.beliefs[&id];
            let word = self
                .state
                .player(id)
                .map(|p| p.word.clone())
                .unwrap_or_default();
            jobs.push((
                id,
                ReflectRequest {
                    round,
                    player_id: id,
                    phase,
                    word,
                    speaker,
                    descriptions: store.descriptions().to_vec(),
                    votes: self.state.current_votes.clone(),
                    outlier_score: scores.get(&id).copied(),
                    prior_self: store.latest_self_analysis(round).cloned(),
                    prior_others: store.latest_other_analyses(round, &alive),
                    alive: alive.clone(),
                },
            ));
        }

        let proxy = Arc::clone(&self.proxy);
        let outcomes = self
            .executor
            .fan_out(jobs, move |_, req| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.reflect(req).await }
            })
            .await;

        for (id, outcome) in outcomes {
            if let PhaseOutcome::Present(result) = outcome {
                if let Some(store) = self.beliefs.get_mut(&id) {
                    store.record_analyses(round, phase, result.self_analysis, result.others);
                }
            }
        }
    }

    /// Concurrent voting, tally, and (on a unique plurality) elimination.
    /// Invalid or absent votes fall back to the first eligible target.
    async fn voting_phase(&mut self) {
        let round = self.state.round;
        let alive = self.state.alive_ids();
        info!("game {} round {} voting phase", self.state.game_id, round);

        for player in self.state.players.iter_mut() {
            player.votes_received = 0;
        }

        let mut jobs = Vec::new();
        for &voter in &alive {
            let store = &self.beliefs[&voter];
            let word = self
                .state
                .player(voter)
                .map(|p| p.word.clone())
                .unwrap_or_default();
            let eligible: Vec<PlayerId> = alive.iter().copied().filter(|id| *id != voter).collect();
            jobs.push((
                voter,
                VoteRequest {
                    round,
                    player_id: voter,
                    word,
                    eligible,
                    descriptions: store.descriptions().to_vec(),
                    self_belief: store.latest_self_analysis(round).cloned(),
                    other_beliefs: store.latest_other_analyses(round, &alive),
                    strategy_notes: self.strategy_notes.clone(),
                },
            ));
        }

        let proxy = Arc::clone(&self.proxy);
        let outcomes = self
            .executor
            .fan_out(jobs, move |_, req| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.vote(req).await }
            })
            .await;

        let mut records = Vec::new();
        for (voter, outcome) in outcomes {
            let eligible: Vec<PlayerId> = alive.iter().copied().filter(|id| *id != voter).collect();
            let (target, reason) = match outcome {
                PhaseOutcome::Present(v) if eligible.contains(&v.target) => (v.target, v.reason),
                PhaseOutcome::Present(v) => {
                    let fallback = match eligible.first() {
                        Some(id) => *id,
                        None => continue,
                    };
                    warn!(
                        "player {} voted for ineligible {}, falling back to {}",
                        voter, v.target, fallback
                    );
                    (fallback, "fallback: original target ineligible".to_string())
                }
                PhaseOutcome::Absent(err) => {
                    let fallback = match eligible.first() {
                        Some(id) => *id,
                        None => continue,
                    };
                    warn!(
                        "player {} vote unavailable ({}), falling back to {}",
                        voter, err, fallback
                    );
                    (fallback, "fallback: vote unavailable".to_string())
                }
            };
            records.push(VoteRecord {
                round,
                voter,
                target,
                reason,
            });
        }

        for record in &records {
            if let Some(player) = self.state.player_mut(record.target) {
                player.votes_received += 1;
            }
            if let Some(store) = self.beliefs.get_mut(&record.voter) {
                store.record_vote(record.clone());
            }
        }
        for &id in &alive {
            if let Some(store) = self.beliefs.get_mut(&id) {
                store.record_all_votes(round, records.clone());
            }
        }
        self.state.current_votes = records;

        self.resolve_elimination(round);
    }

    /// A unique plurality eliminates its target; a tie eliminates no one.
    fn resolve_elimination(&mut self, round: u32) {
        let top = self
            .state
            .players
            .iter()
            .filter(|p| p.alive)
            .map(|p| p.votes_received)
            .max()
            .unwrap_or(0);
        if top == 0 {
            return;
        }
        let leaders: Vec<PlayerId> = self
            .state
            .players
            .iter()
            .filter(|p| p.alive && p.votes_received == top)
            .map(|p| p.id)
            .collect();
        if leaders.len() != 1 {
            info!(
                "game {} round {} vote tied among {:?}, no elimination",
                self.state.game_id, round, leaders
            );
            return;
        }
        let target = leaders[0];
        let (role, votes) = match self.state.player_mut(target) {
            Some(p) => {
                p.alive = false;
                (p.role, p.votes_received)
            }
            None => return,
        };
        info!(
            "game {} round {} eliminated player {} ({:?}) with {} votes",
            self.state.game_id, round, target, role, votes
        );
        self.state.elimination_history.push(EliminationRecord {
            round,
            player_id: target,
            role,
            votes,
        });
        for store in self.beliefs.values_mut() {
            store.mark_eliminated(target);
        }
    }

    /// Win checks in order: no outliers alive, outlier parity, round cap.
    /// Otherwise a post-vote reflection runs and the next round begins.
    async fn check_phase(&mut self) {
        let (majority, outlier) = self.state.alive_counts();
        let winner = if outlier == 0 {
            Some(Winner::Majority)
        } else if outlier >= majority {
            Some(Winner::Outlier)
        } else if self.state.round >= self.config.round_cap {
            // The majority failed to converge before the cap.
            Some(Winner::Outlier)
        } else {
            None
        };

        if let Some(winner) = winner {
            info!(
                "game {} over in round {}: {:?} wins",
                self.state.game_id, self.state.round, winner
            );
            self.state.winner = Some(winner);
            self.state.game_over = true;
            self.state.phase = Phase::End;
            return;
        }

        self.reflection_fan_out(None, BeliefPhase::VotingReflection, &HashMap::new())
            .await;
        self.state.round += 1;
        self.state.current_descriptions.clear();
        self.state.current_votes.clear();
        self.state.phase = Phase::Description;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spygame::agent_proxy::{
        AgentCallError, DescribeResult, ReflectResult, VoteResult,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Proxy that votes by a fixed map and describes with canned text.
    struct ScriptedProxy {
        votes: HashMap<PlayerId, PlayerId>,
        hang_voter: Option<PlayerId>,
    }

    #[async_trait]
    impl AgentProxy for ScriptedProxy {
        async fn describe(
            &self,
            req: DescribeRequest,
        ) -> Result<DescribeResult, AgentCallError> {
            Ok(DescribeResult {
                text: format!("something about item {}", req.player_id),
                thinking: String::new(),
            })
        }

        async fn reflect(&self, _req: ReflectRequest) -> Result<ReflectResult, AgentCallError> {
            Ok(ReflectResult::default())
        }

        async fn vote(&self, req: VoteRequest) -> Result<VoteResult, AgentCallError> {
            if Some(req.player_id) == self.hang_voter {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            let target = self.votes.get(&req.player_id).copied().unwrap_or(0);
            Ok(VoteResult {
                target,
                reason: "scripted".to_string(),
                thinking: String::new(),
            })
        }
    }

    fn fast_config(num_players: usize) -> GameConfig {
        GameConfig {
            num_players,
            call_timeout: Duration::from_millis(100),
            phase_deadline: Duration::from_secs(5),
            ..GameConfig::default()
        }
    }

    fn controller(proxy: ScriptedProxy, num_players: usize, outliers: &[PlayerId]) -> RoundController {
        let mut config = fast_config(num_players);
        config.num_outliers = outliers.len();
        RoundController::with_setup(
            config,
            Arc::new(proxy),
            None,
            Vec::new(),
            outliers,
            WordPair::new("apple", "pear"),
        )
        .expect("valid setup")
    }

    #[tokio::test]
    async fn unanimous_vote_eliminates_outlier() {
        // Everyone piles onto player 5, the outlier.
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 1)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: None,
            },
            5,
            &[5],
        );
        let summary = c.run().await;
        assert_eq!(summary.winner, Winner::Majority);
        assert_eq!(summary.final_round, 1);
        let (state, beliefs) = c.into_parts();
        assert!(!state.player(5).unwrap().alive);
        assert!(beliefs[&1].is_eliminated(5));
        assert_eq!(state.elimination_history.len(), 1);
        assert_eq!(state.elimination_history[0].votes, 4);
    }

    #[tokio::test]
    async fn tie_eliminates_nobody_until_cap() {
        // A perfect vote cycle: everyone receives exactly one vote, forever.
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(1, 2), (2, 3), (3, 4), (4, 5), (5, 1)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: None,
            },
            5,
            &[5],
        );
        let summary = c.run().await;
        assert_eq!(summary.winner, Winner::Outlier);
        assert_eq!(summary.final_round, 6);
        assert_eq!(summary.eliminations, 0);
        let (state, _) = c.into_parts();
        assert!(state.players.iter().all(|p| p.alive));
    }

    #[tokio::test]
    async fn outlier_parity_wins() {
        // 4 players, 2 outliers. Majority eliminates one majority member by
        // mistake in round 1, leaving 1 majority vs 2 outliers.
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(1, 2), (2, 1), (3, 2), (4, 2)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: None,
            },
            4,
            &[3, 4],
        );
        let summary = c.run().await;
        assert_eq!(summary.winner, Winner::Outlier);
        assert_eq!(summary.final_round, 1);
    }

    #[tokio::test]
    async fn hanging_voter_falls_back_to_first_eligible() {
        // Player 1 never answers; its vote becomes the first eligible id (2),
        // joining 3 and 4's votes to eliminate player 2.
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(2, 5), (3, 2), (4, 2), (5, 2)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: Some(1),
            },
            5,
            &[2],
        );
        let summary = c.run().await;
        assert_eq!(summary.winner, Winner::Majority);
        let (state, _) = c.into_parts();
        assert!(!state.player(2).unwrap().alive);
        let fallback = state.current_votes.iter().find(|v| v.voter == 1).unwrap();
        assert_eq!(fallback.target, 2);
        assert!(fallback.reason.starts_with("fallback"));
    }

    #[tokio::test]
    async fn invalid_vote_target_falls_back() {
        // Player 1 votes for id 99 which does not exist.
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(1, 99), (2, 5), (3, 5), (4, 5), (5, 1)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: None,
            },
            5,
            &[5],
        );
        c.run().await;
        let (state, _) = c.into_parts();
        let vote = state.current_votes.iter().find(|v| v.voter == 1).unwrap();
        assert_eq!(vote.target, 2);
    }

    #[tokio::test]
    async fn vote_sum_is_conserved() {
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(1, 2), (2, 3), (3, 4), (4, 5), (5, 1)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: None,
            },
            5,
            &[5],
        );
        // One round only: run phases manually up to the tally.
        c.state.phase = Phase::Description;
        c.description_phase().await;
        c.voting_phase().await;
        let cast = c.state.current_votes.len();
        let received: u32 = c.state.players.iter().map(|p| p.votes_received).sum();
        assert_eq!(cast as u32, received);
        assert_eq!(cast, 5);
    }

    #[test]
    fn rejects_degenerate_configs() {
        let proxy = Arc::new(ScriptedProxy {
            votes: HashMap::new(),
            hang_voter: None,
        });
        let mut config = fast_config(5);
        config.num_outliers = 5;
        assert!(RoundController::new(config, proxy.clone(), None, Vec::new()).is_err());

        let mut config = fast_config(2);
        config.num_outliers = 1;
        assert!(RoundController::new(config, proxy, None, Vec::new()).is_err());
    }

    /// Reflects succeed with a fixed analysis of player 2 except for one
    /// player, whose reflect call always fails.
    struct FlakyReflectProxy {
        fail_for: PlayerId,
    }

    #[async_trait]
    impl AgentProxy for FlakyReflectProxy {
        async fn describe(
            &self,
            req: DescribeRequest,
        ) -> Result<DescribeResult, AgentCallError> {
            Ok(DescribeResult {
                text: format!("hint from {}", req.player_id),
                thinking: String::new(),
            })
        }

        async fn reflect(&self, req: ReflectRequest) -> Result<ReflectResult, AgentCallError> {
            if req.player_id == self.fail_for {
                return Err(AgentCallError::Transport("connection reset".to_string()));
            }
            let mut others = std::collections::BTreeMap::new();
            others.insert(
                2,
                crate::spygame::belief::Analysis {
                    word_guess: "apple".to_string(),
                    word_reason: "matches the hints".to_string(),
                    role_guess: crate::spygame::belief::RoleGuess::Majority,
                    role_reason: "consistent".to_string(),
                    confidence: crate::spygame::belief::Confidence::Medium,
                },
            );
            Ok(ReflectResult {
                self_analysis: Some(crate::spygame::belief::SelfAnalysis {
                    role_guess: crate::spygame::belief::RoleGuess::Majority,
                    role_reason: "my word fits".to_string(),
                    confidence: crate::spygame::belief::Confidence::Medium,
                    outlier_score: None,
                    grounding_consistency: None,
                }),
                others,
            })
        }

        async fn vote(&self, req: VoteRequest) -> Result<VoteResult, AgentCallError> {
            Ok(VoteResult {
                target: req.player_id % 5 + 1,
                reason: "cycle".to_string(),
                thinking: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn failed_reflect_leaves_that_store_untouched() {
        let mut config = fast_config(5);
        config.num_outliers = 1;
        let mut c = RoundController::with_setup(
            config,
            Arc::new(FlakyReflectProxy { fail_for: 1 }),
            None,
            Vec::new(),
            &[5],
            WordPair::new("apple", "pear"),
        )
        .expect("valid setup");
        c.state.phase = Phase::Description;
        c.description_phase().await;

        let (_, beliefs) = c.into_parts();
        // Player 1's reflects all failed: nothing beyond the round-0 seeds.
        let untouched = beliefs[&1].latest_other_analyses(1, &[2]);
        assert_eq!(
            untouched[&2].role_guess,
            crate::spygame::belief::RoleGuess::Unknown
        );
        assert_eq!(untouched[&2].word_guess, "unknown");
        assert!(beliefs[&1].latest_self_analysis(1).is_none());

        // A sibling's store took the round-1 reflection as usual.
        let updated = beliefs[&3].latest_other_analyses(1, &[2]);
        assert_eq!(updated[&2].word_guess, "apple");
        assert!(beliefs[&3].latest_self_analysis(1).is_some());
    }

    #[tokio::test]
    async fn descriptions_reach_every_store() {
        let votes: HashMap<PlayerId, PlayerId> =
            vec![(1, 2), (2, 3), (3, 4), (4, 5), (5, 1)].into_iter().collect();
        let mut c = controller(
            ScriptedProxy {
                votes,
                hang_voter: None,
            },
            5,
            &[5],
        );
        c.state.phase = Phase::Description;
        c.description_phase().await;
        let (_, beliefs) = c.into_parts();
        for store in beliefs.values() {
            assert_eq!(store.descriptions().len(), 5);
        }
    }
}
