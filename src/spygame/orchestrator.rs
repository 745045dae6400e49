//! Game orchestration: build a controller per game, persist results, and
//! maintain the cross-game strategy cache.
//!
//! The orchestrator is the single writer for everything that outlives one
//! game: the per-game records on disk and the retrieval cache, which is only
//! touched after a game has fully ended.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::spygame::agent_proxy::{AgentProxy, ModelClient};
use crate::spygame::belief::BeliefStore;
use crate::spygame::round::{GameError, GameSummary, RoundController};
use crate::spygame::state::{GameConfig, GameState, PlayerId};
use crate::spygame::strategy_cache::{CacheError, Embedder, RetrievalCache, StrategyCurator};

/// How many retrieved notes are fed into each game's prompts.
const RETRIEVAL_TOP_K: usize = 5;
/// The cache is refreshed from the curator after every Nth completed game.
const CACHE_UPDATE_FREQUENCY: usize = 5;

#[derive(Debug)]
pub enum OrchestratorError {
    Setup(GameError),
    Storage(std::io::Error),
    Encoding(serde_json::Error),
    Cache(CacheError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Setup(e) => write!(f, "game setup failed: {}", e),
            OrchestratorError::Storage(e) => write!(f, "storage failed: {}", e),
            OrchestratorError::Encoding(e) => write!(f, "record encoding failed: {}", e),
            OrchestratorError::Cache(e) => write!(f, "strategy cache failed: {}", e),
        }
    }
}

impl Error for OrchestratorError {}

impl From<GameError> for OrchestratorError {
    fn from(e: GameError) -> Self {
        OrchestratorError::Setup(e)
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Storage(e)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Encoding(e)
    }
}

impl From<CacheError> for OrchestratorError {
    fn from(e: CacheError) -> Self {
        OrchestratorError::Cache(e)
    }
}

pub struct GameOrchestrator {
    config: GameConfig,
    proxy: Arc<dyn AgentProxy>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Option<RetrievalCache>,
    curator: Option<StrategyCurator>,
    output_dir: PathBuf,
    games_completed: usize,
}

impl GameOrchestrator {
    pub fn new(
        config: GameConfig,
        proxy: Arc<dyn AgentProxy>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            proxy,
            embedder: None,
            cache: None,
            curator: None,
            output_dir: output_dir.into(),
            games_completed: 0,
        }
    }

    /// Enable the embedding-based grounding hints during games.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Enable cross-game strategy retrieval and curation.
    pub fn with_strategy_cache(
        mut self,
        cache: RetrievalCache,
        curator_client: Arc<dyn ModelClient>,
    ) -> Self {
        self.cache = Some(cache);
        self.curator = Some(StrategyCurator::new(curator_client));
        self
    }

    pub fn games_completed(&self) -> usize {
        self.games_completed
    }

    /// Play one game end to end: retrieve notes, run the controller, persist
    /// the records, and (on the update cadence) refresh the strategy cache.
    pub async fn run_game(&mut self) -> Result<GameSummary, OrchestratorError> {
        let notes = self.retrieve_notes().await;
        let mut controller = RoundController::new(
            self.config.clone(),
            Arc::clone(&self.proxy),
            self.embedder.clone(),
            notes.clone(),
        )?;
        let summary = controller.run().await;
        let (state, beliefs) = controller.into_parts();

        self.persist_game(&state, &beliefs)?;
        self.games_completed += 1;

        if self.games_completed % CACHE_UPDATE_FREQUENCY == 0 {
            self.refresh_cache(&notes, &state, &beliefs).await?;
        }

        info!(
            "game {} persisted ({:?} won in round {})",
            summary.game_id, summary.winner, summary.final_round
        );
        Ok(summary)
    }

    /// Play `n` games sequentially. A failing game is logged and skipped;
    /// the rest of the batch still runs.
    pub async fn run_batch(&mut self, n: usize) -> Vec<GameSummary> {
        let mut summaries = Vec::with_capacity(n);
        for i in 0..n {
            match self.run_game().await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("game {} of {} failed, continuing batch: {}", i + 1, n, e),
            }
        }
        summaries
    }

    async fn retrieve_notes(&self) -> Vec<String> {
        if !self.config.enable_strategy_cache {
            return Vec::new();
        }
        let cache = match &self.cache {
            Some(c) => c,
            None => return Vec::new(),
        };
        match cache
            .search("strategies for the word deduction game", RETRIEVAL_TOP_K)
            .await
        {
            Ok(notes) => notes,
            Err(e) => {
                warn!("strategy retrieval failed, playing without notes: {}", e);
                Vec::new()
            }
        }
    }

    /// Append this game to `game_info.json` and each player's
    /// `player_{id}_beliefs.json`, all keyed by game id.
    fn persist_game(
        &self,
        state: &GameState,
        beliefs: &BTreeMap<PlayerId, BeliefStore>,
    ) -> Result<(), OrchestratorError> {
        fs::create_dir_all(&self.output_dir)?;

        let players: Vec<Value> = state
            .players
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "name": p.name,
                    "role": p.role,
                    "word": p.word,
                    "alive": p.alive,
                })
            })
            .collect();
        let record = json!({
            "players": players,
            "winner": state.winner,
            "final_round": state.round,
            "elimination_history": state.elimination_history,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let info_path = self.output_dir.join("game_info.json");
        let mut info = load_record_map(&info_path)?;
        info.insert(state.game_id.clone(), record);
        write_json_atomic(&info_path, &Value::Object(info))?;

        for (id, store) in beliefs {
            let path = self
                .output_dir
                .join(format!("player_{}_beliefs.json", id));
            let mut dump = load_record_map(&path)?;
            dump.insert(state.game_id.clone(), store.dump()?);
            write_json_atomic(&path, &Value::Object(dump))?;
        }
        Ok(())
    }

    /// Harvest one-line strategies from the finished game and fold them into
    /// the cache. Only called between games, after persistence.
    async fn refresh_cache(
        &mut self,
        retrieved: &[String],
        state: &GameState,
        beliefs: &BTreeMap<PlayerId, BeliefStore>,
    ) -> Result<(), OrchestratorError> {
        let (cache, curator) = match (self.cache.as_mut(), self.curator.as_ref()) {
            (Some(cache), Some(curator)) => (cache, curator),
            _ => return Ok(()),
        };
        let descriptions = beliefs
            .values()
            .next()
            .map(|store| store.descriptions().to_vec())
            .unwrap_or_default();
        let log = json!({
            "winner": state.winner,
            "final_round": state.round,
            "elimination_history": state.elimination_history,
            "descriptions": descriptions,
        });
        let lines = match curator.harvest(retrieved, &log).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("strategy curation failed, cache left as-is: {}", e);
                return Ok(());
            }
        };
        info!("curator produced {} strategy line(s)", lines.len());
        for line in lines {
            cache.add(&line).await?;
        }
        Ok(())
    }
}

fn load_record_map(path: &Path) -> Result<Map<String, Value>, OrchestratorError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

fn write_json_atomic(path: &Path, value: &Value) -> Result<(), OrchestratorError> {
    let body = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spygame::agent_proxy::{
        AgentCallError, DescribeRequest, DescribeResult, ReflectRequest, ReflectResult,
        VoteRequest, VoteResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Everyone votes for the highest eligible id: unique plurality every
    /// round, so games end quickly.
    struct PileOnProxy;

    #[async_trait]
    impl AgentProxy for PileOnProxy {
        async fn describe(
            &self,
            req: DescribeRequest,
        ) -> Result<DescribeResult, AgentCallError> {
            Ok(DescribeResult {
                text: format!("player {} says something", req.player_id),
                thinking: String::new(),
            })
        }

        async fn reflect(&self, _req: ReflectRequest) -> Result<ReflectResult, AgentCallError> {
            Ok(ReflectResult::default())
        }

        async fn vote(&self, req: VoteRequest) -> Result<VoteResult, AgentCallError> {
            let target = req.eligible.iter().copied().max().unwrap();
            Ok(VoteResult {
                target,
                reason: "pile on".to_string(),
                thinking: String::new(),
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

    #[tokio::test]
    async fn run_game_persists_records() {
        let dir = tempdir().unwrap();
        let mut orchestrator =
            GameOrchestrator::new(fast_config(), Arc::new(PileOnProxy), dir.path());
        let summary = orchestrator.run_game().await.unwrap();

        let info_raw = fs::read_to_string(dir.path().join("game_info.json")).unwrap();
        let info: Value = serde_json::from_str(&info_raw).unwrap();
        let record = info.get(&summary.game_id).expect("game keyed by id");
        assert_eq!(record["players"].as_array().unwrap().len(), 5);
        assert!(record.get("winner").is_some());

        for id in 1..=5u32 {
            let path = dir.path().join(format!("player_{}_beliefs.json", id));
            let dump: Value =
                serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
            assert!(dump.get(&summary.game_id).is_some());
        }
    }

    #[tokio::test]
    async fn records_accumulate_across_games() {
        let dir = tempdir().unwrap();
        let mut orchestrator =
            GameOrchestrator::new(fast_config(), Arc::new(PileOnProxy), dir.path());
        orchestrator.run_game().await.unwrap();
        orchestrator.run_game().await.unwrap();

        let info: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("game_info.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(info.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_continues_past_a_failing_game() {
        let dir = tempdir().unwrap();
        // An unusable config fails setup for every game, but the batch still
        // completes and reports zero summaries instead of aborting.
        let mut config = fast_config();
        config.word_pairs.clear();
        let mut orchestrator = GameOrchestrator::new(config, Arc::new(PileOnProxy), dir.path());
        let summaries = orchestrator.run_batch(3).await;
        assert!(summaries.is_empty());

        let mut orchestrator =
            GameOrchestrator::new(fast_config(), Arc::new(PileOnProxy), dir.path());
        let summaries = orchestrator.run_batch(2).await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(orchestrator.games_completed(), 2);
    }

    struct CountingCurator {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelClient for CountingCurator {
        async fn complete(
            &self,
            _prompt: &str,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("- always hedge in round one".to_string())
        }
    }

    struct TinyEmbedder;

    #[async_trait]
    impl Embedder for TinyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
            let mut v = vec![0.0f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32;
            }
            Ok(v)
        }
    }

    #[tokio::test]
    async fn cache_refresh_follows_update_cadence() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = RetrievalCache::open(
            dir.path().join("cache"),
            "strategies",
            10,
            Arc::new(TinyEmbedder),
        )
        .unwrap();

        let mut config = fast_config();
        config.enable_strategy_cache = true;
        let mut orchestrator = GameOrchestrator::new(config, Arc::new(PileOnProxy), dir.path())
            .with_strategy_cache(
                cache,
                Arc::new(CountingCurator {
                    calls: Arc::clone(&calls),
                }),
            );

        let summaries = orchestrator.run_batch(5).await;
        assert_eq!(summaries.len(), 5);
        // Curator runs exactly once: after the 5th game.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.cache.as_ref().unwrap().len(), 1);
    }
}
