//! Retrieval-backed strategy memory shared across games.
//!
//! A small FIFO pool of one-line strategy notes, indexed by embedding for
//! similarity search. Embeddings come from an OpenAI-compatible `/embeddings`
//! endpoint and are memoized per text for the life of the process; once the
//! memo pool is large enough, a projection fitted over it shrinks every
//! vector before indexing. The three on-disk artifacts (index, texts,
//! reducer) are rewritten atomically after every mutation so a crash never
//! leaves a torn cache.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::spygame::agent_proxy::ModelClient;

/// Number of memoized embeddings required before the reducer is fitted.
const REDUCER_FIT_THRESHOLD: usize = 128;
/// Target dimensionality of the reduced index.
const REDUCER_COMPONENTS: usize = 128;
/// Default note capacity; oldest note is evicted first.
pub const DEFAULT_CAPACITY: usize = 10;

/// Text-to-vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>>;
}

/// [`Embedder`] over an OpenAI-compatible `/embeddings` HTTP endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: Value = request.send().await?.error_for_status()?.json().await?;
        let vector = response
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|e| e.get("embedding"))
            .and_then(Value::as_array)
            .ok_or("embeddings response missing data[0].embedding")?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(vector)
    }
}

/// Cosine similarity between two equal-length vectors, 0.0 on degenerate
/// input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Linear projection fitted once over the embedding pool: mean-centering plus
/// the top singular directions found by power iteration with deflation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reducer {
    mean: Vec<f32>,
    components: Vec<Vec<f32>>,
}

impl Reducer {
    /// Fit up to `k` components over `rows` (each a raw embedding).
    pub fn fit(rows: &[Vec<f32>], k: usize) -> Option<Self> {
        let n = rows.len();
        let d = rows.first()?.len();
        if n < 2 || d == 0 {
            return None;
        }
        let k = k.min(d).min(n);

        let mut mean = vec![0.0f32; d];
        for row in rows {
            for (m, x) in mean.iter_mut().zip(row.iter()) {
                *m += x;
            }
        }
        for m in mean.iter_mut() {
            *m /= n as f32;
        }

        let mut centered: Vec<Vec<f32>> = rows
            .iter()
            .map(|row| row.iter().zip(mean.iter()).map(|(x, m)| x - m).collect())
            .collect();

        let mut components = Vec::with_capacity(k);
        let mut seed = 0x2545f491u32;
        for _ in 0..k {
            // Deterministic pseudo-random start vector.
            let mut v: Vec<f32> = (0..d)
                .map(|_| {
                    seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                    (seed >> 16) as f32 / 65536.0 - 0.5
                })
                .collect();
            normalize(&mut v);

            for _ in 0..50 {
                // v <- X^T (X v), computed row-wise.
                let mut next = vec![0.0f32; d];
                for row in &centered {
                    let proj = dot(row, &v);
                    for (nx, rx) in next.iter_mut().zip(row.iter()) {
                        *nx += proj * rx;
                    }
                }
                if !normalize(&mut next) {
                    break;
                }
                v = next;
            }

            // Deflate: remove this direction from every row.
            for row in centered.iter_mut() {
                let proj = dot(row, &v);
                for (rx, vx) in row.iter_mut().zip(v.iter()) {
                    *rx -= proj * vx;
                }
            }
            components.push(v);
        }
        Some(Self { mean, components })
    }

    /// Project one raw embedding into the reduced space.
    pub fn apply(&self, raw: &[f32]) -> Vec<f32> {
        let centered: Vec<f32> = raw
            .iter()
            .zip(self.mean.iter())
            .map(|(x, m)| x - m)
            .collect();
        self.components.iter().map(|c| dot(c, &centered)).collect()
    }

    pub fn output_dim(&self) -> usize {
        self.components.len()
    }
}

fn normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Cache failure modes.
#[derive(Debug)]
pub enum CacheError {
    Io(std::io::Error),
    Corrupt(String),
    Embed(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(e) => write!(f, "cache io error: {}", e),
            CacheError::Corrupt(msg) => write!(f, "cache artifact corrupt: {}", msg),
            CacheError::Embed(msg) => write!(f, "embedding failed: {}", msg),
        }
    }
}

impl Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    vectors: Vec<Vec<f32>>,
}

/// FIFO pool of strategy notes with an embedding index.
pub struct RetrievalCache {
    dir: PathBuf,
    prefix: String,
    capacity: usize,
    texts: Vec<String>,
    index: Vec<Vec<f32>>,
    reducer: Option<Reducer>,
    embedder: Arc<dyn Embedder>,
    memo: Mutex<HashMap<String, Vec<f32>>>,
}

impl RetrievalCache {
    /// Open a cache rooted at `dir` with artifact names `{prefix}_*.json`.
    /// Missing artifacts mean a cold start; present artifacts are loaded
    /// together.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        capacity: usize,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        let prefix = prefix.into();
        fs::create_dir_all(&dir)?;

        let mut cache = Self {
            dir,
            prefix,
            capacity: capacity.max(1),
            texts: Vec::new(),
            index: Vec::new(),
            reducer: None,
            embedder,
            memo: Mutex::new(HashMap::new()),
        };

        let texts_path = cache.artifact_path("texts");
        if texts_path.exists() {
            cache.texts = load_json(&texts_path)?;
            let index: PersistedIndex = load_json(&cache.artifact_path("index"))?;
            cache.index = index.vectors;
            if cache.index.len() != cache.texts.len() {
                return Err(CacheError::Corrupt(format!(
                    "index has {} vectors for {} texts",
                    cache.index.len(),
                    cache.texts.len()
                )));
            }
            // A pool persisted under a larger capacity shrinks oldest-first.
            while cache.texts.len() > cache.capacity {
                let evicted = cache.texts.remove(0);
                cache.index.remove(0);
                debug!("strategy cache evicted on open: {}", evicted);
            }
            let reducer_path = cache.artifact_path("reducer");
            if reducer_path.exists() {
                cache.reducer = Some(load_json(&reducer_path)?);
            }
            info!(
                "strategy cache loaded: {} notes, reducer {}",
                cache.texts.len(),
                if cache.reducer.is_some() { "fitted" } else { "unfitted" }
            );
        }
        Ok(cache)
    }

    fn artifact_path(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.json", self.prefix, kind))
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    async fn raw_embedding(&self, text: &str) -> Result<Vec<f32>, CacheError> {
        if let Ok(memo) = self.memo.lock() {
            if let Some(v) = memo.get(text) {
                return Ok(v.clone());
            }
        }
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| CacheError::Embed(e.to_string()))?;
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    fn indexed_embedding(&self, raw: &[f32]) -> Vec<f32> {
        match &self.reducer {
            Some(r) => r.apply(raw),
            None => raw.to_vec(),
        }
    }

    /// Insert one note. Duplicates are ignored; beyond capacity the oldest
    /// note is evicted. The full index is rebuilt and persisted before
    /// returning, so on-disk state always matches memory.
    pub async fn add(&mut self, text: &str) -> Result<(), CacheError> {
        let text = text.trim();
        if text.is_empty() || self.texts.iter().any(|t| t == text) {
            return Ok(());
        }
        while self.texts.len() >= self.capacity {
            let evicted = self.texts.remove(0);
            debug!("strategy cache evicted: {}", evicted);
        }
        self.texts.push(text.to_string());

        self.raw_embedding(text).await?;
        self.maybe_fit_reducer();
        self.rebuild_index().await?;
        self.persist()?;
        Ok(())
    }

    /// Fit the reducer once the memo pool is large enough. Fitted exactly
    /// once; later adds reuse the same projection.
    fn maybe_fit_reducer(&mut self) {
        if self.reducer.is_some() {
            return;
        }
        let rows: Vec<Vec<f32>> = match self.memo.lock() {
            Ok(memo) if memo.len() >= REDUCER_FIT_THRESHOLD => memo.values().cloned().collect(),
            _ => return,
        };
        if let Some(reducer) = Reducer::fit(&rows, REDUCER_COMPONENTS) {
            info!(
                "fitted embedding reducer over {} vectors -> {} dims",
                rows.len(),
                reducer.output_dim()
            );
            self.reducer = Some(reducer);
        }
    }

    async fn rebuild_index(&mut self) -> Result<(), CacheError> {
        let mut index = Vec::with_capacity(self.texts.len());
        for text in self.texts.clone() {
            let raw = self.raw_embedding(&text).await?;
            index.push(self.indexed_embedding(&raw));
        }
        self.index = index;
        Ok(())
    }

    /// Exact inner-product top-k over the index. Empty pool yields an empty
    /// result, never an error.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<String>, CacheError> {
        if self.texts.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let raw = self.raw_embedding(query).await?;
        let query_vec = self.indexed_embedding(&raw);
        let mut scored: Vec<(f32, usize)> = self
            .index
            .iter()
            .enumerate()
            .map(|(i, v)| (dot(v, &query_vec), i))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, i)| self.texts[i].clone())
            .collect())
    }

    /// Write all three artifacts atomically (temp file then rename).
    fn persist(&self) -> Result<(), CacheError> {
        store_json(
            &self.artifact_path("index"),
            &PersistedIndex {
                vectors: self.index.clone(),
            },
        )?;
        store_json(&self.artifact_path("texts"), &self.texts)?;
        if let Some(reducer) = &self.reducer {
            store_json(&self.artifact_path("reducer"), reducer)?;
        }
        Ok(())
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CacheError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| CacheError::Corrupt(format!("{}: {}", path.display(), e)))
}

fn store_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let body = serde_json::to_string(value)
        .map_err(|e| CacheError::Corrupt(format!("{}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Harvests one-line strategies from a finished game via a model pass.
pub struct StrategyCurator {
    client: Arc<dyn ModelClient>,
}

impl StrategyCurator {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    /// Ask the model to merge past notes with the new game log and return
    /// one-line strategies (plain text lines, leading bullets stripped).
    pub async fn harvest(
        &self,
        retrieved: &[String],
        game_log: &Value,
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        let retrieved_block: String = retrieved.iter().map(|x| format!("- {}\n", x)).collect();
        let prompt = format!(
            "You curate a strategy notebook for a word-deduction game.\n\
             Notes from past games:\n{}\n\
             Log of the game that just finished:\n{}\n\
             Integrate the old notes with what this game showed and extract\n\
             reusable strategies. One strategy per line, plain text, no JSON.",
            retrieved_block, game_log
        );
        let reply = self.client.complete(&prompt).await?;
        Ok(reply
            .lines()
            .map(|l| l.trim_start_matches(['-', '*', ' ']).trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}
