//! Model-backed agent collaborators.
//!
//! [`ModelClient`] is the opaque "ask the model" capability; [`AgentProxy`]
//! is the typed per-action surface the round controller talks to. The default
//! [`ModelAgentProxy`] renders each structured request into a prompt, asks the
//! client, and parses the JSON reply — strict parse first, then a
//! brace-counting salvage pass for replies that wrap the JSON in prose.
//!
//! Every failure mode is a value, never a panic: the executor converts
//! [`AgentCallError`] into an absent outcome and the controller substitutes
//! the documented fallback.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::spygame::belief::{
    Analysis, BeliefPhase, Confidence, RoleGuess, SelfAnalysis, VoteRecord,
};
use crate::spygame::state::{DescriptionEntry, PlayerId};

/// Why an agent call produced no usable result.
#[derive(Debug, Clone)]
pub enum AgentCallError {
    /// Network or client failure reaching the model.
    Transport(String),
    /// The call exceeded its per-call or phase deadline.
    Timeout(Duration),
    /// The model replied but no valid payload could be recovered.
    Malformed(String),
}

impl fmt::Display for AgentCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCallError::Transport(msg) => write!(f, "transport error: {}", msg),
            AgentCallError::Timeout(d) => write!(f, "timed out after {:?}", d),
            AgentCallError::Malformed(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl Error for AgentCallError {}

/// Minimal completion interface over whatever model backend is in play.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Everything a player knows when asked to describe its word.
#[derive(Debug, Clone)]
pub struct DescribeRequest {
    pub round: u32,
    pub player_id: PlayerId,
    pub word: String,
    /// Alive ids in speaking order; tells the agent who spoke before it.
    pub speaking_order: Vec<PlayerId>,
    pub history: Vec<DescriptionEntry>,
    pub current_round_descriptions: Vec<DescriptionEntry>,
    pub self_belief: Option<SelfAnalysis>,
    pub other_beliefs: BTreeMap<PlayerId, Analysis>,
    pub strategy_notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DescribeResult {
    pub text: String,
    pub thinking: String,
}

/// Context for one reflection pass after a speaker or after a vote.
#[derive(Debug, Clone)]
pub struct ReflectRequest {
    pub round: u32,
    pub player_id: PlayerId,
    pub phase: BeliefPhase,
    pub word: String,
    /// The player whose fresh description triggered this reflection, when any.
    pub speaker: Option<PlayerId>,
    pub descriptions: Vec<DescriptionEntry>,
    pub votes: Vec<VoteRecord>,
    /// Embedding-distance hint that this player's word is the odd one out.
    pub outlier_score: Option<f32>,
    pub prior_self: Option<SelfAnalysis>,
    pub prior_others: BTreeMap<PlayerId, Analysis>,
    pub alive: Vec<PlayerId>,
}

#[derive(Debug, Clone, Default)]
pub struct ReflectResult {
    pub self_analysis: Option<SelfAnalysis>,
    pub others: BTreeMap<PlayerId, Analysis>,
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub round: u32,
    pub player_id: PlayerId,
    pub word: String,
    pub eligible: Vec<PlayerId>,
    pub descriptions: Vec<DescriptionEntry>,
    pub self_belief: Option<SelfAnalysis>,
    pub other_beliefs: BTreeMap<PlayerId, Analysis>,
    pub strategy_notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VoteResult {
    pub target: PlayerId,
    pub reason: String,
    pub thinking: String,
}

/// Typed agent surface the round controller fans out over.
#[async_trait]
pub trait AgentProxy: Send + Sync {
    async fn describe(&self, req: DescribeRequest) -> Result<DescribeResult, AgentCallError>;
    async fn reflect(&self, req: ReflectRequest) -> Result<ReflectResult, AgentCallError>;
    async fn vote(&self, req: VoteRequest) -> Result<VoteResult, AgentCallError>;
}

/// [`AgentProxy`] backed by a [`ModelClient`] and JSON prompting.
pub struct ModelAgentProxy {
    client: Arc<dyn ModelClient>,
}

impl ModelAgentProxy {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    async fn ask(&self, prompt: &str) -> Result<Value, AgentCallError> {
        let raw = self
            .client
            .complete(prompt)
            .await
            .map_err(|e| AgentCallError::Transport(e.to_string()))?;
        debug!("model reply: {} chars", raw.len());
        parse_json_payload(&raw)
            .ok_or_else(|| AgentCallError::Malformed("no JSON object in reply".to_string()))
    }
}

#[async_trait]
impl AgentProxy for ModelAgentProxy {
    async fn describe(&self, req: DescribeRequest) -> Result<DescribeResult, AgentCallError> {
        let payload = self.ask(&render_describe_prompt(&req)).await?;
        let text = string_field(&payload, "description")
            .ok_or_else(|| AgentCallError::Malformed("missing description field".to_string()))?;
        if text.trim().is_empty() {
            return Err(AgentCallError::Malformed("empty description".to_string()));
        }
        Ok(DescribeResult {
            text,
            thinking: string_field(&payload, "thinking").unwrap_or_default(),
        })
    }

    async fn reflect(&self, req: ReflectRequest) -> Result<ReflectResult, AgentCallError> {
        let payload = self.ask(&render_reflect_prompt(&req)).await?;
        let mut result = parse_reflect_payload(&payload);
        if result.self_analysis.is_none() && result.others.is_empty() {
            return Err(AgentCallError::Malformed(
                "reflection carried no analyses".to_string(),
            ));
        }
        // Attach the grounding hint and whether the model's self-read agrees
        // with it; the score itself came from the request, not the model.
        if let Some(sa) = result.self_analysis.as_mut() {
            sa.outlier_score = req.outlier_score;
            sa.grounding_consistency = req.outlier_score.map(|score| {
                let hint_says_outlier = score >= 0.5;
                hint_says_outlier == (sa.role_guess == RoleGuess::Outlier)
            });
        }
        Ok(result)
    }

    async fn vote(&self, req: VoteRequest) -> Result<VoteResult, AgentCallError> {
        let payload = self.ask(&render_vote_prompt(&req)).await?;
        let target = payload
            .get("vote")
            .or_else(|| payload.get("target"))
            .and_then(parse_player_ref)
            .ok_or_else(|| AgentCallError::Malformed("missing vote target".to_string()))?;
        Ok(VoteResult {
            target,
            reason: string_field(&payload, "reason").unwrap_or_default(),
            thinking: string_field(&payload, "thinking").unwrap_or_default(),
        })
    }
}

fn render_player_table(beliefs: &BTreeMap<PlayerId, Analysis>) -> String {
    let mut out = String::new();
    for (id, a) in beliefs {
        out.push_str(&format!(
            "- PLAYER{}: word guess \"{}\" ({}), role guess {:?} ({}), confidence {:?}\n",
            id, a.word_guess, a.word_reason, a.role_guess, a.role_reason, a.confidence
        ));
    }
    out
}

fn render_descriptions(entries: &[DescriptionEntry]) -> String {
    let mut out = String::new();
    for d in entries {
        out.push_str(&format!(
            "- round {} PLAYER{}: {}\n",
            d.round, d.player_id, d.text
        ));
    }
    out
}

fn render_self_belief(belief: &Option<SelfAnalysis>) -> String {
    match belief {
        Some(sa) => format!(
            "Your last read on your own role: {:?} ({}), confidence {:?}.\n",
            sa.role_guess, sa.role_reason, sa.confidence
        ),
        None => String::new(),
    }
}

fn render_strategy_notes(notes: &[String]) -> String {
    if notes.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nStrategies that worked in past games:\n");
    for n in notes {
        out.push_str(&format!("- {}\n", n));
    }
    out
}

fn render_describe_prompt(req: &DescribeRequest) -> String {
    format!(
        "You are PLAYER{id} in a word-deduction game. Your secret word is \"{word}\".\n\
         Round {round}. Speaking order: {order:?}.\n\
         Descriptions from earlier rounds:\n{history}\
         Descriptions already given this round:\n{current}\
         Your current beliefs about the other players:\n{table}{selfread}{notes}\n\
         Describe your word in one sentence without saying it. Be accurate but\n\
         not so specific that the odd player can deduce it.\n\
         Reply with JSON only: {{\"thinking\": \"...\", \"description\": \"...\"}}",
        id = req.player_id,
        word = req.word,
        round = req.round,
        order = req.speaking_order,
        history = render_descriptions(&req.history),
        current = render_descriptions(&req.current_round_descriptions),
        table = render_player_table(&req.other_beliefs),
        selfread = render_self_belief(&req.self_belief),
        notes = render_strategy_notes(&req.strategy_notes),
    )
}

fn render_reflect_prompt(req: &ReflectRequest) -> String {
    let trigger = match req.speaker {
        Some(s) => format!("PLAYER{} just spoke.", s),
        None => "The votes for this round are in.".to_string(),
    };
    let grounding = match req.outlier_score {
        Some(score) => format!(
            "\nAn embedding-similarity check scored your word's oddness at {:.3}\n\
             (above 0.5 suggests you hold the different word). This is a noisy\n\
             hint, weigh it against the conversation.\n",
            score
        ),
        None => String::new(),
    };
    format!(
        "You are PLAYER{id}. Your secret word is \"{word}\". Round {round}. {trigger}\n\
         All descriptions so far:\n{descriptions}\
         Votes so far:\n{votes}\
         Your previous beliefs:\n{table}{selfread}{grounding}\n\
         Alive players: {alive:?}.\n\
         Update your beliefs. Reply with JSON only:\n\
         {{\"self\": {{\"role\": \"majority|outlier|unknown\", \"reason\": \"...\",\n\
         \"confidence\": \"high|medium|low\"}},\n\
         \"players\": {{\"player_2\": {{\"word_guess\": \"...\", \"word_reason\": \"...\",\n\
         \"role\": \"majority|outlier|unknown\", \"role_reason\": \"...\",\n\
         \"confidence\": \"high|medium|low\"}}}}}}",
        id = req.player_id,
        word = req.word,
        round = req.round,
        trigger = trigger,
        descriptions = render_descriptions(&req.descriptions),
        votes = req
            .votes
            .iter()
            .map(|v| format!("- round {} PLAYER{} voted PLAYER{}: {}\n", v.round, v.voter, v.target, v.reason))
            .collect::<String>(),
        table = render_player_table(&req.prior_others),
        selfread = render_self_belief(&req.prior_self),
        grounding = grounding,
        alive = req.alive,
    )
}

fn render_vote_prompt(req: &VoteRequest) -> String {
    format!(
        "You are PLAYER{id}. Your secret word is \"{word}\". Round {round}.\n\
         All descriptions so far:\n{descriptions}\
         Your beliefs about the others:\n{table}{selfread}{notes}\n\
         Vote to eliminate one of {eligible:?} (you cannot vote for yourself).\n\
         Reply with JSON only: {{\"thinking\": \"...\", \"vote\": <player id>,\n\
         \"reason\": \"...\"}}",
        id = req.player_id,
        word = req.word,
        round = req.round,
        descriptions = render_descriptions(&req.descriptions),
        table = render_player_table(&req.other_beliefs),
        selfread = render_self_belief(&req.self_belief),
        notes = render_strategy_notes(&req.strategy_notes),
        eligible = req.eligible,
    )
}

/// Recover a JSON object from loose model output.
///
/// Tries a strict parse of the whole reply first; failing that, scans for the
/// first `{` and brace-counts to the matching `}`, skipping brace characters
/// inside string literals.
pub fn parse_json_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }
    let start = trimmed.find('{')?;
    let bytes = trimmed.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..=i];
                    return serde_json::from_str::<Value>(candidate)
                        .ok()
                        .filter(Value::is_object);
                }
            }
            _ => {}
        }
    }
    None
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Accept `3`, `"3"`, `"player_3"`, `"PLAYER3"`, or `"Player 3"`.
pub fn parse_player_ref(value: &Value) -> Option<PlayerId> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as PlayerId),
        Value::String(s) => parse_player_key(s),
        _ => None,
    }
}

pub fn parse_player_key(key: &str) -> Option<PlayerId> {
    let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn parse_role_guess(s: &str) -> RoleGuess {
    match s.trim().to_ascii_lowercase().as_str() {
        "majority" | "civilian" => RoleGuess::Majority,
        "outlier" | "spy" | "undercover" => RoleGuess::Outlier,
        _ => RoleGuess::Unknown,
    }
}

fn parse_confidence(s: &str) -> Confidence {
    match s.trim().to_ascii_lowercase().as_str() {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        _ => Confidence::Low,
    }
}

fn parse_reflect_payload(payload: &Value) -> ReflectResult {
    let self_analysis = payload.get("self").and_then(|s| {
        let role = s.get("role").and_then(Value::as_str)?;
        Some(SelfAnalysis {
            role_guess: parse_role_guess(role),
            role_reason: string_field(s, "reason").unwrap_or_default(),
            confidence: parse_confidence(
                s.get("confidence").and_then(Value::as_str).unwrap_or("low"),
            ),
            outlier_score: None,
            grounding_consistency: None,
        })
    });

    let mut others = BTreeMap::new();
    if let Some(players) = payload.get("players").and_then(Value::as_object) {
        for (key, entry) in players {
            let id = match parse_player_key(key) {
                Some(id) => id,
                None => continue, // unknown key shape, drop it
            };
            let role = entry
                .get("role")
                .and_then(Value::as_str)
                .map(parse_role_guess)
                .unwrap_or(RoleGuess::Unknown);
            others.insert(
                id,
                Analysis {
                    word_guess: string_field(entry, "word_guess")
                        .unwrap_or_else(|| "unknown".to_string()),
                    word_reason: string_field(entry, "word_reason").unwrap_or_default(),
                    role_guess: role,
                    role_reason: string_field(entry, "role_reason").unwrap_or_default(),
                    confidence: parse_confidence(
                        entry
                            .get("confidence")
                            .and_then(Value::as_str)
                            .unwrap_or("low"),
                    ),
                },
            );
        }
    }

    ReflectResult {
        self_analysis,
        others,
    }
}
