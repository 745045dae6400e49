//! Per-player structured memory.
//!
//! Each logical agent exclusively owns one [`BeliefStore`]: an ordered log of
//! descriptions, its own and everyone's voting history, and round-indexed,
//! phase-tagged analysis buckets about itself and every other player.
//!
//! The store guarantees **at most one bucket per `(round, phase)` key** — a
//! new analysis for the same key replaces the prior one instead of
//! accumulating duplicates — and lookups that miss the requested round fall
//! back to the most recent earlier round, never a later one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::spygame::state::{DescriptionEntry, PlayerId};

/// Self-reported certainty attached to an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// An agent's belief about a player's hidden role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleGuess {
    Majority,
    Outlier,
    Unknown,
    /// Pinned once the player is eliminated; never reversed.
    Eliminated,
}

/// Which step of a round produced an analysis bucket.
///
/// The ordering here doubles as the preference order when several buckets
/// exist for the same round: description-phase reflections are the freshest
/// read on the table, then post-vote reflections, then the seed entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BeliefPhase {
    DescriptionReflection,
    VotingReflection,
    Initial,
}

const PHASE_PREFERENCE: [BeliefPhase; 3] = [
    BeliefPhase::DescriptionReflection,
    BeliefPhase::VotingReflection,
    BeliefPhase::Initial,
];

/// Belief about one other player for one round/phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub word_guess: String,
    pub word_reason: String,
    pub role_guess: RoleGuess,
    pub role_reason: String,
    pub confidence: Confidence,
}

impl Analysis {
    /// Explicit "no information yet" placeholder. Used both for the round-0
    /// seed entries and for rendering targets that have no stored analysis,
    /// so downstream prompt construction always sees a complete table.
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            word_guess: "unknown".to_string(),
            word_reason: String::new(),
            role_guess: RoleGuess::Unknown,
            role_reason: reason.into(),
            confidence: Confidence::Low,
        }
    }

    fn eliminated() -> Self {
        Self {
            word_guess: "unknown".to_string(),
            word_reason: String::new(),
            role_guess: RoleGuess::Eliminated,
            role_reason: "this player has been eliminated".to_string(),
            confidence: Confidence::High,
        }
    }
}

/// An agent's belief about its own role, optionally grounded by the
/// embedding-distance outlier score (a noisy hint, not ground truth).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfAnalysis {
    pub role_guess: RoleGuess,
    pub role_reason: String,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_consistency: Option<bool>,
}

/// One cast vote. The controller validates `target` before a record is
/// ever stored: alive, eligible this round, and not the voter itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub round: u32,
    pub voter: PlayerId,
    pub target: PlayerId,
    pub reason: String,
}

/// Per-player memory, owned exclusively by that player's logical agent and
/// mutated only on the controller thread after fan-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefStore {
    owner: PlayerId,
    descriptions: Vec<DescriptionEntry>,
    own_votes: Vec<VoteRecord>,
    all_votes: BTreeMap<u32, Vec<VoteRecord>>,
    self_analyses: BTreeMap<u32, BTreeMap<BeliefPhase, SelfAnalysis>>,
    other_analyses: BTreeMap<u32, BTreeMap<BeliefPhase, BTreeMap<PlayerId, Analysis>>>,
    eliminated: BTreeSet<PlayerId>,
}

impl BeliefStore {
    pub fn new(owner: PlayerId) -> Self {
        Self {
            owner,
            descriptions: Vec::new(),
            own_votes: Vec::new(),
            all_votes: BTreeMap::new(),
            self_analyses: BTreeMap::new(),
            other_analyses: BTreeMap::new(),
            eliminated: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> PlayerId {
        self.owner
    }

    /// Seed an `unknown` analysis for every other player at round 0 so that
    /// later lookups never need to handle an empty table.
    pub fn seed_initial(&mut self, others: &[PlayerId]) {
        let seeds: BTreeMap<PlayerId, Analysis> = others
            .iter()
            .filter(|id| **id != self.owner)
            .map(|id| {
                (
                    *id,
                    Analysis::unknown("the game just started, not enough information yet"),
                )
            })
            .collect();
        self.record_analyses(0, BeliefPhase::Initial, None, seeds);
    }

    /// Append a description; a duplicate `(round, player)` pair overwrites
    /// the earlier text instead of duplicating the entry.
    pub fn record_description(&mut self, round: u32, player_id: PlayerId, text: &str) {
        if let Some(existing) = self
            .descriptions
            .iter_mut()
            .find(|d| d.round == round && d.player_id == player_id)
        {
            existing.text = text.to_string();
            return;
        }
        self.descriptions.push(DescriptionEntry {
            round,
            player_id,
            text: text.to_string(),
        });
    }

    /// All descriptions spoken strictly before `round`, in spoken order.
    pub fn descriptions_before(&self, round: u32) -> Vec<DescriptionEntry> {
        self.descriptions
            .iter()
            .filter(|d| d.round < round)
            .cloned()
            .collect()
    }

    /// Full description log (history plus current round so far).
    pub fn descriptions(&self) -> &[DescriptionEntry] {
        &self.descriptions
    }

    pub fn record_vote(&mut self, record: VoteRecord) {
        self.own_votes.push(record);
    }

    pub fn own_votes(&self) -> &[VoteRecord] {
        &self.own_votes
    }

    /// Replace the full vote table for `round` (everyone's votes).
    pub fn record_all_votes(&mut self, round: u32, votes: Vec<VoteRecord>) {
        self.all_votes.insert(round, votes);
    }

    pub fn all_votes(&self) -> Vec<(u32, Vec<VoteRecord>)> {
        self.all_votes
            .iter()
            .map(|(r, v)| (*r, v.clone()))
            .collect()
    }

    /// Merge an analysis batch into the `(round, phase)` bucket.
    ///
    /// The self analysis, when present, replaces the bucket's prior value.
    /// The `others` map is union-merged by player id: keys present in the new
    /// map overwrite, keys absent from it are preserved. Eliminated players
    /// stay pinned to [`RoleGuess::Eliminated`] no matter what the new
    /// payload claims.
    pub fn record_analyses(
        &mut self,
        round: u32,
        phase: BeliefPhase,
        self_analysis: Option<SelfAnalysis>,
        others: BTreeMap<PlayerId, Analysis>,
    ) {
        if let Some(sa) = self_analysis {
            self.self_analyses
                .entry(round)
                .or_insert_with(BTreeMap::new)
                .insert(phase, sa);
        }
        if !others.is_empty() {
            let bucket = self
                .other_analyses
                .entry(round)
                .or_insert_with(BTreeMap::new)
                .entry(phase)
                .or_insert_with(BTreeMap::new);
            for (id, mut analysis) in others {
                if id == self.owner {
                    continue;
                }
                if self.eliminated.contains(&id) {
                    analysis.role_guess = RoleGuess::Eliminated;
                }
                bucket.insert(id, analysis);
            }
        }
    }

    /// Most recent self analysis at or before `upto_round`.
    pub fn latest_self_analysis(&self, upto_round: u32) -> Option<&SelfAnalysis> {
        self.self_analyses
            .range(..=upto_round)
            .rev()
            .find_map(|(_, phases)| PHASE_PREFERENCE.iter().find_map(|p| phases.get(p)))
    }

    /// Most recent analysis for each target at or before `upto_round`.
    ///
    /// Every requested id is present in the result: targets without any
    /// stored entry render as an explicit `unknown` placeholder, and
    /// eliminated targets as `eliminated`, so the caller never needs
    /// null-handling.
    pub fn latest_other_analyses(
        &self,
        upto_round: u32,
        targets: &[PlayerId],
    ) -> BTreeMap<PlayerId, Analysis> {
        let mut out = BTreeMap::new();
        for &id in targets {
            if id == self.owner {
                continue;
            }
            if self.eliminated.contains(&id) {
                out.insert(id, Analysis::eliminated());
                continue;
            }
            let found = self
                .other_analyses
                .range(..=upto_round)
                .rev()
                .find_map(|(_, phases)| {
                    PHASE_PREFERENCE
                        .iter()
                        .find_map(|p| phases.get(p).and_then(|m| m.get(&id)))
                });
            out.insert(
                id,
                found
                    .cloned()
                    .unwrap_or_else(|| Analysis::unknown("no analysis yet")),
            );
        }
        out
    }

    /// Pin `player_id` as eliminated for every later lookup. One-way.
    pub fn mark_eliminated(&mut self, player_id: PlayerId) {
        self.eliminated.insert(player_id);
    }

    pub fn is_eliminated(&self, player_id: PlayerId) -> bool {
        self.eliminated.contains(&player_id)
    }

    /// Serializable snapshot of the whole store, as persisted per game.
    pub fn dump(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}
