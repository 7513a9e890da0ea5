//! # Partner Matchmaking
//!
//! Single-pass filter that selects, from a pool of players who saved settings for
//! the same game and mode, the ones compatible with a requester.
//!
//! A candidate qualifies when:
//! 1. the mode is the same,
//! 2. the requester's voice-chat requirement (if any) is met by the candidate,
//! 3. the candidate's rank is within the requester's tolerance window, or is
//!    explicitly listed in the requester's preferred ranks,
//! 4. under [`MatchPolicy::Reciprocal`], the same rank rule holds the other way
//!    round, using the candidate's own window and preferences.
//!
//! Unranked games skip rules 3 and 4. There is no scoring; results keep the
//! order of the input pool.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::games::{normalize_rank, Game};

/// Tolerance used for players who never saved partner preferences
pub const DEFAULT_TOLERANCE: u32 = 1;

/// Per-game options a player attaches to their settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOptions {
    /// Player wants (and offers) voice chat
    #[serde(default)]
    pub voice_chat: bool,
    /// Free-form tags ("chill", "tryhard", ...). Informational only.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Everything the filter needs to know about one player for one game
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchProfile {
    pub rank: String,
    pub mode: String,
    pub options: GameOptions,
    pub preferred_ranks: Vec<String>,
    pub tolerance: u32,
}

impl MatchProfile {
    pub fn new(rank: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            rank: rank.into(),
            mode: mode.into(),
            options: GameOptions::default(),
            preferred_ranks: Vec::new(),
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Whether this player would accept a partner of `other_rank`
    fn accepts_rank(&self, game: &Game, other_rank: &str) -> bool {
        if !game.is_ranked() {
            return true;
        }

        let within_window = game
            .rank_distance(&self.rank, other_rank)
            .is_some_and(|distance| distance <= self.tolerance);
        if within_window {
            return true;
        }

        let other = normalize_rank(other_rank);
        self.preferred_ranks
            .iter()
            .any(|preferred| normalize_rank(preferred) == other)
    }

    fn same_mode(&self, other: &MatchProfile) -> bool {
        self.mode.trim().eq_ignore_ascii_case(other.mode.trim())
    }

    fn voice_requirement_met_by(&self, other: &MatchProfile) -> bool {
        !self.options.voice_chat || other.options.voice_chat
    }
}

/// Whether compatibility must hold in both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Both players must accept each other's rank
    #[default]
    Reciprocal,
    /// Only the requester's window and preferences are applied
    OneWay,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown match policy '{0}' (expected 'reciprocal' or 'one-way')")]
pub struct ParseMatchPolicyError(String);

impl FromStr for MatchPolicy {
    type Err = ParseMatchPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reciprocal" => Ok(MatchPolicy::Reciprocal),
            "one-way" | "one_way" | "oneway" => Ok(MatchPolicy::OneWay),
            other => Err(ParseMatchPolicyError(other.to_string())),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::Reciprocal => write!(f, "reciprocal"),
            MatchPolicy::OneWay => write!(f, "one-way"),
        }
    }
}

/// A player from the candidate pool, identified by `key`
#[derive(Debug, Clone)]
pub struct MatchCandidate<K> {
    pub key: K,
    pub profile: MatchProfile,
}

/// A candidate that passed the filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match<K> {
    pub key: K,
    /// Ordinal rank distance, `None` for unranked games or off-ladder ranks
    pub distance: Option<u32>,
}

/// Check a single requester/candidate pair
pub fn is_match(
    game: &Game,
    policy: MatchPolicy,
    requester: &MatchProfile,
    candidate: &MatchProfile,
) -> bool {
    if !requester.same_mode(candidate) {
        return false;
    }
    if !requester.voice_requirement_met_by(candidate) {
        return false;
    }
    if !requester.accepts_rank(game, &candidate.rank) {
        return false;
    }
    match policy {
        MatchPolicy::Reciprocal => candidate.accepts_rank(game, &requester.rank),
        MatchPolicy::OneWay => true,
    }
}

/// Filter a candidate pool, keeping store order
pub fn find_matches<K>(
    game: &Game,
    policy: MatchPolicy,
    requester: &MatchProfile,
    candidates: impl IntoIterator<Item = MatchCandidate<K>>,
) -> Vec<Match<K>> {
    let mut scanned = 0usize;
    let matches: Vec<Match<K>> = candidates
        .into_iter()
        .inspect(|_| scanned += 1)
        .filter(|candidate| is_match(game, policy, requester, &candidate.profile))
        .map(|candidate| Match {
            distance: game.rank_distance(&requester.rank, &candidate.profile.rank),
            key: candidate.key,
        })
        .collect();

    debug!(
        game = game.id,
        %policy,
        scanned,
        matched = matches.len(),
        "matchmaking pass complete"
    );
    matches
}
