//! # MatchMates Core
//!
//! Domain logic shared by the MatchMates server, free of any I/O:
//! - the static game catalog and per-game rank ladders
//! - the rank-window partner matchmaking filter

pub mod games;
pub mod matchmaking;

pub use games::{catalog, find_game, search, Game};
pub use matchmaking::{
    find_matches, is_match, GameOptions, Match, MatchCandidate, MatchPolicy, MatchProfile,
    DEFAULT_TOLERANCE,
};
