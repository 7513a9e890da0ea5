//! # Game Catalog
//!
//! The static list of games users can favorite and find partners for, together
//! with each game's rank ladder.
//!
//! A ladder is ordered from the lowest rank to the highest. The ordinal distance
//! between two ranks on the same ladder is what the matchmaking filter compares
//! against a player's tolerance. Unranked games (party games, free roam) have an
//! empty ladder and never produce a distance.

use serde::Serialize;

/// A game in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Game {
    pub id: &'static str,
    pub name: &'static str,
    pub tags: &'static [&'static str],
    /// Rank identifiers from lowest to highest. Empty for unranked games.
    pub ranks: &'static [&'static str],
}

const LOL_RANKS: &[&str] = &[
    "iron",
    "bronze",
    "silver",
    "gold",
    "platinum",
    "emerald",
    "diamond",
    "master",
    "grandmaster",
    "challenger",
];

const VALORANT_RANKS: &[&str] = &[
    "iron",
    "bronze",
    "silver",
    "gold",
    "platinum",
    "diamond",
    "ascendant",
    "immortal",
    "radiant",
];

const WOW_ARENA_RANKS: &[&str] = &[
    "combatant",
    "challenger",
    "rival",
    "duelist",
    "elite",
    "gladiator",
];

const ROCKET_LEAGUE_RANKS: &[&str] = &[
    "bronze",
    "silver",
    "gold",
    "platinum",
    "diamond",
    "champion",
    "grand_champion",
    "supersonic_legend",
];

static CATALOG: [Game; 6] = [
    Game {
        id: "lol",
        name: "League of Legends",
        tags: &["MOBA", "Ranked", "Flex"],
        ranks: LOL_RANKS,
    },
    Game {
        id: "valorant",
        name: "Valorant",
        tags: &["FPS", "Compétitif", "5v5"],
        ranks: VALORANT_RANKS,
    },
    Game {
        id: "wow",
        name: "World of Warcraft",
        tags: &["MMORPG", "Donjons", "Raids"],
        ranks: WOW_ARENA_RANKS,
    },
    Game {
        id: "rocketleague",
        name: "Rocket League",
        tags: &["2v2", "3v3", "Ranked"],
        ranks: ROCKET_LEAGUE_RANKS,
    },
    Game {
        id: "gta",
        name: "GTA Online / RP",
        tags: &["RP", "Heists", "Free roam"],
        ranks: &[],
    },
    Game {
        id: "amongus",
        name: "Among Us",
        tags: &["Party game", "Social"],
        ranks: &[],
    },
];

/// All games, in catalog order
pub fn catalog() -> &'static [Game] {
    &CATALOG
}

/// Look up a game by its id
pub fn find_game(id: &str) -> Option<&'static Game> {
    CATALOG.iter().find(|game| game.id == id)
}

/// Case-insensitive search over game names and tags.
///
/// A blank query returns the whole catalog.
pub fn search(query: &str) -> Vec<&'static Game> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return CATALOG.iter().collect();
    }

    CATALOG
        .iter()
        .filter(|game| {
            game.name.to_lowercase().contains(&needle)
                || game.tags.iter().any(|tag| tag.to_lowercase().contains(&needle))
        })
        .collect()
}

/// Normalize a user-supplied rank into ladder form (`Grand Champion` -> `grand_champion`)
pub fn normalize_rank(rank: &str) -> String {
    rank.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

impl Game {
    pub fn is_ranked(&self) -> bool {
        !self.ranks.is_empty()
    }

    /// Position of `rank` on this game's ladder
    pub fn rank_index(&self, rank: &str) -> Option<usize> {
        let rank = normalize_rank(rank);
        self.ranks.iter().position(|r| *r == rank)
    }

    /// Ordinal distance between two ranks, `None` if either is not on the ladder
    pub fn rank_distance(&self, a: &str, b: &str) -> Option<u32> {
        let a = self.rank_index(a)?;
        let b = self.rank_index(b)?;
        Some(a.abs_diff(b) as u32)
    }
}
