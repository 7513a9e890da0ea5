//! Command-line and environment configuration

use clap::Parser;
use matchmates_core::MatchPolicy;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "MatchMates social and matchmaking server", long_about = None)]
pub struct Args {
    /// Server bind address
    #[arg(short = 'a', long, env = "MATCHMATES_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Database file path (`:memory:` for a throwaway database)
    #[arg(short = 'd', long, env = "MATCHMATES_DATABASE", default_value = "matchmates.db")]
    pub database: String,

    /// Session lifetime in hours
    #[arg(long, env = "MATCHMATES_TOKEN_TTL_HOURS", default_value_t = 24)]
    pub token_ttl_hours: u64,

    /// `reciprocal` or `one-way`
    #[arg(long, env = "MATCHMATES_MATCH_POLICY", default_value_t = MatchPolicy::Reciprocal)]
    pub match_policy: MatchPolicy,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "MATCHMATES_LOG", default_value = "info")]
    pub log_level: String,

    /// Create the testuser demo account on startup
    #[arg(long)]
    pub seed_demo_user: bool,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours.saturating_mul(3600))
    }
}
