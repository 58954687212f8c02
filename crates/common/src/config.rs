use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;

use crate::db::checked_table_name;
use crate::types::{validate_ladder, LeagueDefinition, MatchMode};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "LEAGUES_CONFIG";
pub const CRON_SECRET_ENV: &str = "LEAGUES_CRON_SECRET";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub server: Server,
    pub pager: Pager,
    pub explorer: Explorer,
    pub observability: Observability,
    pub schedule: Option<Schedule>,
    /// Ladder override. Empty means the built-in ladder.
    #[serde(default)]
    pub leagues: Vec<LeagueDefinition>,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pager {
    /// Rows per page; matches the holder store's own row ceiling.
    pub page_size: u32,
    #[serde(default = "default_page_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_page_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Explorer {
    pub timeout_secs: u64,
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    pub interval_secs: u64,
    #[serde(default)]
    pub run_immediately: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub ticker: String,
    pub chain: String,
    pub holder_table: String,
    pub league_table: String,
    pub contract_address: String,
    pub explorer_url: String,
    pub match_mode: MatchMode,
}

impl Config {
    /// Load from `LEAGUES_CONFIG` if set, otherwise `config/default.toml`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config file: {path}"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.pager.page_size > 0, "pager.page_size must be > 0");
        anyhow::ensure!(self.pager.concurrency > 0, "pager.concurrency must be > 0");
        if let Some(schedule) = &self.schedule {
            anyhow::ensure!(
                schedule.interval_secs > 0,
                "schedule.interval_secs must be > 0"
            );
        }
        if !self.leagues.is_empty() {
            validate_ladder(&self.leagues)?;
        }
        anyhow::ensure!(!self.tokens.is_empty(), "at least one [[tokens]] entry is required");

        let mut tickers = HashSet::new();
        for token in &self.tokens {
            anyhow::ensure!(
                tickers.insert(token.ticker.to_ascii_uppercase()),
                "duplicate token ticker: {}",
                token.ticker
            );
            checked_table_name(&token.holder_table)?;
            checked_table_name(&token.league_table)?;
            anyhow::ensure!(
                token.holder_table != token.league_table,
                "token {}: holder_table and league_table must differ",
                token.ticker
            );
        }
        Ok(())
    }

    pub fn token(&self, ticker: &str) -> Option<&Token> {
        self.tokens
            .iter()
            .find(|t| t.ticker.eq_ignore_ascii_case(ticker))
    }

    /// Bearer secret for the HTTP trigger, from the environment.
    pub fn cron_secret() -> Result<String> {
        let secret = std::env::var(CRON_SECRET_ENV)
            .with_context(|| format!("{CRON_SECRET_ENV} must be set"))?;
        anyhow::ensure!(!secret.trim().is_empty(), "{CRON_SECRET_ENV} is empty");
        Ok(secret)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[general]
log_level = "info"

[database]
path = "data/leagues.db"

[server]
host = "127.0.0.1"
port = 8080

[pager]
page_size = 1000

[explorer]
timeout_secs = 10

[observability]
prometheus_port = 9095

[[tokens]]
ticker = "ABC"
chain = "ethereum"
holder_table = "holders_abc"
league_table = "leagues_abc"
contract_address = "0x0000000000000000000000000000000000000abc"
explorer_url = "https://explorer.example.org"
match_mode = "lower_bound"
"#;

    #[test]
    fn test_load_default_config() {
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert!(!config.tokens.is_empty());
        assert_eq!(config.pager.page_size, 1000);
        assert!(config.explorer.timeout_secs > 0);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.pager.concurrency, 1);
        assert_eq!(config.pager.delay_ms, 0);
        assert_eq!(config.explorer.cache_ttl_secs, 0);
        assert!(config.schedule.is_none());
        assert!(config.leagues.is_empty());
        assert_eq!(config.tokens[0].match_mode, MatchMode::LowerBound);
        assert!(config.token("abc").is_some());
        assert!(config.token("XYZ").is_none());
    }

    #[test]
    fn test_match_mode_is_required() {
        let toml = MINIMAL.replace("match_mode = \"lower_bound\"\n", "");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let toml = MINIMAL.replace("holders_abc", "holders; DROP TABLE x");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(format!("{err:#}").contains("table name"), "{err:#}");
    }

    #[test]
    fn test_rejects_duplicate_ticker() {
        let second = r#"
[[tokens]]
ticker = "abc"
chain = "base"
holder_table = "holders_abc_base"
league_table = "leagues_abc_base"
contract_address = "0x1"
explorer_url = "https://explorer.example.org"
match_mode = "half_open"
"#;
        let toml = format!("{MINIMAL}{second}");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let toml = MINIMAL.replace("page_size = 1000", "page_size = 0");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_rejects_invalid_league_ladder_at_load() {
        let ladder = r#"
[[leagues]]
name = "Whale"
tag = "WHL"
min_percentage = "1"

[[leagues]]
name = "Fish"
tag = "FSH"
min_percentage = "2"
"#;
        let err = Config::from_toml_str(&format!("{MINIMAL}{ladder}")).unwrap_err();
        assert!(format!("{err:#}").contains("league ladder"), "{err:#}");

        let ok = ladder.replace("min_percentage = \"2\"", "min_percentage = \"0\"");
        let config = Config::from_toml_str(&format!("{MINIMAL}{ok}")).unwrap();
        assert_eq!(config.leagues.len(), 2);
    }
}
