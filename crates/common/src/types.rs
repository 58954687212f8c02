use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::PipelineError;

/// Label of the synthetic aggregate row. Never part of the threshold ladder.
pub const TOTAL_LEAGUE: &str = "TOTAL";

/// How a holder's percentage is matched against the league ladder.
///
/// Both variants exist in production data pipelines and produce different
/// results when a ladder carries explicit upper bounds, so every token has to
/// name the one it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// First bucket (top-down) where `percentage >= min`.
    LowerBound,
    /// First bucket where `min <= percentage < max`.
    HalfOpen,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowerBound => "lower_bound",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Where the TOTAL row's counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    External,
    Fallback,
}

impl CountSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Fallback => "fallback",
        }
    }
}

/// One rung of the league ladder. Percentages are percent of total supply
/// (`10` means 10%).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueDefinition {
    pub name: String,
    pub tag: String,
    pub min_percentage: Decimal,
    /// Exclusive upper bound used by [`MatchMode::HalfOpen`]. When absent the
    /// next-higher bucket's minimum is used (unbounded for the top bucket).
    #[serde(default)]
    pub max_percentage: Option<Decimal>,
}

/// A single holder balance on one snapshot date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderRecord {
    pub address: String,
    pub is_contract: bool,
    pub balance: Decimal,
}

/// One published league row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeagueStatRecord {
    pub league_name: String,
    /// Bucket minimum; `None` for the TOTAL row.
    pub percentage: Option<Decimal>,
    pub all_holders: i64,
    pub user_holders: i64,
    pub last_week_holders: i64,
    pub holder_change: i64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSupplyFigure {
    pub ticker: String,
    pub chain: String,
    pub total_supply_formatted: Decimal,
    pub as_of: NaiveDate,
}

/// Parse a decimal stored as text. Accepts plain and scientific notation
/// (`1.5e3`), which some upstream collectors emit for very large balances.
pub fn parse_decimal(s: &str) -> Result<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .with_context(|| format!("invalid decimal: {s:?}"))
}

/// Check a league ladder: highest threshold first, strictly decreasing
/// minimums, unique names, and a catch-all last bucket with minimum 0.
pub fn validate_ladder(defs: &[LeagueDefinition]) -> std::result::Result<(), PipelineError> {
    let invalid = |msg: String| PipelineError::Configuration(format!("league ladder: {msg}"));

    let Some(last) = defs.last() else {
        return Err(invalid("no buckets defined".to_string()));
    };
    if !last.min_percentage.is_zero() {
        return Err(invalid(format!(
            "last bucket {} must have min_percentage 0 (catch-all)",
            last.name
        )));
    }

    let mut names = HashSet::new();
    for def in defs {
        if def.name.trim().is_empty() {
            return Err(invalid("bucket name must not be empty".to_string()));
        }
        if def.name.eq_ignore_ascii_case(TOTAL_LEAGUE) {
            return Err(invalid(format!("{TOTAL_LEAGUE} is reserved")));
        }
        if !names.insert(def.name.as_str()) {
            return Err(invalid(format!("duplicate bucket {}", def.name)));
        }
        if def.min_percentage.is_sign_negative() {
            return Err(invalid(format!("bucket {} has a negative minimum", def.name)));
        }
        if let Some(max) = def.max_percentage {
            if max <= def.min_percentage {
                return Err(invalid(format!(
                    "bucket {} has max_percentage {max} <= min_percentage {}",
                    def.name, def.min_percentage
                )));
            }
        }
    }
    if let Some(pair) = defs
        .windows(2)
        .find(|w| w[1].min_percentage >= w[0].min_percentage)
    {
        return Err(invalid(format!(
            "minimums must strictly decrease ({} {} then {} {})",
            pair[0].name, pair[0].min_percentage, pair[1].name, pair[1].min_percentage
        )));
    }
    Ok(())
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").with_context(|| format!("invalid date: {s:?}"))
}
