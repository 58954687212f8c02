use chrono::{Days, NaiveDate};
use common::error::PipelineError;
use common::types::{LeagueStatRecord, TOTAL_LEAGUE};
use std::collections::HashMap;

use super::classifier::Classification;
use super::reconciler::Reconciled;
use super::store_traits::LeagueStore;

pub const LOOKBACK_DAYS: u64 = 7;

/// Last week's published `user_holders` per label.
///
/// Looks at rows dated within `LOOKBACK_DAYS` of `as_of` and keeps the newest
/// row per label. Labels with no row (or a table that was never published)
/// map to 0. Has to run before the publisher replaces the table.
pub async fn last_week_holders<S: LeagueStore + Sync>(
    store: &S,
    league_table: &str,
    labels: &[&str],
    as_of: NaiveDate,
) -> Result<HashMap<String, i64>, PipelineError> {
    let since = as_of
        .checked_sub_days(Days::new(LOOKBACK_DAYS))
        .unwrap_or(NaiveDate::MIN);
    let rows = store
        .recent_league_rows(league_table, since)
        .await
        .map_err(|e| PipelineError::persistence("history read", &e))?;

    let mut newest: HashMap<&str, i64> = HashMap::new();
    // rows are newest first, so the first hit per label wins
    for row in &rows {
        newest.entry(row.league_name.as_str()).or_insert(row.user_holders);
    }

    Ok(labels
        .iter()
        .map(|label| (label.to_string(), newest.get(label).copied().unwrap_or(0)))
        .collect())
}

/// Ladder rows in order, then TOTAL, all stamped with `date`.
pub fn assemble_snapshot(
    classification: &Classification,
    total: Reconciled,
    last_week: &HashMap<String, i64>,
    date: NaiveDate,
) -> Vec<LeagueStatRecord> {
    let previous = |label: &str| last_week.get(label).copied().unwrap_or(0);

    let mut records: Vec<LeagueStatRecord> = classification
        .buckets
        .iter()
        .map(|b| {
            let last_week_holders = previous(&b.name);
            LeagueStatRecord {
                league_name: b.name.clone(),
                percentage: Some(b.min_percentage),
                all_holders: b.counts.all_holders,
                user_holders: b.counts.user_holders,
                last_week_holders,
                holder_change: b.counts.user_holders - last_week_holders,
                date,
            }
        })
        .collect();

    let last_week_total = previous(TOTAL_LEAGUE);
    records.push(LeagueStatRecord {
        league_name: TOTAL_LEAGUE.to_string(),
        percentage: None,
        all_holders: total.all_holders,
        user_holders: total.user_holders,
        last_week_holders: last_week_total,
        holder_change: total.user_holders - last_week_total,
        date,
    });
    records
}
