use common::error::PipelineError;
use common::types::LeagueStatRecord;

use super::store_traits::LeagueStore;

/// Replace the token's published league table with `records`.
///
/// Delete-all and insert commit together; on failure the previous snapshot
/// is left untouched. Returns the number of rows written.
pub async fn publish<S: LeagueStore + Sync>(
    store: &S,
    ticker: &str,
    league_table: &str,
    records: Vec<LeagueStatRecord>,
) -> Result<usize, PipelineError> {
    let n = records.len();
    store
        .replace_league_rows(league_table, records)
        .await
        .map_err(|e| PipelineError::persistence(&format!("publish {league_table}"), &e))?;
    metrics::counter!("leagues_rows_published_total").increment(n as u64);
    tracing::info!(ticker, table = league_table, rows = n, "league snapshot published");
    Ok(n)
}
