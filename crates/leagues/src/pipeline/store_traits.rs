use anyhow::Result;
use chrono::NaiveDate;
use common::config::Token;
use common::explorer::CounterError;
use common::types::{HolderRecord, LeagueStatRecord, TokenSupplyFigure};

/// Per-token holder snapshots, one table per token, addressed by exact date.
pub trait HolderStore {
    fn holder_table_exists(
        &self,
        table: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn count_holders(
        &self,
        table: &str,
        date: NaiveDate,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// One page ordered by balance descending, address breaking ties, so pages
    /// never overlap. The order only has to be stable across pages; callers
    /// re-sort the drained set exactly.
    fn fetch_holder_page(
        &self,
        table: &str,
        date: NaiveDate,
        offset: u64,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<HolderRecord>>> + Send;
}

pub trait SupplyStore {
    fn latest_supply(
        &self,
        ticker: &str,
        chain: &str,
    ) -> impl std::future::Future<Output = Result<Option<TokenSupplyFigure>>> + Send;
}

/// Published league tables. Each table holds only the latest snapshot.
pub trait LeagueStore {
    /// Rows with `date >= since`, newest first. A missing table reads as empty.
    fn recent_league_rows(
        &self,
        table: &str,
        since: NaiveDate,
    ) -> impl std::future::Future<Output = Result<Vec<LeagueStatRecord>>> + Send;

    /// Delete every row and insert `records` as one transaction.
    fn replace_league_rows(
        &self,
        table: &str,
        records: Vec<LeagueStatRecord>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Exclusive per-ticker lease shared by every process on the database.
pub trait LeaseStore {
    /// `true` when `holder` now owns the lease, `false` when someone else does.
    fn try_acquire_lease(
        &self,
        ticker: &str,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Drop the lease if `holder` still owns it.
    fn release_lease(
        &self,
        ticker: &str,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Authoritative holder count from outside the local sample.
pub trait HolderCounter {
    fn holder_count(
        &self,
        token: &Token,
    ) -> impl std::future::Future<Output = std::result::Result<u64, CounterError>> + Send;
}
