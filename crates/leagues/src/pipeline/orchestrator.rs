use chrono::NaiveDate;
use common::config::Token;
use common::db::checked_table_name;
use common::error::PipelineError;
use common::types::{CountSource, MatchMode, TOTAL_LEAGUE};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::Instrument;

use super::classifier::{classify, LeagueLadder};
use super::history::{assemble_snapshot, last_week_holders};
use super::pager::{fetch_all_holders, PagerSettings};
use super::publisher::publish;
use super::reconciler::reconcile;
use super::store_traits::{HolderCounter, HolderStore, LeagueStore, LeaseStore, SupplyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Pending,
    Skipped,
    SupplyFetched,
    Classified,
    Reconciled,
    Published,
    Failed,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Skipped => "SKIPPED",
            Self::SupplyFetched => "SUPPLY_FETCHED",
            Self::Classified => "CLASSIFIED",
            Self::Reconciled => "RECONCILED",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }
}

/// Outcome for one token. Fields fill in as the token advances, so a failed
/// token still shows how far it got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReport {
    pub status: TokenStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_supply: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_holders_from_external_source: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_source: Option<CountSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holders_classified: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenReport {
    fn pending() -> Self {
        Self {
            status: TokenStatus::Pending,
            total_supply: None,
            total_holders_from_external_source: None,
            total_source: None,
            holders_classified: None,
            date: None,
            reason: None,
            error: None,
        }
    }

    fn skipped(reason: String) -> Self {
        Self {
            status: TokenStatus::Skipped,
            reason: Some(reason),
            ..Self::pending()
        }
    }
}

/// Ticker -> outcome, ordered by ticker.
pub type RunReport = BTreeMap<String, TokenReport>;

pub fn published_count(report: &RunReport) -> usize {
    report
        .values()
        .filter(|r| r.status == TokenStatus::Published)
        .count()
}

/// One async mutex per ticker, shared by every trigger path in this process.
/// Other processes are kept out by the [`LeaseStore`] lease.
#[derive(Default)]
pub struct TickerLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TickerLocks {
    /// `None` when another run already holds the ticker.
    pub fn try_acquire(&self, ticker: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(ticker.to_ascii_uppercase()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}

fn skip_busy(reason: &str) -> TokenReport {
    metrics::counter!("leagues_tokens_processed_total", "status" => "SKIPPED").increment(1);
    TokenReport::skipped(reason.to_string())
}

/// Store side of the pipeline: holder snapshots, supply figures, published
/// league tables and run leases.
pub trait PipelineStore: HolderStore + SupplyStore + LeagueStore + LeaseStore + Send + Sync {}

impl<T: HolderStore + SupplyStore + LeagueStore + LeaseStore + Send + Sync> PipelineStore for T {}

pub struct Orchestrator<S, C> {
    store: S,
    counter: C,
    ladder: LeagueLadder,
    tokens: Vec<Token>,
    pager: PagerSettings,
    locks: TickerLocks,
    /// Identifies this orchestrator's leases in the shared database.
    lease_holder: String,
}

impl<S: PipelineStore, C: HolderCounter + Send + Sync> Orchestrator<S, C> {
    pub fn new(
        store: S,
        counter: C,
        ladder: LeagueLadder,
        tokens: Vec<Token>,
        pager: PagerSettings,
    ) -> Self {
        if ladder.has_gaps() {
            for t in tokens.iter().filter(|t| t.match_mode == MatchMode::HalfOpen) {
                tracing::warn!(
                    ticker = %t.ticker,
                    "league ladder has gaps; half_open holders inside a gap fall to the \
                     lowest bucket"
                );
            }
        }
        Self {
            store,
            counter,
            ladder,
            tokens,
            pager,
            locks: TickerLocks::default(),
            lease_holder: format!(
                "pid{}-{}",
                std::process::id(),
                chrono::Utc::now().timestamp_micros()
            ),
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Run every configured token for `date`, one after another. A token's
    /// failure is recorded in its report entry and never stops the rest.
    pub async fn run(&self, date: NaiveDate) -> RunReport {
        let mut report = RunReport::new();
        for token in &self.tokens {
            let span = tracing::info_span!("token_run", ticker = %token.ticker, %date);
            let outcome = self.run_token(token, date).instrument(span).await;
            report.insert(token.ticker.clone(), outcome);
        }
        tracing::info!(
            %date,
            tokens = report.len(),
            published = published_count(&report),
            "league run finished"
        );
        report
    }

    pub async fn run_token(&self, token: &Token, date: NaiveDate) -> TokenReport {
        let Some(_guard) = self.locks.try_acquire(&token.ticker) else {
            tracing::warn!("another run holds this ticker, skipping");
            return skip_busy("run already in progress for this ticker");
        };
        match self.store.try_acquire_lease(&token.ticker, &self.lease_holder).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("another process holds this ticker's lease, skipping");
                return skip_busy("run already in progress in another process");
            }
            Err(e) => {
                let e = PipelineError::persistence("lease acquire", &e);
                tracing::error!(kind = e.kind(), error = %e, "token run failed");
                metrics::counter!("leagues_token_failures_total", "kind" => e.kind()).increment(1);
                metrics::counter!("leagues_tokens_processed_total", "status" => "FAILED")
                    .increment(1);
                return TokenReport {
                    status: TokenStatus::Failed,
                    error: Some(e.to_string()),
                    ..TokenReport::pending()
                };
            }
        }

        let start = Instant::now();
        let mut out = TokenReport::pending();
        if let Err(e) = self.process(token, date, &mut out).await {
            tracing::error!(
                kind = e.kind(),
                error = %e,
                stage = out.status.as_str(),
                "token run failed"
            );
            metrics::counter!("leagues_token_failures_total", "kind" => e.kind()).increment(1);
            out.status = TokenStatus::Failed;
            out.error = Some(e.to_string());
        }
        if let Err(e) = self.store.release_lease(&token.ticker, &self.lease_holder).await {
            // It goes stale and is taken over on a later run.
            tracing::warn!(error = %e, "failed to release ticker lease");
        }
        metrics::counter!("leagues_tokens_processed_total", "status" => out.status.as_str())
            .increment(1);
        metrics::histogram!("leagues_token_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        out
    }

    async fn process(
        &self,
        token: &Token,
        date: NaiveDate,
        out: &mut TokenReport,
    ) -> Result<(), PipelineError> {
        let holder_table = checked_table_name(&token.holder_table)?;
        let league_table = checked_table_name(&token.league_table)?;

        let exists = self
            .store
            .holder_table_exists(holder_table)
            .await
            .map_err(|e| PipelineError::fetch("holder table lookup", &e))?;
        if !exists {
            tracing::info!(table = holder_table, "holder table absent, skipping");
            out.status = TokenStatus::Skipped;
            out.reason = Some(format!("holder table {holder_table} does not exist"));
            return Ok(());
        }
        out.date = Some(date);

        let supply = self
            .store
            .latest_supply(&token.ticker, &token.chain)
            .await
            .map_err(|e| PipelineError::fetch("supply read", &e))?
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "no total supply recorded for {} on {}",
                    token.ticker, token.chain
                ))
            })?;
        out.status = TokenStatus::SupplyFetched;
        out.total_supply = Some(supply.total_supply_formatted);

        let holders = fetch_all_holders(&self.store, holder_table, date, self.pager).await?;
        if holders.is_empty() {
            tracing::info!("no holders on this date, publishing a zeroed snapshot");
        }
        let classification = classify(
            &holders,
            supply.total_supply_formatted,
            &self.ladder,
            token.match_mode,
        );
        out.status = TokenStatus::Classified;
        out.holders_classified = Some(holders.len());
        metrics::counter!("leagues_holders_classified_total").increment(holders.len() as u64);
        drop(holders);

        let total = reconcile(
            &self.counter,
            token,
            classification.classified_all(),
            classification.classified_users(),
        )
        .await;
        out.status = TokenStatus::Reconciled;
        out.total_source = Some(total.source);
        if total.source == CountSource::External {
            out.total_holders_from_external_source = Some(total.all_holders);
        }

        let labels: Vec<&str> = self
            .ladder
            .definitions()
            .map(|d| d.name.as_str())
            .chain(std::iter::once(TOTAL_LEAGUE))
            .collect();
        let last_week = last_week_holders(&self.store, league_table, &labels, date).await?;
        let records = assemble_snapshot(&classification, total, &last_week, date);

        publish(&self.store, &token.ticker, league_table, records).await?;
        out.status = TokenStatus::Published;
        Ok(())
    }
}
