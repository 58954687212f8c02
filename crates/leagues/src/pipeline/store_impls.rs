use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::config::Token;
use common::db::{checked_table_name, league_table_ddl, table_exists, AsyncDb};
use common::explorer::{CounterError, ExplorerClient};
use common::types::{parse_date, parse_decimal, HolderRecord, LeagueStatRecord, TokenSupplyFigure};
use rusqlite::OptionalExtension;
use std::time::Instant;

use super::store_traits::*;

impl HolderStore for AsyncDb {
    async fn holder_table_exists(&self, table: &str) -> Result<bool> {
        let table = checked_table_name(table)?.to_string();
        self.call_named("holders.table_exists", move |conn| {
            Ok(table_exists(conn, &table)?)
        })
        .await
    }

    async fn count_holders(&self, table: &str, date: NaiveDate) -> Result<u64> {
        let table = checked_table_name(table)?.to_string();
        let n: i64 = self
            .call_named("holders.count", move |conn| {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE date = ?1"),
                    rusqlite::params![date.to_string()],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn fetch_holder_page(
        &self,
        table: &str,
        date: NaiveDate,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<HolderRecord>> {
        let table = checked_table_name(table)?.to_string();
        let offset = i64::try_from(offset).context("page offset out of range")?;
        self.call_named("holders.page", move |conn| {
            // Balances are decimal text. The REAL cast plus address gives a
            // stable page order; the pager restores exact decimal order.
            let mut stmt = conn.prepare(&format!(
                "SELECT address, is_contract, balance
                 FROM {table}
                 WHERE date = ?1
                 ORDER BY CAST(balance AS REAL) DESC, address ASC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![date.to_string(), i64::from(limit), offset],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(address, is_contract, balance)| {
                    let balance = parse_decimal(&balance)
                        .with_context(|| format!("bad balance for holder {address}"))?;
                    Ok(HolderRecord {
                        address,
                        is_contract: is_contract != 0,
                        balance,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
    }
}

impl SupplyStore for AsyncDb {
    async fn latest_supply(&self, ticker: &str, chain: &str) -> Result<Option<TokenSupplyFigure>> {
        let ticker = ticker.to_string();
        let chain = chain.to_string();
        let row: Option<(String, String, String, String)> = self
            .call_named("supply.latest", move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT ticker, chain, total_supply_formatted, as_of
                         FROM token_supply
                         WHERE ticker = ?1 AND chain = ?2
                         ORDER BY as_of DESC, id DESC
                         LIMIT 1",
                        rusqlite::params![ticker, chain],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(ticker, chain, supply, as_of)| {
            Ok::<_, anyhow::Error>(TokenSupplyFigure {
                total_supply_formatted: parse_decimal(&supply)
                    .with_context(|| format!("bad supply figure for {ticker}/{chain}"))?,
                as_of: parse_date(&as_of)?,
                ticker,
                chain,
            })
        })
        .transpose()
    }
}

impl LeagueStore for AsyncDb {
    async fn recent_league_rows(
        &self,
        table: &str,
        since: NaiveDate,
    ) -> Result<Vec<LeagueStatRecord>> {
        type LeagueRow = (String, Option<String>, i64, i64, i64, i64, String);

        let table = checked_table_name(table)?.to_string();
        let rows: Vec<LeagueRow> = self
            .call_named("leagues.recent_rows", move |conn| {
                if !table_exists(conn, &table)? {
                    return Ok(Vec::new());
                }
                let mut stmt = conn.prepare(&format!(
                    "SELECT league_name, percentage, all_holders, user_holders,
                            last_week_holders, holder_change, date
                     FROM {table}
                     WHERE date >= ?1
                     ORDER BY date DESC, id DESC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![since.to_string()], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(league_name, percentage, all, users, last_week, change, date)| {
                Ok::<_, anyhow::Error>(LeagueStatRecord {
                    percentage: percentage.as_deref().map(parse_decimal).transpose()?,
                    date: parse_date(&date)?,
                    league_name,
                    all_holders: all,
                    user_holders: users,
                    last_week_holders: last_week,
                    holder_change: change,
                })
            })
            .collect()
    }

    async fn replace_league_rows(&self, table: &str, records: Vec<LeagueStatRecord>) -> Result<()> {
        let table = checked_table_name(table)?.to_string();
        self.call_named("leagues.replace_all", move |conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&league_table_ddl(&table))?;
            tx.execute(&format!("DELETE FROM {table}"), [])?;
            {
                let mut ins = tx.prepare(&format!(
                    "INSERT INTO {table}
                        (league_name, percentage, all_holders, user_holders,
                         last_week_holders, holder_change, date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ))?;
                for r in &records {
                    ins.execute(rusqlite::params![
                        r.league_name,
                        r.percentage.map(|p| p.to_string()),
                        r.all_holders,
                        r.user_holders,
                        r.last_week_holders,
                        r.holder_change,
                        r.date.to_string(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

/// A lease older than this belongs to a run that died without releasing it.
const LEASE_STALE_AFTER_SECS: i64 = 6 * 60 * 60;

impl LeaseStore for AsyncDb {
    async fn try_acquire_lease(&self, ticker: &str, holder: &str) -> Result<bool> {
        let ticker = ticker.to_ascii_uppercase();
        let holder = holder.to_string();
        let now = chrono::Utc::now().timestamp();
        self.call_named("leases.acquire", move |conn| {
            let changed = conn.execute(
                "INSERT INTO league_locks (ticker, holder, acquired_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(ticker) DO UPDATE
                    SET holder = excluded.holder, acquired_at = excluded.acquired_at
                    WHERE league_locks.acquired_at < ?4",
                rusqlite::params![ticker, holder, now, now - LEASE_STALE_AFTER_SECS],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release_lease(&self, ticker: &str, holder: &str) -> Result<()> {
        let ticker = ticker.to_ascii_uppercase();
        let holder = holder.to_string();
        self.call_named("leases.release", move |conn| {
            conn.execute(
                "DELETE FROM league_locks WHERE ticker = ?1 AND holder = ?2",
                rusqlite::params![ticker, holder],
            )?;
            Ok(())
        })
        .await
    }
}

impl HolderCounter for ExplorerClient {
    async fn holder_count(&self, token: &Token) -> std::result::Result<u64, CounterError> {
        let start = Instant::now();
        let res = self
            .fetch_holder_count(&token.explorer_url, &token.contract_address)
            .await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("leagues_explorer_latency_ms", "chain" => token.chain.clone())
            .record(ms);
        match &res {
            Ok(_) => {
                metrics::counter!("leagues_explorer_requests_total", "status" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!("leagues_explorer_requests_total", "status" => "error")
                    .increment(1);
                metrics::counter!("leagues_explorer_errors_total", "kind" => e.kind()).increment(1);
            }
        }
        res
    }
}
