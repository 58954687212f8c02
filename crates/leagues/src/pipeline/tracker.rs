use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::db::AsyncDb;
use serde::Serialize;
use std::time::Instant;

use super::orchestrator::{Orchestrator, PipelineStore, RunReport, TokenStatus};
use super::store_traits::HolderCounter;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Http,
    Schedule,
    Cli,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Schedule => "schedule",
            Self::Cli => "cli",
        }
    }
}

/// One `league_runs` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub trigger: String,
    pub snapshot_date: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

pub struct RunTracker {
    db: AsyncDb,
    run_id: i64,
    start_time: Instant,
}

impl RunTracker {
    pub async fn start(db: &AsyncDb, trigger: RunTrigger, date: NaiveDate) -> Result<Self> {
        let trigger = trigger.as_str();
        let run_id = db
            .call_named("run_tracker.start", move |conn| {
                conn.execute(
                    "INSERT INTO league_runs (trigger, snapshot_date, status, started_at)
                     VALUES (?1, ?2, 'running', datetime('now'))",
                    rusqlite::params![trigger, date.to_string()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        Ok(Self {
            db: db.clone(),
            run_id,
            start_time: Instant::now(),
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    async fn finish(
        self,
        status: &'static str,
        report: &RunReport,
        error: Option<String>,
    ) -> Result<()> {
        let duration_ms = i64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(i64::MAX);
        let report_json = serde_json::to_string(report).context("serialize run report")?;
        let id = self.run_id;

        self.db
            .call_named("run_tracker.finish", move |conn| {
                conn.execute(
                    "UPDATE league_runs SET
                        status = ?2,
                        finished_at = datetime('now'),
                        duration_ms = ?3,
                        report_json = ?4,
                        error = ?5
                     WHERE id = ?1",
                    rusqlite::params![id, status, duration_ms, report_json, error],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn complete(self, report: &RunReport) -> Result<()> {
        self.finish("completed", report, None).await
    }

    pub async fn fail(self, report: &RunReport, error: String) -> Result<()> {
        self.finish("failed", report, Some(error)).await
    }
}

/// Run the pipeline with a `league_runs` record around it.
///
/// Fails only when the run cannot be recorded as started, i.e. before any
/// token is touched. A run with failed tokens is stored as `failed` but
/// still returns its report.
pub async fn run_tracked<S, C>(
    db: &AsyncDb,
    orchestrator: &Orchestrator<S, C>,
    trigger: RunTrigger,
    date: NaiveDate,
) -> Result<RunReport>
where
    S: PipelineStore,
    C: HolderCounter + Send + Sync,
{
    let tracker = RunTracker::start(db, trigger, date)
        .await
        .context("record league run start")?;
    let run_id = tracker.run_id();
    let started = Instant::now();

    let report = orchestrator.run(date).await;

    metrics::histogram!("leagues_run_duration_ms", "trigger" => trigger.as_str())
        .record(started.elapsed().as_secs_f64() * 1000.0);

    let failed: Vec<&str> = report
        .iter()
        .filter(|(_, r)| r.status == TokenStatus::Failed)
        .map(|(ticker, _)| ticker.as_str())
        .collect();
    let recorded = if failed.is_empty() {
        tracker.complete(&report).await
    } else {
        let msg = format!(
            "{} of {} tokens failed: {}",
            failed.len(),
            report.len(),
            failed.join(", ")
        );
        tracker.fail(&report, msg).await
    };
    if let Err(e) = recorded {
        tracing::warn!(run_id, error = %e, "failed to record league run outcome");
    }

    Ok(report)
}

pub async fn recent_runs(db: &AsyncDb, limit: u32) -> Result<Vec<RunRecord>> {
    db.call_named("run_tracker.recent", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, trigger, snapshot_date, status, started_at, finished_at, duration_ms, error
             FROM league_runs
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    trigger: row.get(1)?,
                    snapshot_date: row.get(2)?,
                    status: row.get(3)?,
                    started_at: row.get(4)?,
                    finished_at: row.get(5)?,
                    duration_ms: row.get(6)?,
                    error: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::LeagueLadder;
    use crate::pipeline::pager::PagerSettings;
    use common::config::Token;
    use common::explorer::CounterError;
    use common::types::MatchMode;

    struct NoCounter;

    impl HolderCounter for NoCounter {
        async fn holder_count(&self, _token: &Token) -> Result<u64, CounterError> {
            Err(CounterError::Malformed("unused".to_string()))
        }
    }

    fn token(ticker: &str, holder_table: &str) -> Token {
        Token {
            ticker: ticker.to_string(),
            chain: "base".to_string(),
            holder_table: holder_table.to_string(),
            league_table: format!("leagues_{}", ticker.to_lowercase()),
            contract_address: "0x1".to_string(),
            explorer_url: "https://explorer.invalid".to_string(),
            match_mode: MatchMode::HalfOpen,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    fn orchestrator(db: &AsyncDb, tokens: Vec<Token>) -> Orchestrator<AsyncDb, NoCounter> {
        Orchestrator::new(
            db.clone(),
            NoCounter,
            LeagueLadder::standard(),
            tokens,
            PagerSettings {
                page_size: 100,
                concurrency: 1,
                delay: std::time::Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_all_skipped_run_is_completed() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let orch = orchestrator(&db, vec![token("ABC", "holders_abc")]);

        let report = run_tracked(&db, &orch, RunTrigger::Cli, day()).await.unwrap();
        assert_eq!(report["ABC"].status, TokenStatus::Skipped);

        let runs = recent_runs(&db, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, "cli");
        assert_eq!(runs[0].snapshot_date, "2026-03-09");
        assert_eq!(runs[0].status, "completed");
        assert!(runs[0].finished_at.is_some());
        assert!(runs[0].error.is_none());
    }

    #[tokio::test]
    async fn test_failed_token_marks_run_failed_with_report() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            conn.execute_batch(&common::db::holder_table_ddl("holders_abc"))?;
            Ok(())
        })
        .await
        .unwrap();
        // table exists but no supply figure
        let orch = orchestrator(&db, vec![token("ABC", "holders_abc")]);

        let report = run_tracked(&db, &orch, RunTrigger::Http, day()).await.unwrap();
        assert_eq!(report["ABC"].status, TokenStatus::Failed);

        let runs = recent_runs(&db, 10).await.unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].error.as_deref(), Some("1 of 1 tokens failed: ABC"));

        let stored: String = db
            .call(|conn| {
                Ok(conn.query_row("SELECT report_json FROM league_runs LIMIT 1", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(json["ABC"]["status"], "FAILED");
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first_and_limited() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let orch = orchestrator(&db, Vec::new());
        for trigger in [RunTrigger::Cli, RunTrigger::Schedule, RunTrigger::Http] {
            run_tracked(&db, &orch, trigger, day()).await.unwrap();
        }
        let runs = recent_runs(&db, 2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].trigger, "http");
        assert_eq!(runs[1].trigger, "schedule");
    }

    #[tokio::test]
    async fn test_start_failure_is_an_error() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            conn.execute_batch("DROP TABLE league_runs")?;
            Ok(())
        })
        .await
        .unwrap();
        let orch = orchestrator(&db, vec![token("ABC", "holders_abc")]);
        let err = run_tracked(&db, &orch, RunTrigger::Http, day()).await.unwrap_err();
        assert!(format!("{err:#}").contains("league_runs"), "{err:#}");
    }
}
