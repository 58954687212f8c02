use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::config::Config;
use common::db::AsyncDb;
use common::types::LeagueStatRecord;

use crate::pipeline::store_traits::LeagueStore;
use crate::pipeline::tracker::{recent_runs, RunRecord};

const DEFAULT_RUNS_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    RunOnce { date: Option<NaiveDate> },
    Show { ticker: String },
    Runs { limit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// `--config <path>`; otherwise `LEAGUES_CONFIG` or the default path.
    pub config_path: Option<String>,
    pub command: Command,
}

pub const USAGE: &str = "usage: leagues [--config <path>] \
    [serve | run-once [YYYY-MM-DD] | show <ticker> | runs [limit]]";

pub fn parse_args<I>(mut args: I) -> std::result::Result<Invocation, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let mut config_path = None;
    let mut cmd = args.next();
    while cmd.as_deref() == Some("--config") {
        config_path = Some(args.next().ok_or_else(|| USAGE.to_string())?);
        cmd = args.next();
    }

    let Some(cmd) = cmd else {
        return Ok(Invocation {
            config_path,
            command: Command::Serve,
        });
    };

    let command = match cmd.as_str() {
        "serve" => Command::Serve,
        "run-once" => {
            let date = args
                .next()
                .map(|d| common::types::parse_date(&d).map_err(|e| format!("{e:#}")))
                .transpose()?;
            Command::RunOnce { date }
        }
        "show" => {
            let ticker = args
                .next()
                .ok_or_else(|| "usage: leagues show <ticker>".to_string())?;
            Command::Show { ticker }
        }
        "runs" => {
            let limit = match args.next() {
                Some(n) => n
                    .parse::<u32>()
                    .map_err(|e| format!("runs limit {n:?}: {e}"))?,
                None => DEFAULT_RUNS_LIMIT,
            };
            Command::Runs { limit }
        }
        "-h" | "--help" | "help" => return Err(USAGE.to_string()),
        other => return Err(format!("unknown command: {other}\n{USAGE}")),
    };

    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument: {extra}\n{USAGE}"));
    }
    Ok(Invocation {
        config_path,
        command,
    })
}

/// Published snapshot for `ticker`, ladder order with TOTAL last.
pub async fn query_league_table(
    db: &AsyncDb,
    cfg: &Config,
    ticker: &str,
) -> Result<Vec<LeagueStatRecord>> {
    let token = cfg
        .token(ticker)
        .with_context(|| format!("unknown ticker {ticker}"))?;
    let mut rows = db.recent_league_rows(&token.league_table, NaiveDate::MIN).await?;
    // newest insert first; the table only ever holds one snapshot
    rows.reverse();
    Ok(rows)
}

pub fn format_league_row(r: &LeagueStatRecord) -> String {
    let pct = r
        .percentage
        .map_or_else(|| "-".to_string(), |p| format!("{p}%"));
    format!(
        "{name:<10} {pct:>10}  all={all:<8} users={users:<8} last_week={lw:<8} change={change:+}",
        name = r.league_name,
        all = r.all_holders,
        users = r.user_holders,
        lw = r.last_week_holders,
        change = r.holder_change,
    )
}

pub async fn show_league(db: &AsyncDb, cfg: &Config, ticker: &str) -> Result<()> {
    let rows = query_league_table(db, cfg, ticker).await?;
    match rows.first() {
        Some(first) => println!("{} leagues (snapshot {}):", ticker.to_uppercase(), first.date),
        None => {
            println!("{}: nothing published yet", ticker.to_uppercase());
            return Ok(());
        }
    }
    for r in &rows {
        println!("{}", format_league_row(r));
    }
    Ok(())
}

fn format_run(r: &RunRecord) -> String {
    let duration = r
        .duration_ms
        .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
    let mut line = format!(
        "#{id:<5} {status:<9} {trigger:<8} date={date}  started={started}  took={duration}",
        id = r.id,
        status = r.status,
        trigger = r.trigger,
        date = r.snapshot_date,
        started = r.started_at,
    );
    if let Some(err) = &r.error {
        line.push_str("  error=");
        line.push_str(err);
    }
    line
}

pub async fn show_runs(db: &AsyncDb, limit: u32) -> Result<()> {
    let runs = recent_runs(db, limit).await?;
    if runs.is_empty() {
        println!("no league runs recorded");
    }
    for r in &runs {
        println!("{}", format_run(r));
    }
    Ok(())
}
