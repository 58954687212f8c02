use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

mod api;
mod cli;
mod metrics;
mod pipeline;
mod scheduler;

use common::config::Config;
use common::db::AsyncDb;
use common::explorer::ExplorerClient;
use pipeline::classifier::LeagueLadder;
use pipeline::orchestrator::Orchestrator;
use pipeline::pager::PagerSettings;
use pipeline::tracker::{run_tracked, RunTrigger};

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    let config = match &invocation.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("holder_leagues", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = AsyncDb::open(&config.database.path).await?;

    match invocation.command {
        cli::Command::Show { ticker } => return cli::show_league(&db, &config, &ticker).await,
        cli::Command::Runs { limit } => return cli::show_runs(&db, limit).await,
        cli::Command::RunOnce { date } => {
            let orchestrator = build_orchestrator(&config, db.clone())?;
            let date = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
            let report = run_tracked(&db, &orchestrator, RunTrigger::Cli, date).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        cli::Command::Serve => {}
    }

    // Refuse to expose the trigger without a secret.
    let cron_secret = Config::cron_secret()?;

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let orchestrator = Arc::new(build_orchestrator(&config, db.clone())?);

    if let Some(schedule) = &config.schedule {
        let (tick_tx, mut tick_rx) = tokio::sync::mpsc::channel::<()>(1);
        let _scheduler = scheduler::start(scheduler::ScheduleSpec::from_config(schedule, tick_tx));
        tokio::spawn({
            let db = db.clone();
            let orchestrator = orchestrator.clone();
            async move {
                while tick_rx.recv().await.is_some() {
                    let date = chrono::Utc::now().date_naive();
                    let res =
                        run_tracked(&db, orchestrator.as_ref(), RunTrigger::Schedule, date).await;
                    match res {
                        Ok(report) => tracing::info!(
                            %date,
                            published = pipeline::orchestrator::published_count(&report),
                            "scheduled league run done"
                        ),
                        Err(e) => tracing::error!(error = %e, "scheduled league run failed"),
                    }
                }
            }
        });
        tracing::info!(
            interval_secs = schedule.interval_secs,
            run_immediately = schedule.run_immediately,
            "league schedule enabled"
        );
    }

    let state = Arc::new(api::AppState {
        db,
        orchestrator,
        cron_secret,
        started_at: chrono::Utc::now(),
    });
    let app = api::router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, tokens = config.tokens.len(), "holder_leagues listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}

fn build_orchestrator(config: &Config, db: AsyncDb) -> Result<api::LeagueOrchestrator> {
    let ladder = LeagueLadder::from_config(&config.leagues)?;
    let explorer = ExplorerClient::new(
        Duration::from_secs(config.explorer.timeout_secs),
        Duration::from_millis(config.explorer.request_delay_ms),
        Duration::from_secs(config.explorer.cache_ttl_secs),
    )?;
    Ok(Orchestrator::new(
        db,
        explorer,
        ladder,
        config.tokens.clone(),
        PagerSettings::from(&config.pager),
    ))
}
