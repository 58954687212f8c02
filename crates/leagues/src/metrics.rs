use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "leagues_tokens_processed_total",
        "Token runs finished, by final status."
    );
    describe_counter!(
        "leagues_token_failures_total",
        "Failed token runs, by error kind."
    );
    describe_histogram!(
        "leagues_token_duration_ms",
        "Wall time of one token's run in milliseconds."
    );
    describe_histogram!(
        "leagues_run_duration_ms",
        "Wall time of a full pipeline run in milliseconds."
    );
    describe_counter!(
        "leagues_holder_pages_fetched_total",
        "Holder pages read from the holder store."
    );
    describe_counter!(
        "leagues_holders_classified_total",
        "Holders assigned to a league bucket."
    );
    describe_counter!(
        "leagues_total_source_total",
        "TOTAL rows by source (external or fallback)."
    );
    describe_counter!(
        "leagues_rows_published_total",
        "League rows written by the publisher."
    );
    describe_counter!(
        "leagues_explorer_requests_total",
        "Explorer holder-count requests, by outcome."
    );
    describe_counter!(
        "leagues_explorer_errors_total",
        "Explorer holder-count failures, by kind."
    );
    describe_histogram!(
        "leagues_explorer_latency_ms",
        "Explorer holder-count latency in milliseconds."
    );
    describe_counter!(
        "leagues_trigger_unauthorized_total",
        "Trigger requests rejected for a missing or wrong secret."
    );
    describe_histogram!(
        "leagues_db_query_latency_ms",
        "SQLite operation latency in milliseconds."
    );
    describe_counter!(
        "leagues_db_query_errors_total",
        "Failed SQLite operations."
    );
}

/// Serve the scrape endpoint on `port` and make it the global recorder.
/// Must run inside the Tokio runtime.
pub fn install_prometheus(port: u16) -> Result<()> {
    let recorder = spawn_exporter(([0, 0, 0, 0], port).into())?;
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("install prometheus recorder: {e}"))?;
    tracing::info!(port, "prometheus exporter listening");
    Ok(())
}

/// Bind the scrape listener on `addr` and drive it on the current runtime.
fn spawn_exporter(addr: SocketAddr) -> Result<PrometheusRecorder> {
    let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "prometheus exporter stopped");
        }
    });
    Ok(recorder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_pipeline_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("leagues_tokens_processed_total", "status" => "PUBLISHED")
                .increment(2);
            metrics::counter!("leagues_total_source_total", "source" => "fallback").increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("leagues_tokens_processed_total{status=\"PUBLISHED\"} 2"));
        assert!(rendered.contains("leagues_total_source_total{source=\"fallback\"} 1"));
        assert!(rendered.contains("# HELP leagues_tokens_processed_total"));
    }

    #[tokio::test]
    async fn test_exporter_answers_scrapes_on_its_port() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let recorder = spawn_exporter(([127, 0, 0, 1], port).into()).unwrap();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("leagues_rows_published_total").increment(9);
        });

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/metrics"))
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body = resp.text().await.unwrap();
        assert!(body.contains("leagues_rows_published_total 9"), "{body}");
    }
}
