use metrics_exporter_prometheus::PrometheusBuilder;

// Exercises the public surface (`common::observability`) rather than private layers.

#[test]
fn tracing_error_events_counter_increments_on_error_event() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, _otel_guard) =
            common::observability::build_dispatch("leagues-test", "info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(ticker = "ABC", "publish failed");
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("tracing_error_events"),
        "expected tracing_error_events in rendered metrics, got:\n{rendered}"
    );
}

#[test]
fn warn_events_do_not_count_as_errors() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, _otel_guard) =
            common::observability::build_dispatch("leagues-test", "info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::warn!(ticker = "ABC", "explorer fallback used");
        });
    });

    assert!(!handle.render().contains("tracing_error_events"));
}
