//! Metrics collection.

pub mod handler;

/// Installs the Prometheus recorder when the `prometheus` feature is
/// compiled in. No-op otherwise.
pub fn init() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        use tracing::debug;
        debug!("Prometheus metrics endpoint is enabled");
        if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
            crate::metrics::handler::set_prom_handle(handle.clone());
            use std::time::Duration;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tick.tick().await;
                    handle.run_upkeep();
                }
            });
        }
    }
}

/// Records one `/auth` probe outcome and its latency.
pub fn record_auth_request(outcome: &str, latency_ms: f64) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::{counter, histogram};
        counter!(
            "auth_requests_total",
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!("auth_request_duration_seconds").record(latency_ms / 1000.0);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (outcome, latency_ms);
    }
}

/// Records one token-issuance event (login, user-token mint, or reissue).
pub fn record_token_issued(kind: &str) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::counter;
        counter!("tokens_issued_total", "kind" => kind.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = kind;
    }
}
