use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "sorter_classifications_total",
            "Items sorted, labelled by the stage that produced the category."
        );
        describe_counter!(
            "sorter_inference_calls_total",
            "Backend calls, labelled by backend and outcome."
        );
        describe_counter!(
            "sorter_rate_limited_total",
            "Inference calls refused because the window budget was spent."
        );
        describe_counter!("sorter_cache_hits_total", "Classifications served from the fingerprint cache.");
        describe_counter!("sorter_folders_created_total", "Category folders created on disk.");
        describe_counter!("sorter_backup_cycles_total", "Backup cycles, labelled by outcome.");
        describe_gauge!(
            "sorter_backup_last_success_ts",
            "Unix ts of the last backup cycle that left nothing pending."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already set.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
