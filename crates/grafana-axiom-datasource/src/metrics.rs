//! Prometheus metrics exposed through Grafana's plugin metrics endpoint.
use std::fmt;

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::query::TargetOutcome;

const NAMESPACE: &str = "axiom_datasource";

/// Counters describing the work done by the plugin.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    queries: IntCounterVec,
    schema_fetches: IntCounterVec,
    health_checks: IntCounterVec,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

fn outcome_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &["outcome"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create and register the plugin's metrics in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            queries: outcome_counter(
                &registry,
                "queries_total",
                "Query targets processed, by outcome (ok, empty or error).",
            )?,
            schema_fetches: outcome_counter(
                &registry,
                "schema_fetches_total",
                "Dataset schema lookups against Axiom, by outcome.",
            )?,
            health_checks: outcome_counter(
                &registry,
                "health_checks_total",
                "Health checks run, by outcome.",
            )?,
            registry,
        })
    }

    /// Count a processed query target.
    pub fn record_query(&self, outcome: &TargetOutcome) {
        let label = match &outcome.result {
            Ok(_) if outcome.executed_apl.trim().is_empty() => "empty",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        self.queries.with_label_values(&[label]).inc();
    }

    /// Count a dataset schema lookup.
    pub fn record_schema_fetch(&self, ok: bool) {
        self.schema_fetches
            .with_label_values(&[if ok { "ok" } else { "error" }])
            .inc();
    }

    /// Count a health check.
    pub fn record_health_check(&self, ok: bool) {
        self.health_checks
            .with_label_values(&[if ok { "ok" } else { "error" }])
            .inc();
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
