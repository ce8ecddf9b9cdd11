//! Query orchestration: variable substitution, one APL request per target, and result
//! shaping.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::{
    client::AplClient,
    error::Result,
    table::{select_tables, ResultTable},
};

/// The maximum number of target queries in flight for one request.
pub const MAX_CONCURRENT_QUERIES: usize = 10;

/// How many days back the connectivity probe looks.
pub const PROBE_WINDOW_DAYS: i64 = 7;

/// The query model sent by the query editor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AxiomQuery {
    /// The APL query text.
    pub apl: String,
    /// Whether to return the totals table of a grouped query alongside the result.
    pub totals: bool,
    /// Overrides the start of the dashboard time range.
    #[serde(deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Overrides the end of the dashboard time range.
    #[serde(deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// The query editor sends empty strings for unset time overrides.
fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom),
    }
}

/// Substitutes template variables into query text.
pub trait ApplyVariables {
    /// Return `apl` with every known variable replaced by its value.
    fn apply_variables(&self, apl: &str) -> String;
}

/// Grafana's global time variables, which the browser leaves for the backend to resolve
/// in alerting and public dashboard queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeVariables {
    /// Substituted for `$__from` and `${__from}`, in epoch milliseconds.
    pub from: DateTime<Utc>,
    /// Substituted for `$__to` and `${__to}`, in epoch milliseconds.
    pub to: DateTime<Utc>,
    /// Substituted for `$__interval_ms`.
    pub interval: Duration,
}

impl ApplyVariables for TimeVariables {
    fn apply_variables(&self, apl: &str) -> String {
        let from = self.from.timestamp_millis().to_string();
        let to = self.to.timestamp_millis().to_string();
        let interval_ms = self.interval.as_millis().to_string();
        [
            ("${__from}", &from),
            ("${__to}", &to),
            ("$__interval_ms", &interval_ms),
            ("$__from", &from),
            ("$__to", &to),
        ]
        .into_iter()
        .fold(apl.to_string(), |apl, (name, value)| replace_variable(&apl, name, value))
    }
}

/// Replace `name` with `value`. Unbraced names are left alone when immediately followed
/// by more of an identifier; braced names are delimited and always replaced.
fn replace_variable(text: &str, name: &str, value: &str) -> String {
    let braced = name.ends_with('}');
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(name) {
        let after = &rest[pos + name.len()..];
        let continues = !braced
            && after
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        out.push_str(&rest[..pos]);
        out.push_str(if continues { name } else { value });
        rest = after;
    }
    out.push_str(rest);
    out
}

/// One query of a data request, together with the dashboard context it runs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// The `refId` of the query.
    pub ref_id: String,
    /// The query as sent by the query editor.
    pub query: AxiomQuery,
    /// The start of the dashboard time range.
    pub from: DateTime<Utc>,
    /// The end of the dashboard time range.
    pub to: DateTime<Utc>,
    /// The suggested time grouping interval.
    pub interval: Duration,
}

impl Target {
    /// The time range to query, applying the query's own overrides.
    pub fn time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.query.start_time.unwrap_or(self.from),
            self.query.end_time.unwrap_or(self.to),
        )
    }

    fn variables(&self) -> TimeVariables {
        let (from, to) = self.time_range();
        TimeVariables {
            from,
            to,
            interval: self.interval,
        }
    }
}

/// The result of running a single [`Target`].
#[derive(Debug)]
pub struct TargetOutcome {
    /// The `refId` of the target.
    pub ref_id: String,
    /// The APL sent to Axiom, after variable substitution.
    pub executed_apl: String,
    /// The result tables; empty if the query was empty or returned no tables.
    pub result: Result<Vec<ResultTable>>,
}

/// Runs the targets of a data request against an [`AplClient`].
#[derive(Clone)]
pub struct QueryExecutor {
    client: Arc<dyn AplClient>,
}

impl QueryExecutor {
    /// Create an executor sending its queries to `client`.
    pub fn new(client: Arc<dyn AplClient>) -> Self {
        Self { client }
    }

    /// Run every target, yielding one outcome per target in target order.
    ///
    /// At most [`MAX_CONCURRENT_QUERIES`] requests are in flight at once. Each target
    /// succeeds or fails on its own; a failure is never retried and does not affect the
    /// other targets. Dropping the stream cancels any requests still in flight.
    pub fn execute(&self, targets: Vec<Target>) -> BoxStream<'static, TargetOutcome> {
        let client = Arc::clone(&self.client);
        stream::iter(targets)
            .map(move |target| {
                let client = Arc::clone(&client);
                async move { run_target(client.as_ref(), target).await }
            })
            .buffered(MAX_CONCURRENT_QUERIES)
            .boxed()
    }
}

async fn run_target(client: &dyn AplClient, target: Target) -> TargetOutcome {
    let (start, end) = target.time_range();
    let executed_apl = target.variables().apply_variables(&target.query.apl);
    let Target { ref_id, query, .. } = target;
    if executed_apl.trim().is_empty() {
        debug!(ref_id = %ref_id, "Skipping empty query");
        return TargetOutcome {
            ref_id,
            executed_apl,
            result: Ok(vec![]),
        };
    }
    let result = client
        .query(&executed_apl, start, end)
        .await
        .and_then(|response| select_tables(&response, query.totals, &ref_id));
    if let Err(error) = &result {
        warn!(ref_id = %ref_id, %error, "Query failed");
    }
    TargetOutcome {
        ref_id,
        executed_apl,
        result,
    }
}

/// The outcome of a connectivity check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityReport {
    /// Whether Axiom answered the probe.
    pub ok: bool,
    /// A message suitable for showing to the user.
    pub message: String,
}

impl ConnectivityReport {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Check that Axiom is reachable and accepts the configured credentials.
///
/// Runs `['<dataset>'] | limit 1` over the [`PROBE_WINDOW_DAYS`] days before `now`, against
/// `probe_dataset` if given or else the first dataset the token can see.
pub async fn check_connectivity(
    client: &dyn AplClient,
    probe_dataset: Option<&str>,
    now: DateTime<Utc>,
) -> ConnectivityReport {
    let dataset = match probe_dataset {
        Some(dataset) => dataset.to_string(),
        None => match client.dataset_fields().await {
            Ok(datasets) => match datasets.into_iter().next() {
                Some(first) => first.dataset_name,
                None => {
                    return ConnectivityReport::ok(
                        "Connected to Axiom, but there are no datasets to probe",
                    )
                }
            },
            Err(error) => {
                warn!(%error, "Failed to list datasets");
                return ConnectivityReport::failed(format!("Failed to list datasets: {error}"));
            }
        },
    };
    let apl = probe_apl(&dataset);
    let start = now - chrono::Duration::days(PROBE_WINDOW_DAYS);
    match client.query(&apl, start, now).await {
        Ok(_) => ConnectivityReport::ok("Data source is working"),
        Err(error) => {
            warn!(%dataset, %error, "Connectivity probe failed");
            ConnectivityReport::failed(format!("Failed to query Axiom: {error}"))
        }
    }
}

fn probe_apl(dataset: &str) -> String {
    format!("['{}'] | limit 1", dataset.replace('\'', "\\'"))
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        schema::DatasetFields,
        table::{AplResponse, ResponseTable, TableKind},
        types::FieldDescriptor,
        Error,
    };

    #[derive(Default)]
    struct FakeClient {
        responses: HashMap<String, AplResponse>,
        delays: HashMap<String, Duration>,
        datasets: Option<Vec<DatasetFields>>,
        calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    impl FakeClient {
        fn with_response(mut self, apl: &str, response: AplResponse) -> Self {
            self.responses.insert(apl.to_string(), response);
            self
        }

        fn with_delay(mut self, apl: &str, delay: Duration) -> Self {
            self.delays.insert(apl.to_string(), delay);
            self
        }

        fn calls(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AplClient for FakeClient {
        async fn query(
            &self,
            apl: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<AplResponse> {
            self.calls.lock().unwrap().push((apl.to_string(), start, end));
            if let Some(delay) = self.delays.get(apl) {
                tokio::time::sleep(*delay).await;
            }
            self.responses.get(apl).cloned().ok_or_else(|| Error::Api {
                status: StatusCode::BAD_REQUEST,
                message: format!("cannot parse {apl:?}"),
            })
        }

        async fn dataset_fields(&self) -> Result<Vec<DatasetFields>> {
            self.datasets.clone().ok_or_else(|| Error::Api {
                status: StatusCode::UNAUTHORIZED,
                message: "invalid token".to_string(),
            })
        }
    }

    /// Never answers; counts the query futures started and the ones dropped unfinished.
    #[derive(Default)]
    struct PendingClient {
        started: AtomicUsize,
        dropped: Arc<AtomicUsize>,
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AplClient for PendingClient {
        async fn query(
            &self,
            _apl: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<AplResponse> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _counter = DropCounter(Arc::clone(&self.dropped));
            std::future::pending::<Result<AplResponse>>().await
        }

        async fn dataset_fields(&self) -> Result<Vec<DatasetFields>> {
            Ok(vec![])
        }
    }

    fn time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn target(ref_id: &str, apl: &str) -> Target {
        Target {
            ref_id: ref_id.to_string(),
            query: AxiomQuery {
                apl: apl.to_string(),
                ..Default::default()
            },
            from: time("2024-01-01T00:00:00Z"),
            to: time("2024-01-01T01:00:00Z"),
            interval: Duration::from_secs(60),
        }
    }

    fn response(names: &[&str]) -> AplResponse {
        AplResponse {
            format: "tabular".to_string(),
            tables: names
                .iter()
                .map(|name| ResponseTable {
                    name: name.to_string(),
                    fields: vec![FieldDescriptor::new("count_", "integer")],
                    columns: vec![vec![json!(1)]],
                    groups: vec![],
                })
                .collect(),
            dataset_names: vec!["vercel".to_string()],
        }
    }

    async fn run(
        client: FakeClient,
        targets: Vec<Target>,
    ) -> (Arc<FakeClient>, Vec<TargetOutcome>) {
        let client = Arc::new(client);
        let executor = QueryExecutor::new(client.clone());
        let outcomes = executor.execute(targets).collect().await;
        (client, outcomes)
    }

    #[test]
    fn deserializes_query() {
        let q: AxiomQuery = serde_json::from_value(json!({
            "refId": "A",
            "apl": "['vercel']",
            "totals": true,
            "startTime": "",
            "endTime": "2024-01-01T00:00:00+01:00",
        }))
        .unwrap();
        assert_eq!(q.apl, "['vercel']");
        assert!(q.totals);
        assert_eq!(q.start_time, None);
        assert_eq!(q.end_time, Some(time("2023-12-31T23:00:00Z")));

        let q: AxiomQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(q, AxiomQuery::default());
    }

    #[test]
    fn time_variables() {
        let vars = TimeVariables {
            from: time("2024-01-01T00:00:00Z"),
            to: time("2024-01-01T01:00:00Z"),
            interval: Duration::from_millis(1500),
        };
        assert_eq!(
            vars.apply_variables(
                "['x'] | where _time between (unixtime_milliseconds_todatetime($__from) .. unixtime_milliseconds_todatetime(${__to})) | summarize count() by bin(_time, $__interval_ms * 1ms)"
            ),
            "['x'] | where _time between (unixtime_milliseconds_todatetime(1704067200000) .. unixtime_milliseconds_todatetime(1704070800000)) | summarize count() by bin(_time, 1500 * 1ms)"
        );
        // Longer identifiers sharing a prefix are left alone.
        assert_eq!(vars.apply_variables("$__fromage $__to"), "$__fromage 1704070800000");
        // Braces delimit the name, so text may follow directly.
        assert_eq!(
            vars.apply_variables("x=${__from}ms y=${__to}0"),
            "x=1704067200000ms y=17040708000000"
        );
        assert_eq!(vars.apply_variables("['x']"), "['x']");
    }

    #[tokio::test]
    async fn empty_query_issues_no_request() {
        let (client, outcomes) = run(FakeClient::default(), vec![target("A", "  \n ")]).await;
        assert!(client.calls().is_empty());
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].ref_id, "A");
        assert!(outcomes[0].result.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_per_target() {
        let client = FakeClient::default().with_response("['ok']", response(&["0"]));
        let (_, outcomes) = run(
            client,
            vec![target("A", "['bad'] |"), target("B", "['ok']")],
        )
        .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].ref_id, "A");
        assert!(matches!(
            outcomes[0].result,
            Err(Error::Api {
                status: StatusCode::BAD_REQUEST,
                ..
            })
        ));
        assert_eq!(outcomes[1].ref_id, "B");
        let tables = outcomes[1].result.as_ref().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].ref_id, "B");
    }

    #[tokio::test]
    async fn malformed_table_fails_only_its_target() {
        let mut broken = response(&["0"]);
        broken.tables[0].columns.clear();
        let client = FakeClient::default()
            .with_response("['broken']", broken)
            .with_response("['ok']", response(&["0"]));
        let (_, outcomes) = run(
            client,
            vec![target("A", "['broken']"), target("B", "['ok']")],
        )
        .await;
        assert!(matches!(outcomes[0].result, Err(Error::MalformedResponse { .. })));
        assert!(outcomes[1].result.is_ok());
    }

    #[tokio::test]
    async fn outcomes_keep_target_order() {
        let client = FakeClient::default()
            .with_response("['slow']", response(&["0"]))
            .with_response("['fast']", response(&["0"]))
            .with_delay("['slow']", Duration::from_millis(50));
        let (client, outcomes) = run(
            client,
            vec![target("A", "['slow']"), target("B", "['fast']"), target("C", "")],
        )
        .await;
        let ids: Vec<_> = outcomes.iter().map(|o| o.ref_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_requests() {
        let client = Arc::new(PendingClient::default());
        let mut outcomes = QueryExecutor::new(client.clone())
            .execute(vec![target("A", "['a']"), target("B", "['b']")]);
        let first = tokio::time::timeout(Duration::from_millis(20), outcomes.next()).await;
        assert!(first.is_err(), "no query should have finished");
        assert_eq!(client.started.load(Ordering::SeqCst), 2);
        assert_eq!(client.dropped.load(Ordering::SeqCst), 0);

        drop(outcomes);
        assert_eq!(client.dropped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn totals() {
        let client =
            FakeClient::default().with_response("['vercel']", response(&["_totals", "0"]));
        let mut with_totals = target("A", "['vercel']");
        with_totals.query.totals = true;
        let (_, outcomes) = run(client, vec![with_totals, target("B", "['vercel']")]).await;

        let tables = outcomes[0].result.as_ref().unwrap();
        let shape: Vec<_> = tables.iter().map(|t| (t.name.as_str(), t.kind)).collect();
        assert_eq!(shape, vec![("0", TableKind::Primary), ("_totals", TableKind::Totals)]);

        let tables = outcomes[1].result.as_ref().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "_totals");
    }

    #[tokio::test]
    async fn time_overrides_and_substitution() {
        let client =
            FakeClient::default().with_response("['x'] | limit 1704153600000", response(&["0"]));
        let mut t = target("A", "['x'] | limit $__to");
        t.query.end_time = Some(time("2024-01-02T00:00:00Z"));
        let (client, outcomes) = run(client, vec![t]).await;
        assert_eq!(outcomes[0].executed_apl, "['x'] | limit 1704153600000");
        assert_eq!(
            client.calls(),
            vec![(
                "['x'] | limit 1704153600000".to_string(),
                time("2024-01-01T00:00:00Z"),
                time("2024-01-02T00:00:00Z"),
            )]
        );
    }

    #[tokio::test]
    async fn connectivity_probes_configured_dataset() {
        let now = time("2024-01-08T00:00:00Z");
        let client = FakeClient::default().with_response("['vercel'] | limit 1", response(&["0"]));
        let report = check_connectivity(&client, Some("vercel"), now).await;
        assert_eq!(report, ConnectivityReport::ok("Data source is working"));
        assert_eq!(
            client.calls(),
            vec![(
                "['vercel'] | limit 1".to_string(),
                time("2024-01-01T00:00:00Z"),
                now
            )]
        );
    }

    #[tokio::test]
    async fn connectivity_probes_first_dataset() {
        let client = FakeClient {
            datasets: Some(vec![
                DatasetFields {
                    dataset_name: "logs".to_string(),
                    fields: vec![],
                },
                DatasetFields {
                    dataset_name: "vercel".to_string(),
                    fields: vec![],
                },
            ]),
            ..Default::default()
        }
        .with_response("['logs'] | limit 1", response(&["0"]));
        let report = check_connectivity(&client, None, Utc::now()).await;
        assert!(report.ok, "{}", report.message);
    }

    #[tokio::test]
    async fn connectivity_without_datasets() {
        let client = FakeClient {
            datasets: Some(vec![]),
            ..Default::default()
        };
        let report = check_connectivity(&client, None, Utc::now()).await;
        assert!(report.ok);
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn connectivity_failures() {
        let report = check_connectivity(&FakeClient::default(), None, Utc::now()).await;
        assert!(!report.ok);
        assert!(report.message.contains("invalid token"), "{}", report.message);

        let report = check_connectivity(&FakeClient::default(), Some("missing"), Utc::now()).await;
        assert!(!report.ok);
        assert!(report.message.starts_with("Failed to query Axiom"));
    }
}
