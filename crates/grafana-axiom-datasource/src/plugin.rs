//! The Grafana plugin services: data queries, health checks, metrics and resources.
use std::{collections::HashMap, convert::Infallible, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use grafana_plugin_sdk::{backend, data, prelude::*};
use http::{header, Method, StatusCode, Uri};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    client::{AplClient, HttpAplClient},
    config::{AxiomJsonData, AxiomSecureJsonData, Settings},
    error::{Error, Result},
    frame::to_frame,
    metrics::Metrics,
    query::{check_connectivity, AxiomQuery, QueryExecutor, Target, TargetOutcome},
    schema::{DatasetFields, SchemaCache},
};

type InstanceSettings = backend::DataSourceInstanceSettings<AxiomJsonData, AxiomSecureJsonData>;

/// Identifies one revision of a data source instance's settings.
type SchemaKey = (String, DateTime<Utc>);

/// The Axiom data source.
///
/// A single value serves every configured data source instance; connection settings are
/// read from each request.
#[derive(Clone, Debug, GrafanaPlugin)]
#[grafana_plugin(
    plugin_type = "datasource",
    json_data = "AxiomJsonData",
    secure_json_data = "AxiomSecureJsonData"
)]
pub struct AxiomDataSource {
    http: reqwest::Client,
    metrics: Metrics,
    schemas: Arc<Mutex<HashMap<SchemaKey, Arc<SchemaCache>>>>,
}

impl AxiomDataSource {
    /// Create the data source, registering its metrics.
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            metrics: Metrics::new()?,
            schemas: Arc::default(),
        })
    }

    fn instance(instance: Option<&InstanceSettings>) -> Result<&InstanceSettings> {
        instance.ok_or_else(|| {
            Error::ConfigInvalid("request has no data source settings".to_string())
        })
    }

    fn client(&self, instance: Option<&InstanceSettings>) -> Result<HttpAplClient> {
        let instance = Self::instance(instance)?;
        let settings = Settings::new(&instance.json_data, &instance.decrypted_secure_json_data)?;
        Ok(HttpAplClient::new(self.http.clone(), settings))
    }

    /// The schema cache of the given data source instance.
    ///
    /// Saving the data source's settings starts a new cache.
    async fn schema_cache(&self, instance: &InstanceSettings) -> Arc<SchemaCache> {
        let key = (instance.uid.clone(), instance.updated);
        let mut caches = self.schemas.lock().await;
        if let Some(cache) = caches.get(&key) {
            return Arc::clone(cache);
        }
        caches.retain(|(uid, _), _| *uid != instance.uid);
        debug!(uid = %instance.uid, "Creating schema cache");
        Arc::clone(caches.entry(key).or_default())
    }
}

async fn fetch_fields(client: &dyn AplClient, metrics: &Metrics) -> Result<Vec<DatasetFields>> {
    let fields = client.dataset_fields().await;
    metrics.record_schema_fetch(fields.is_ok());
    fields
}

/// An error returned for a single query target.
#[derive(Debug, Error)]
#[error("error querying Axiom for query {ref_id}: {source}")]
pub struct QueryError {
    ref_id: String,
    #[source]
    source: Error,
}

impl backend::DataQueryError for QueryError {
    fn ref_id(self) -> String {
        self.ref_id
    }

    fn status(&self) -> backend::DataQueryStatus {
        query_status(&self.source)
    }

    fn source(&self) -> backend::ErrorSource {
        if self.source.is_downstream() {
            backend::ErrorSource::Downstream
        } else {
            backend::ErrorSource::Plugin
        }
    }
}

fn query_status(error: &Error) -> backend::DataQueryStatus {
    use backend::DataQueryStatus as Status;
    match error {
        Error::Api { status, .. } => match status.as_u16() {
            400 => Status::BadRequest,
            401 => Status::Unauthorized,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            429 => Status::TooManyRequests,
            _ if status.is_server_error() => Status::BadGateway,
            _ => Status::Custom(*status),
        },
        Error::Request(e) if e.is_timeout() => Status::Timeout,
        Error::Request(_) | Error::MalformedResponse { .. } | Error::Decode(_) => {
            Status::BadGateway
        }
        Error::ConfigInvalid(_) => Status::ValidationFailed,
        Error::Frame(_) => Status::Internal,
    }
}

fn into_response(
    outcome: TargetOutcome,
) -> std::result::Result<backend::DataResponse, QueryError> {
    let TargetOutcome {
        ref_id,
        executed_apl,
        result,
    } = outcome;
    let frames: Vec<data::Frame> = match result {
        Ok(tables) => tables.iter().map(|t| to_frame(t, &executed_apl)).collect(),
        Err(source) => return Err(QueryError { ref_id, source }),
    };
    match frames.iter().map(data::Frame::check).collect::<std::result::Result<Vec<_>, _>>() {
        Ok(checked) => Ok(backend::DataResponse::new(ref_id, checked)),
        Err(e) => {
            warn!(ref_id = %ref_id, error = %e, "Frame validation failed");
            Err(QueryError {
                ref_id,
                source: e.into(),
            })
        }
    }
}

#[backend::async_trait]
impl backend::DataService for AxiomDataSource {
    type Query = AxiomQuery;
    type QueryError = QueryError;
    type Stream = backend::BoxDataResponseStream<Self::QueryError>;

    async fn query_data(
        &self,
        request: backend::QueryDataRequest<Self::Query, Self>,
    ) -> Self::Stream {
        debug!(queries = request.queries.len(), "Received query_data request");
        let client = match self.client(request.plugin_context.instance_settings.as_ref()) {
            Ok(client) => client,
            Err(error) => {
                warn!(%error, "Cannot run queries");
                let reason = match error {
                    Error::ConfigInvalid(reason) => reason,
                    other => other.to_string(),
                };
                return Box::pin(stream::iter(request.queries.into_iter().map(move |q| {
                    Err::<backend::DataResponse, _>(QueryError {
                        ref_id: q.ref_id,
                        source: Error::ConfigInvalid(reason.clone()),
                    })
                })));
            }
        };
        let targets = request
            .queries
            .into_iter()
            .map(|q| Target {
                ref_id: q.ref_id,
                query: q.query,
                from: q.time_range.from,
                to: q.time_range.to,
                interval: q.interval,
            })
            .collect();
        let metrics = self.metrics.clone();
        Box::pin(
            QueryExecutor::new(Arc::new(client))
                .execute(targets)
                .map(move |outcome| {
                    metrics.record_query(&outcome);
                    into_response(outcome)
                }),
        )
    }
}

#[backend::async_trait]
impl backend::DiagnosticsService for AxiomDataSource {
    type CheckHealthError = Infallible;

    async fn check_health(
        &self,
        request: backend::CheckHealthRequest<Self>,
    ) -> std::result::Result<backend::CheckHealthResponse, Self::CheckHealthError> {
        let client = match self.client(request.plugin_context.instance_settings.as_ref()) {
            Ok(client) => client,
            Err(error) => {
                self.metrics.record_health_check(false);
                return Ok(backend::CheckHealthResponse::error(error.to_string()));
            }
        };
        let report = check_connectivity(
            &client,
            client.settings().probe_dataset.as_deref(),
            Utc::now(),
        )
        .await;
        self.metrics.record_health_check(report.ok);
        info!(ok = report.ok, message = %report.message, "Health check finished");
        Ok(if report.ok {
            backend::CheckHealthResponse::ok(report.message)
        } else {
            backend::CheckHealthResponse::error(report.message)
        })
    }

    type CollectMetricsError = prometheus::Error;

    async fn collect_metrics(
        &self,
        _request: backend::CollectMetricsRequest<Self>,
    ) -> std::result::Result<backend::CollectMetricsResponse, Self::CollectMetricsError> {
        Ok(backend::CollectMetricsResponse::new(Some(
            backend::MetricsPayload::prometheus(self.metrics.render()?),
        )))
    }
}

/// An error returned from a resource call.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No resource exists at the path.
    #[error("path not found: {0}")]
    NotFound(String),

    /// Resources are read-only.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(Method),

    /// The settings were invalid or Axiom could not be queried.
    #[error(transparent)]
    Axiom(#[from] Error),

    /// The response body could not be serialized.
    #[error("could not serialize response: {0}")]
    Json(#[from] serde_json::Error),

    /// The response could not be built.
    #[error("could not build response: {0}")]
    Http(#[from] http::Error),
}

impl ResourceError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Axiom(Error::ConfigInvalid(_)) => StatusCode::BAD_REQUEST,
            Self::Axiom(Error::Api { status, .. }) if status.is_client_error() => *status,
            Self::Axiom(e) if e.is_downstream() => StatusCode::BAD_GATEWAY,
            Self::Axiom(_) | Self::Json(_) | Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl backend::ErrIntoHttpResponse for ResourceError {
    fn into_http_response(
        self,
    ) -> std::result::Result<http::Response<Bytes>, Box<dyn std::error::Error>> {
        Ok(http::Response::builder()
            .status(self.status())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(serde_json::to_vec(
                &serde_json::json!({"error": self.to_string()}),
            )?))?)
    }
}

/// Whether a resource query string asks for a fresh schema.
fn wants_refresh(query: Option<&str>) -> bool {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .any(|pair| matches!(pair, "refresh" | "refresh=true" | "refresh=1"))
}

/// The resources served by the data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    /// The raw dataset fields.
    SchemaLookup,
    /// The schema tree for autocompletion, rebuilt first if `refresh` is set.
    Schema { refresh: bool },
}

fn route(method: &Method, uri: &Uri) -> std::result::Result<Route, ResourceError> {
    if *method != Method::GET {
        return Err(ResourceError::MethodNotAllowed(method.clone()));
    }
    match uri.path().trim_end_matches('/') {
        "/schema-lookup" => Ok(Route::SchemaLookup),
        "/schema" => Ok(Route::Schema {
            refresh: wants_refresh(uri.query()),
        }),
        other => Err(ResourceError::NotFound(other.to_string())),
    }
}

async fn serve(
    route: Route,
    client: &dyn AplClient,
    cache: &SchemaCache,
    metrics: &Metrics,
) -> std::result::Result<http::Response<Bytes>, ResourceError> {
    let body = match route {
        Route::SchemaLookup => serde_json::to_vec(&fetch_fields(client, metrics).await?)?,
        Route::Schema { refresh } => {
            let fetch = || fetch_fields(client, metrics);
            let tree = if refresh {
                cache.refresh(fetch).await?
            } else {
                cache.get_or_build(fetch).await?
            };
            serde_json::to_vec(tree.as_ref())?
        }
    };
    Ok(http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))?)
}

#[backend::async_trait]
impl backend::ResourceService for AxiomDataSource {
    type Error = ResourceError;
    type InitialResponse = http::Response<Bytes>;
    type Stream = backend::BoxResourceStream<Self::Error>;

    async fn call_resource(
        &self,
        r: backend::CallResourceRequest<Self>,
    ) -> std::result::Result<(Self::InitialResponse, Self::Stream), Self::Error> {
        let instance = r.plugin_context.instance_settings.as_ref();
        let (method, uri) = (r.request.method(), r.request.uri());
        debug!(%method, %uri, "Received resource request");
        let route = route(method, uri)?;
        let client = self.client(instance)?;
        let cache = self.schema_cache(Self::instance(instance)?).await;
        let response = serve(route, &client, &cache, &self.metrics).await?;
        Ok((response, Box::pin(stream::empty())))
    }
}
