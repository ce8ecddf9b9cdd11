//! The Axiom HTTP API, as far as this data source needs it.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::StatusCode;
use reqwest::{header, RequestBuilder, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::Settings,
    error::{Error, Result},
    schema::DatasetFields,
    table::AplResponse,
};

/// The `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("axiom-grafana/v", env!("CARGO_PKG_VERSION"));

/// The header selecting the organization a personal access token acts on.
pub const ORG_ID_HEADER: &str = "X-Axiom-Org-Id";

const APL_PATH: &str = "v1/datasets/_apl";
const FIELDS_PATH: &str = "v1/datasets/_fields";

/// Runs APL queries and looks up dataset schemas.
#[async_trait]
pub trait AplClient: Send + Sync {
    /// Run an APL query over the given time range, returning the tabular result.
    async fn query(
        &self,
        apl: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AplResponse>;

    /// Fetch the fields of every dataset visible to the configured token.
    async fn dataset_fields(&self) -> Result<Vec<DatasetFields>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    apl: &'a str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// An [`AplClient`] talking to Axiom over HTTP.
#[derive(Clone, Debug)]
pub struct HttpAplClient {
    http: reqwest::Client,
    settings: Settings,
}

impl HttpAplClient {
    /// Create a client for the given settings.
    ///
    /// `http` is typically shared between all data source instances so that connections
    /// are pooled.
    pub fn new(http: reqwest::Client, settings: Settings) -> Self {
        Self { http, settings }
    }

    /// The settings the client was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn apl_url(&self) -> Result<Url> {
        let mut url = endpoint(self.settings.query_base(), APL_PATH)?;
        url.query_pairs_mut().append_pair("format", "tabular");
        Ok(url)
    }

    fn fields_url(&self) -> Result<Url> {
        endpoint(&self.settings.api_host, FIELDS_PATH)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header(header::USER_AGENT, USER_AGENT)
            .bearer_auth(&self.settings.access_token);
        match &self.settings.org_id {
            Some(org_id) => builder.header(ORG_ID_HEADER, org_id),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.authorize(builder).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::Api {
                status,
                message: error_message(status, &body),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl AplClient for HttpAplClient {
    async fn query(
        &self,
        apl: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AplResponse> {
        let url = self.apl_url()?;
        debug!(%url, apl, %start, %end, "Running APL query");
        let body = QueryBody {
            apl,
            start_time: start,
            end_time: end,
        };
        self.send(self.http.post(url).json(&body)).await
    }

    async fn dataset_fields(&self) -> Result<Vec<DatasetFields>> {
        let url = self.fields_url()?;
        debug!(%url, "Fetching dataset fields");
        self.send(self.http.get(url)).await
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::ConfigInvalid(format!("cannot build URL from {base}: {e}")))
}

/// Extract a human readable message from an Axiom error response body.
fn error_message(status: StatusCode, body: &Bytes) -> String {
    if let Ok(ErrorBody { message, error }) = serde_json::from_slice::<ErrorBody>(body) {
        if let Some(msg) = message.or(error).filter(|m| !m.is_empty()) {
            return msg;
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        text.to_string()
    }
}
