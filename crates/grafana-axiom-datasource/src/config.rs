//! Data source instance settings.
//!
//! Grafana stores the non-secret part of a data source's configuration as `jsonData` and
//! the secrets as `secureJsonData`. Both are deserialized by the SDK into the types below,
//! then validated into [`Settings`] whenever a request needs them.
use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// The Axiom API host used when a new data source is created.
pub const DEFAULT_API_HOST: &str = "https://api.axiom.co";

/// The non-secret settings of a data source instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxiomJsonData {
    /// The base URL of the Axiom API. Required.
    #[serde(default)]
    pub api_host: Option<String>,
    /// The Axiom organization to query, for personal access tokens.
    #[serde(rename = "orgID", default)]
    pub org_id: Option<String>,
    /// An edge endpoint to send queries to instead of `api_host`.
    #[serde(default)]
    pub edge: Option<String>,
    /// The dataset probed by the health check. Defaults to the first dataset found.
    #[serde(default)]
    pub probe_dataset: Option<String>,
}

impl Default for AxiomJsonData {
    fn default() -> Self {
        Self {
            api_host: Some(DEFAULT_API_HOST.to_string()),
            org_id: None,
            edge: None,
            probe_dataset: None,
        }
    }
}

/// The secret settings of a data source instance.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxiomSecureJsonData {
    /// An Axiom API token or personal access token.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl fmt::Debug for AxiomSecureJsonData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxiomSecureJsonData")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validated connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    /// The base URL for schema and probe requests. Always ends in `/`.
    pub api_host: Url,
    /// The base URL for queries, if it differs from `api_host`.
    pub edge: Option<Url>,
    /// The organization to act on, for personal access tokens.
    pub org_id: Option<String>,
    /// The API or personal access token.
    pub access_token: String,
    /// The dataset the health check queries, if configured.
    pub probe_dataset: Option<String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_host", &self.api_host.as_str())
            .field("edge", &self.edge.as_ref().map(Url::as_str))
            .field("org_id", &self.org_id)
            .field("probe_dataset", &self.probe_dataset)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Validate the instance settings Grafana sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the API host is missing, empty or not an
    /// absolute HTTP(S) URL, or if the edge endpoint is set but invalid. A missing access
    /// token is only logged, since Axiom will reject the requests with a clearer message.
    pub fn new(json_data: &AxiomJsonData, secure: &AxiomSecureJsonData) -> Result<Self> {
        let api_host = match non_empty(json_data.api_host.as_deref()) {
            Some(host) => parse_base_url(host)?,
            None => return Err(Error::ConfigInvalid("API host is required".to_string())),
        };
        let edge = non_empty(json_data.edge.as_deref())
            .map(|edge| {
                if edge.contains("://") {
                    parse_base_url(edge)
                } else {
                    parse_base_url(&format!("https://{edge}"))
                }
            })
            .transpose()?;
        let access_token = non_empty(secure.access_token.as_deref())
            .unwrap_or_default()
            .to_string();
        if access_token.is_empty() {
            warn!(api_host = %api_host, "No access token configured");
        }
        Ok(Self {
            api_host,
            edge,
            org_id: non_empty(json_data.org_id.as_deref()).map(str::to_string),
            access_token,
            probe_dataset: non_empty(json_data.probe_dataset.as_deref()).map(str::to_string),
        })
    }

    /// The base URL queries are sent to.
    pub fn query_base(&self) -> &Url {
        self.edge.as_ref().unwrap_or(&self.api_host)
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_base_url(s: &str) -> Result<Url> {
    let mut url =
        Url::parse(s).map_err(|e| Error::ConfigInvalid(format!("invalid URL {s:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(Error::ConfigInvalid(format!(
            "invalid URL {s:?}: expected an http or https URL"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
