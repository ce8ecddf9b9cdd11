//! Error types returned by the data source.
use http::StatusCode;
use thiserror::Error;

/// Errors that can occur while configuring the data source or running queries against Axiom.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The data source instance settings could not be used.
    ///
    /// This is reported to the user when saving and testing the data source.
    #[error("invalid data source configuration: {0}")]
    ConfigInvalid(String),

    /// A response table did not have the shape promised by Axiom.
    #[error("malformed response table {table:?}: {reason}")]
    MalformedResponse {
        /// The name of the offending table.
        table: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The request could not be sent, or the response body could not be read.
    #[error("request to Axiom failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Axiom answered with a non-success status code.
    #[error("Axiom returned {status}: {message}")]
    Api {
        /// The HTTP status returned by Axiom.
        status: StatusCode,
        /// The error message from the response body, or the raw body if it was not JSON.
        message: String,
    },

    /// A response body was not valid JSON of the expected shape.
    #[error("unexpected response body from Axiom: {0}")]
    Decode(#[from] serde_json::Error),

    /// A result table could not be turned into a valid data frame.
    #[error("invalid data frame: {0}")]
    Frame(#[from] grafana_plugin_sdk::data::Error),
}

impl Error {
    /// Whether the error originated in Axiom (or the network in between) rather than in the plugin.
    pub fn is_downstream(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Api { .. } | Self::MalformedResponse { .. } | Self::Decode(_)
        )
    }
}

/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
