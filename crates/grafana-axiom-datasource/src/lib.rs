/*! A Grafana backend data source for [Axiom].

The data source runs [APL] queries against Axiom and returns their tabular results as
Grafana data frames. It is split into a few layers:

- [`types`] maps Axiom field types to the types Grafana displays them as.
- [`schema`] translates dataset schemas into the Kusto schema layout used by the APL
  editor's autocompletion.
- [`table`] and [`frame`] turn Axiom's tabular responses into typed tables and then
  into [`Frame`][grafana_plugin_sdk::data::Frame]s.
- [`query`] substitutes variables and runs the queries of a request concurrently through
  an [`AplClient`], of which [`HttpAplClient`] is the real implementation.
- [`plugin`] wires all of this into the Grafana plugin SDK.

[Axiom]: https://axiom.co
[APL]: https://axiom.co/docs/apl/introduction
*/
#![deny(missing_docs)]

pub mod client;
pub mod config;
mod error;
pub mod frame;
pub mod metrics;
pub mod plugin;
pub mod query;
pub mod schema;
pub mod table;
pub mod types;

pub use client::{AplClient, HttpAplClient};
pub use config::{AxiomJsonData, AxiomSecureJsonData, Settings};
pub use error::{Error, Result};
pub use plugin::AxiomDataSource;
