/*! Translation of Axiom dataset schemas into the Kusto schema format.

The APL editor's autocomplete engine understands schemas in the layout used by
Kusto language services: a set of databases, each holding tables of ordered,
typed columns. Every Axiom dataset becomes a table of a single database named
[`DATABASE_NAME`].
*/
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    error::Result,
    types::{resolve_column_type, FieldDescriptor},
};

/// The name of the single database holding every dataset.
pub const DATABASE_NAME: &str = "db";

/// The fields of a single dataset, as returned by the schema lookup endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFields {
    /// The dataset name.
    pub dataset_name: String,
    /// The dataset's fields, in the order Axiom returned them.
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

/// A schema tree in the Kusto schema layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaTree {
    /// Language plugins; always empty.
    pub plugins: Vec<Value>,
    /// Databases by name; always exactly one, named [`DATABASE_NAME`].
    pub databases: BTreeMap<String, Database>,
}

/// A database within a [`SchemaTree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Database {
    /// The database name.
    pub name: String,
    /// Tables by name.
    pub tables: BTreeMap<String, Table>,
    /// Stored functions; always empty.
    pub functions: BTreeMap<String, Value>,
}

/// A table (dataset) within a [`Database`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Table {
    /// The table name.
    pub name: String,
    /// The table's columns, in dataset field order.
    pub ordered_columns: Vec<Column>,
}

/// A column of a [`Table`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Column {
    /// The column name.
    pub name: String,
    /// The .NET type name of the column.
    #[serde(rename = "Type")]
    pub type_: String,
    /// The Kusto (CSL) type name of the column.
    pub csl_type: String,
    /// The field description, if Axiom has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_string: Option<String>,
}

impl SchemaTree {
    /// The name of the database holding the datasets.
    pub fn database_name(&self) -> &str {
        DATABASE_NAME
    }

    /// The tables of the dataset database.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.databases
            .get(DATABASE_NAME)
            .into_iter()
            .flat_map(|db| db.tables.values())
    }

    /// Look up a table by dataset name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.databases.get(DATABASE_NAME)?.tables.get(name)
    }
}

/// Build a [`SchemaTree`] from the fields of each dataset.
///
/// Hidden fields are skipped. Fields whose type cannot be mapped are skipped with a
/// warning; the rest of the dataset is still included.
pub fn build_schema(datasets: &[DatasetFields]) -> SchemaTree {
    let tables = datasets
        .iter()
        .map(|dataset| {
            let ordered_columns = dataset
                .fields
                .iter()
                .filter(|field| !field.hidden)
                .filter_map(|field| match resolve_column_type(&field.name, &field.service_type) {
                    Ok(column_type) => Some(Column {
                        name: field.name.clone(),
                        type_: column_type.type_.to_string(),
                        csl_type: column_type.csl_type.to_string(),
                        doc_string: field.description.clone().filter(|d| !d.is_empty()),
                    }),
                    Err(error) => {
                        warn!(
                            dataset = %dataset.dataset_name,
                            field = %field.name,
                            %error,
                            "Unable to map field",
                        );
                        None
                    }
                })
                .collect();
            (
                dataset.dataset_name.clone(),
                Table {
                    name: dataset.dataset_name.clone(),
                    ordered_columns,
                },
            )
        })
        .collect();
    SchemaTree {
        plugins: vec![],
        databases: [(
            DATABASE_NAME.to_string(),
            Database {
                name: DATABASE_NAME.to_string(),
                tables,
                functions: BTreeMap::new(),
            },
        )]
        .into_iter()
        .collect(),
    }
}

/// Holds the schema tree of one data source instance.
///
/// The tree is built on first use and replaced wholesale by [`SchemaCache::refresh`].
/// Each refresh takes a new generation number; a refresh that completes after a newer
/// one has started returns its tree to its caller but does not store it.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tree: RwLock<Option<Arc<SchemaTree>>>,
    generation: AtomicU64,
}

impl SchemaCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached tree, building it with `fetch` if there is none yet.
    pub async fn get_or_build<F, Fut>(&self, fetch: F) -> Result<Arc<SchemaTree>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<DatasetFields>>>,
    {
        if let Some(tree) = self.tree.read().await.as_ref() {
            return Ok(Arc::clone(tree));
        }
        self.refresh(fetch).await
    }

    /// Rebuild the tree from freshly fetched dataset fields.
    pub async fn refresh<F, Fut>(&self, fetch: F) -> Result<Arc<SchemaTree>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<DatasetFields>>>,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let datasets = fetch().await?;
        let tree = Arc::new(build_schema(&datasets));
        let mut slot = self.tree.write().await;
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&tree));
        } else {
            debug!(generation, "Discarding schema from superseded refresh");
        }
        Ok(tree)
    }

    /// The currently cached tree, if any.
    pub async fn current(&self) -> Option<Arc<SchemaTree>> {
        self.tree.read().await.clone()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    use super::*;

    fn field(name: &str, ty: &str) -> FieldDescriptor {
        FieldDescriptor::new(name, ty)
    }

    fn dataset(name: &str, fields: Vec<FieldDescriptor>) -> DatasetFields {
        DatasetFields {
            dataset_name: name.to_string(),
            fields,
        }
    }

    fn column_names(tree: &SchemaTree, table: &str) -> Vec<String> {
        tree.table(table)
            .expect("table exists")
            .ordered_columns
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    #[test]
    fn builds_single_database() {
        let tree = build_schema(&[
            dataset("vercel", vec![field("_time", "datetime"), field("status", "integer")]),
            dataset("logs", vec![]),
        ]);
        assert_eq!(tree.database_name(), "db");
        assert_eq!(tree.databases.len(), 1);
        assert_eq!(tree.tables().count(), 2);
        assert_eq!(column_names(&tree, "vercel"), vec!["_time", "status"]);
        assert!(tree.table("logs").unwrap().ordered_columns.is_empty());
    }

    #[test]
    fn skips_hidden_and_unmappable_fields() {
        let mut hidden = field("secret", "string");
        hidden.hidden = true;
        let tree = build_schema(&[dataset(
            "cloudflare",
            vec![
                field("a", "string"),
                hidden,
                field("b", "unknown_tag"),
                field("c", "boolean"),
            ],
        )]);
        assert_eq!(column_names(&tree, "cloudflare"), vec!["a", "c"]);
    }

    #[test]
    fn time_override_applies() {
        let tree = build_schema(&[dataset(
            "ds",
            vec![field("_time", "string"), field("_sysTime", "weird")],
        )]);
        let columns = &tree.table("ds").unwrap().ordered_columns;
        assert!(columns
            .iter()
            .all(|c| c.type_ == "System.DateTime" && c.csl_type == "datetime"));
        assert_eq!(columns.len(), 2);
    }

    #[test]
    fn idempotent() {
        let input = vec![dataset(
            "ds",
            vec![field("x", "integer|float"), field("y", "map")],
        )];
        assert_eq!(build_schema(&input), build_schema(&input));
    }

    #[test]
    fn serializes_kusto_layout() {
        let mut described = field("duration", "float");
        described.description = Some("Request duration".to_string());
        let tree = build_schema(&[dataset("ds", vec![described, field("n", "integer")])]);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Plugins": [],
                "Databases": {
                    "db": {
                        "Name": "db",
                        "Tables": {
                            "ds": {
                                "Name": "ds",
                                "OrderedColumns": [
                                    {
                                        "Name": "duration",
                                        "Type": "System.Double",
                                        "CslType": "real",
                                        "DocString": "Request duration",
                                    },
                                    {
                                        "Name": "n",
                                        "Type": "System.Int64",
                                        "CslType": "long",
                                    },
                                ],
                            },
                        },
                        "Functions": {},
                    },
                },
            })
        );
    }

    #[test]
    fn deserializes_lookup_response() {
        let jdoc = r#"[{"datasetName":"ifttt-weather","fields":[{"name":"humidity","type":"integer","unit":"percent100","hidden":false,"description":""}]},{"datasetName":"cloudwatch","fields":[{"name":"eks","type":"string","unit":"","hidden":true,"description":""}]}]"#;
        let datasets: Vec<DatasetFields> = serde_json::from_str(jdoc).unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].fields[0].unit.as_deref(), Some("percent100"));
        assert!(datasets[1].fields[0].hidden);
        let tree = build_schema(&datasets);
        assert_eq!(column_names(&tree, "ifttt-weather"), vec!["humidity"]);
        assert!(column_names(&tree, "cloudwatch").is_empty());
        // Empty descriptions are not carried over.
        assert_eq!(
            tree.table("ifttt-weather").unwrap().ordered_columns[0].doc_string,
            None
        );
    }

    #[tokio::test]
    async fn cache_builds_once() {
        let cache = SchemaCache::new();
        assert!(cache.current().await.is_none());
        let first = cache
            .get_or_build(|| async { Ok(vec![dataset("a", vec![])]) })
            .await
            .unwrap();
        let second = cache
            .get_or_build(|| async {
                Err(crate::Error::ConfigInvalid("fetched twice".to_string()))
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn refresh_replaces_tree() {
        let cache = SchemaCache::new();
        cache
            .get_or_build(|| async { Ok(vec![dataset("a", vec![])]) })
            .await
            .unwrap();
        cache
            .refresh(|| async { Ok(vec![dataset("b", vec![])]) })
            .await
            .unwrap();
        let current = cache.current().await.unwrap();
        assert!(current.table("a").is_none());
        assert!(current.table("b").is_some());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_tree() {
        let cache = SchemaCache::new();
        cache
            .get_or_build(|| async { Ok(vec![dataset("a", vec![])]) })
            .await
            .unwrap();
        let result = cache
            .refresh(|| async {
                Err(crate::Error::ConfigInvalid("no host".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.current().await.unwrap().table("a").is_some());
    }

    #[tokio::test]
    async fn stale_refresh_is_discarded() {
        let cache = SchemaCache::new();
        let (tx, rx) = oneshot::channel::<Vec<DatasetFields>>();
        let slow = cache.refresh(|| async move { Ok(rx.await.expect("sender kept alive")) });
        let fast = async {
            let tree = cache
                .refresh(|| async { Ok(vec![dataset("new", vec![])]) })
                .await;
            tx.send(vec![dataset("old", vec![])])
                .expect("receiver kept alive");
            tree
        };
        let (slow, fast) = tokio::join!(slow, fast);
        // The slow refresh still hands its own result back to its caller...
        assert!(slow.unwrap().table("old").is_some());
        assert!(fast.unwrap().table("new").is_some());
        // ...but the newer refresh wins the cache.
        let current = cache.current().await.unwrap();
        assert!(current.table("new").is_some());
        assert!(current.table("old").is_none());
    }
}
