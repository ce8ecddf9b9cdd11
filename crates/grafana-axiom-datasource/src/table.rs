//! Axiom's tabular query response and the typed result tables built from it.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    error::{Error, Result},
    types::{Aggregation, DisplayType, FieldDescriptor},
};

/// The body of a successful APL query in the `tabular` format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AplResponse {
    /// The result format; always `tabular` for requests made by this crate.
    #[serde(default)]
    pub format: String,
    /// The result tables, in the order Axiom returned them.
    #[serde(default)]
    pub tables: Vec<ResponseTable>,
    /// The datasets the query read from.
    #[serde(default)]
    pub dataset_names: Vec<String>,
}

/// A group-by key of a [`ResponseTable`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// The grouped column's name.
    pub name: String,
}

/// A single table of an [`AplResponse`], stored column-major.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTable {
    /// The table name, e.g. `0` or `_totals`.
    #[serde(default)]
    pub name: String,
    /// One descriptor per column.
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    /// The column values; `columns[i]` holds the values of `fields[i]`.
    #[serde(default)]
    pub columns: Vec<Vec<Value>>,
    /// The columns the table is grouped by.
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// Which part of a query response a [`ResultTable`] was built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// The query's result rows.
    Primary,
    /// The overall aggregation totals of a grouped query.
    Totals,
}

/// A typed column of a [`ResultTable`].
#[derive(Clone, Debug, PartialEq)]
pub struct ResultField {
    /// The column name.
    pub name: String,
    /// How the values are presented to Grafana.
    pub display_type: DisplayType,
    /// The aggregation that produced the column, if any.
    pub agg: Option<Aggregation>,
    /// The unit of the values, if Axiom reported one.
    pub unit: Option<String>,
    /// The raw values, in row order.
    pub values: Vec<Value>,
}

impl ResultField {
    /// Whether this column was produced by the named aggregation function.
    pub fn is_aggregation(&self, name: &str) -> bool {
        self.agg.as_ref().is_some_and(|agg| agg.name == name)
    }
}

/// A response table with resolved display types, tagged with the query it answers.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultTable {
    /// The name of the response table.
    pub name: String,
    /// The `refId` of the query target this table answers.
    pub ref_id: String,
    /// Whether this is the result or the totals of the query.
    pub kind: TableKind,
    /// The mappable columns, in response order.
    pub fields: Vec<ResultField>,
}

impl ResultTable {
    /// The number of rows in the table.
    pub fn row_count(&self) -> usize {
        self.fields.first().map_or(0, |f| f.values.len())
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&ResultField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Build a typed [`ResultTable`] from a response table.
///
/// # Errors
///
/// Returns [`Error::MalformedResponse`] if the table does not have exactly one column
/// per field, or if its columns differ in length. Fields whose type cannot be mapped
/// are omitted with a warning.
pub fn build_result_table(
    table: &ResponseTable,
    ref_id: impl Into<String>,
    kind: TableKind,
) -> Result<ResultTable> {
    let malformed = |reason: String| Error::MalformedResponse {
        table: table.name.clone(),
        reason,
    };
    if table.fields.len() != table.columns.len() {
        return Err(malformed(format!(
            "{} fields but {} columns",
            table.fields.len(),
            table.columns.len()
        )));
    }
    if let Some(first) = table.columns.first() {
        if let Some((i, column)) = table
            .columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != first.len())
        {
            return Err(malformed(format!(
                "column {:?} has {} rows, expected {}",
                table.fields[i].name,
                column.len(),
                first.len()
            )));
        }
    }

    let ref_id = ref_id.into();
    let fields = table
        .fields
        .iter()
        .zip(&table.columns)
        .filter_map(|(descriptor, column)| match descriptor.display_type() {
            Ok(display_type) => Some(ResultField {
                name: descriptor.name.clone(),
                display_type,
                agg: descriptor.agg.clone(),
                unit: descriptor.unit.clone().filter(|u| !u.is_empty()),
                values: column.clone(),
            }),
            Err(error) => {
                warn!(
                    ref_id = %ref_id,
                    table = %table.name,
                    field = %descriptor.name,
                    %error,
                    "Omitting field with unmappable type",
                );
                None
            }
        })
        .collect();
    Ok(ResultTable {
        name: table.name.clone(),
        ref_id,
        kind,
        fields,
    })
}

/// Pick the result tables of a response and build them.
///
/// Without `totals` only the first table is used. With `totals` and at least two
/// tables, the second table is the primary result and the first is returned as a
/// [`TableKind::Totals`] table after it. A malformed totals table is dropped with a
/// warning; only a malformed primary table fails the query. A response without tables
/// yields no results.
pub fn select_tables(
    response: &AplResponse,
    totals: bool,
    ref_id: &str,
) -> Result<Vec<ResultTable>> {
    match response.tables.as_slice() {
        [] => Ok(vec![]),
        [totals_table, primary, ..] if totals => {
            let mut tables = vec![build_result_table(primary, ref_id, TableKind::Primary)?];
            match build_result_table(totals_table, ref_id, TableKind::Totals) {
                Ok(table) => tables.push(table),
                Err(error) => warn!(ref_id, %error, "Dropping malformed totals table"),
            }
            Ok(tables)
        }
        [primary, ..] => Ok(vec![build_result_table(primary, ref_id, TableKind::Primary)?]),
    }
}
