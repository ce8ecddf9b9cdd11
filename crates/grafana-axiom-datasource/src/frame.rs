//! Conversion of result tables into Grafana data frames.
//!
//! Each [`ResultField`] becomes one nullable [`data::Field`] typed after its
//! [`DisplayType`], except histogram aggregations, which expand into one field per
//! bucket boundary.
//!
//! Aggregated time series arrive in long form: one row per time bucket and group. These
//! are pivoted into wide form, with one labelled field per group, so each group is drawn
//! as its own series.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use grafana_plugin_sdk::{data, prelude::*};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    table::{ResultField, ResultTable, TableKind},
    types::DisplayType,
};

const HISTOGRAM: &str = "histogram";

/// The label identifying the upper bound of a histogram bucket field.
pub const BUCKET_LABEL: &str = "le";

/// Convert a result table into a data frame.
///
/// `executed_query` is attached as the frame's executed query string so it shows up in
/// Grafana's query inspector. Totals tables are marked with `"totals": true` in the
/// frame's custom metadata.
pub fn to_frame(table: &ResultTable, executed_query: &str) -> data::Frame {
    let mut meta = data::Metadata::default();
    meta.executed_query_string = Some(executed_query.to_string());
    if table.kind == TableKind::Totals {
        let mut custom = Map::new();
        custom.insert("totals".to_string(), Value::Bool(true));
        meta.custom = Some(custom);
    }
    let fields = match wide_fields(table) {
        Some(fields) => fields,
        None => table
            .fields
            .iter()
            .flat_map(|f| convert_field(f, &table.ref_id))
            .collect(),
    };
    data::Frame::new(table.name.clone())
        .with_fields(fields)
        .with_metadata(meta)
}

/// Pivot a long aggregated time series into wide form.
///
/// Applies when the table has exactly one time field, at least one string field and
/// otherwise only numeric aggregations. The string fields identify the group of each
/// row. The result has one time field holding the distinct timestamps in ascending order,
/// followed by one field per aggregation and group, labelled with the group's values.
/// Returns `None` for any other table shape, which is then converted as is.
fn wide_fields(table: &ResultTable) -> Option<Vec<data::Field>> {
    let mut time = None;
    let mut factors = vec![];
    let mut measures = vec![];
    for field in &table.fields {
        match field.display_type {
            DisplayType::Time if time.is_none() => time = Some(field),
            DisplayType::String if field.agg.is_none() => factors.push(field),
            DisplayType::Number if field.agg.is_some() && !field.is_aggregation(HISTOGRAM) => {
                measures.push(field)
            }
            _ => return None,
        }
    }
    let time = time?;
    if factors.is_empty() || measures.is_empty() {
        return None;
    }

    let row_times: Vec<Option<DateTime<Utc>>> = time
        .values
        .iter()
        .map(|v| to_time(v, &time.name, &table.ref_id))
        .collect();
    let times: Vec<DateTime<Utc>> = row_times
        .iter()
        .flatten()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let time_index: HashMap<DateTime<Utc>, usize> =
        times.iter().enumerate().map(|(i, t)| (*t, i)).collect();

    // Groups in order of first appearance.
    let mut groups: Vec<Vec<String>> = vec![];
    let mut group_index: HashMap<Vec<String>, usize> = HashMap::new();
    let row_groups: Vec<usize> = (0..table.row_count())
        .map(|row| {
            let key: Vec<String> = factors
                .iter()
                .map(|f| f.values.get(row).and_then(to_text).unwrap_or_default())
                .collect();
            *group_index.entry(key.clone()).or_insert_with(|| {
                groups.push(key);
                groups.len() - 1
            })
        })
        .collect();

    let mut fields = vec![times.iter().copied().map(Some).into_opt_field(time.name.clone())];
    for measure in measures {
        let mut grid = vec![vec![None; times.len()]; groups.len()];
        for (row, value) in measure.values.iter().enumerate() {
            if let Some(t) = row_times[row].and_then(|t| time_index.get(&t)) {
                grid[row_groups[row]][*t] = value.as_f64();
            }
        }
        fields.extend(grid.into_iter().zip(&groups).map(|(values, group)| {
            let labels: BTreeMap<String, String> = factors
                .iter()
                .map(|f| f.name.clone())
                .zip(group.iter().cloned())
                .collect();
            with_unit(
                values
                    .into_iter()
                    .into_opt_field(measure.name.clone())
                    .with_labels(labels),
                measure.unit.as_deref(),
            )
        }));
    }
    Some(fields)
}

fn convert_field(field: &ResultField, ref_id: &str) -> Vec<data::Field> {
    if field.is_aggregation(HISTOGRAM) {
        return histogram_fields(field);
    }
    let converted = match field.display_type {
        DisplayType::Time => field
            .values
            .iter()
            .map(|v| to_time(v, &field.name, ref_id))
            .into_opt_field(field.name.clone()),
        DisplayType::Number => field
            .values
            .iter()
            .map(Value::as_f64)
            .into_opt_field(field.name.clone()),
        DisplayType::Boolean => field
            .values
            .iter()
            .map(Value::as_bool)
            .into_opt_field(field.name.clone()),
        DisplayType::String | DisplayType::Dynamic => field
            .values
            .iter()
            .map(to_text)
            .into_opt_field(field.name.clone()),
    };
    vec![with_unit(converted, field.unit.as_deref())]
}

fn with_unit(field: data::Field, unit: Option<&str>) -> data::Field {
    match unit {
        Some(unit) => {
            let mut config = data::FieldConfig::default();
            config.unit = Some(unit.to_string());
            field.with_config(config)
        }
        None => field,
    }
}

/// Timestamps arrive as RFC 3339 strings, or occasionally as epoch milliseconds.
fn to_time(value: &Value, name: &str, ref_id: &str) -> Option<DateTime<Utc>> {
    match value {
        Value::Null => None,
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(error) => {
                warn!(ref_id, field = name, value = %s, %error, "Failed to parse time");
                None
            }
        },
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        other => {
            warn!(ref_id, field = name, value = %other, "Unexpected time value");
            None
        }
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// The `(to, count)` pairs of one histogram cell.
fn buckets(cell: &Value) -> impl Iterator<Item = (f64, Option<f64>)> + '_ {
    cell.as_array()
        .into_iter()
        .flatten()
        .filter_map(|bucket| {
            let to = bucket.get("to")?.as_f64()?;
            Some((to, bucket.get("count").and_then(Value::as_f64)))
        })
}

/// Expand a histogram column into one field per bucket upper bound, labelled with
/// [`BUCKET_LABEL`] and sorted ascending. Rows without a bucket for a boundary are null.
fn histogram_fields(field: &ResultField) -> Vec<data::Field> {
    let mut boundaries: Vec<f64> = field
        .values
        .iter()
        .flat_map(|cell| buckets(cell).map(|(to, _)| to))
        .collect();
    boundaries.sort_by(f64::total_cmp);
    boundaries.dedup();

    let rows: Vec<Vec<(f64, Option<f64>)>> =
        field.values.iter().map(|cell| buckets(cell).collect()).collect();
    boundaries
        .iter()
        .map(|&boundary| {
            let counts = rows.iter().map(|row| {
                row.iter()
                    .find(|(to, _)| *to == boundary)
                    .and_then(|(_, count)| *count)
            });
            let labels = BTreeMap::from([(BUCKET_LABEL.to_string(), boundary.to_string())]);
            with_unit(
                counts.into_opt_field(field.name.clone()).with_labels(labels),
                field.unit.as_deref(),
            )
        })
        .collect()
}
