//! Axiom field types and the display types Grafana renders them as.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names of fields that Axiom always populates with timestamps.
///
/// Some schema responses tag these fields as strings, so they are forced to [`DisplayType::Time`].
pub const TIME_FIELDS: [&str; 2] = ["_time", "_sysTime"];

/// The union of numeric types Axiom reports for fields holding both integers and floats.
const NUMERIC_UNION: &str = "integer|float";

/// The error returned when an Axiom field type has no known mapping.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown Axiom field type {0:?}")]
pub struct UnmappableType(pub String);

/// A field type as reported by Axiom, either in dataset schemas or in query results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// `integer`.
    Integer,
    /// `float`.
    Float,
    /// The `integer|float` union.
    Numeric,
    /// `datetime` or `timestamp`.
    DateTime,
    /// `string`, plus `timespan` in query results.
    String,
    /// `boolean`, or `bool` in query results.
    Boolean,
    /// `array`.
    Array,
    /// `map`.
    Map,
    /// `unknown` in query results, or any union other than `integer|float`.
    Dynamic,
}

impl FromStr for ServiceType {
    type Err = UnmappableType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('|') {
            return Ok(if s == NUMERIC_UNION {
                Self::Numeric
            } else {
                Self::Dynamic
            });
        }
        Ok(match s {
            "integer" => Self::Integer,
            "float" => Self::Float,
            "datetime" | "timestamp" => Self::DateTime,
            "string" | "timespan" => Self::String,
            "boolean" | "bool" => Self::Boolean,
            "array" => Self::Array,
            "map" => Self::Map,
            "unknown" => Self::Dynamic,
            other => return Err(UnmappableType(other.to_string())),
        })
    }
}

/// The type a result column is displayed, sorted and rendered as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayType {
    /// Timestamps.
    Time,
    /// Integers and floating point numbers.
    Number,
    /// Text.
    String,
    /// `true` or `false`.
    Boolean,
    /// Arrays, objects and values of mixed type.
    Dynamic,
}

impl From<ServiceType> for DisplayType {
    fn from(other: ServiceType) -> Self {
        match other {
            ServiceType::Integer | ServiceType::Float | ServiceType::Numeric => Self::Number,
            ServiceType::DateTime => Self::Time,
            ServiceType::String => Self::String,
            ServiceType::Boolean => Self::Boolean,
            ServiceType::Array | ServiceType::Map | ServiceType::Dynamic => Self::Dynamic,
        }
    }
}

impl fmt::Display for DisplayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Time => "time",
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Dynamic => "dynamic",
        };
        f.write_str(s)
    }
}

/// The aggregation that produced a result column.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    /// The aggregation function, e.g. `count` or `histogram`.
    pub name: String,
}

/// Describes a field of a dataset or a column of a query result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// The field name.
    pub name: String,
    /// The Axiom field type, e.g. `integer` or `string|boolean`.
    #[serde(rename = "type", default)]
    pub service_type: String,
    /// Hidden fields are never offered for autocompletion.
    #[serde(default)]
    pub hidden: bool,
    /// A human readable description of the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The unit of the field's values, e.g. `ms` or `decbytes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// The aggregation that produced this column, for query result fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg: Option<Aggregation>,
}

impl FieldDescriptor {
    /// Create a visible descriptor with the given name and Axiom type.
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            ..Default::default()
        }
    }

    /// Resolve the display type of this field.
    pub fn display_type(&self) -> Result<DisplayType, UnmappableType> {
        resolve_display_type(&self.name, &self.service_type)
    }

    /// Whether this column was produced by the named aggregation function.
    pub fn is_aggregation(&self, name: &str) -> bool {
        self.agg.as_ref().is_some_and(|agg| agg.name == name)
    }
}

/// Map an Axiom field type to the type Grafana should display it as.
pub fn map_type(service_type: &str) -> Result<DisplayType, UnmappableType> {
    service_type.parse::<ServiceType>().map(DisplayType::from)
}

/// Whether `name` is one of the fields Axiom guarantees to hold timestamps.
pub fn is_time_field(name: &str) -> bool {
    TIME_FIELDS.contains(&name)
}

/// Resolve the display type of a named field.
///
/// [`TIME_FIELDS`] are always [`DisplayType::Time`], whatever their declared type.
pub fn resolve_display_type(name: &str, service_type: &str) -> Result<DisplayType, UnmappableType> {
    if is_time_field(name) {
        return Ok(DisplayType::Time);
    }
    map_type(service_type)
}

/// The column type pair used by the Kusto schema format: a .NET type name and a CSL type name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnType {
    /// The .NET type, e.g. `System.Int64`.
    pub type_: &'static str,
    /// The Kusto (CSL) type, e.g. `long`.
    pub csl_type: &'static str,
}

impl ColumnType {
    /// The column type used for [`TIME_FIELDS`].
    pub const DATETIME: Self = Self::new("System.DateTime", "datetime");

    const fn new(type_: &'static str, csl_type: &'static str) -> Self {
        Self { type_, csl_type }
    }
}

impl From<ServiceType> for ColumnType {
    fn from(other: ServiceType) -> Self {
        match other {
            ServiceType::Integer => Self::new("System.Int64", "long"),
            ServiceType::Float | ServiceType::Numeric => Self::new("System.Double", "real"),
            ServiceType::DateTime => Self::DATETIME,
            ServiceType::String => Self::new("System.String", "string"),
            ServiceType::Boolean => Self::new("System.Boolean", "bool"),
            ServiceType::Array => Self::new("Newtonsoft.Json.Linq.JArray", "dynamic"),
            ServiceType::Map => Self::new("Newtonsoft.Json.Linq.JObject", "dynamic"),
            ServiceType::Dynamic => Self::new("System.Object", "dynamic"),
        }
    }
}

/// Resolve the Kusto column type of a named field, applying the same time override as
/// [`resolve_display_type`].
pub fn resolve_column_type(name: &str, service_type: &str) -> Result<ColumnType, UnmappableType> {
    if is_time_field(name) {
        return Ok(ColumnType::DATETIME);
    }
    service_type.parse::<ServiceType>().map(ColumnType::from)
}
