//! Append-only, schema-stable CSV result sinks.
//!
//! One logical stream per collector. The writer reconciles each row against
//! the collector's declared schema: a field missing from an observation
//! produces an empty cell, never a shifted or null-padded row.

pub mod append;
pub mod archive;

use serde_json::Value;

use crate::collector::error::CollectError;
use crate::collector::{CollectorSpec, Observation};

pub use append::AppendSink;
pub use archive::ArchiveSink;

/// Physical write strategy, chosen per collector.
pub enum CsvSink {
    /// One file per collector name, header emitted once, rows appended.
    Append(AppendSink),
    /// One compressed file per acquisition cycle, named by its timestamp.
    Archive(ArchiveSink),
}

impl CsvSink {
    /// Persist a batch of observations from one acquisition cycle.
    pub fn write(
        &mut self,
        spec: &CollectorSpec,
        rows: &[Observation],
    ) -> Result<(), CollectError> {
        match self {
            Self::Append(sink) => sink.write(spec, rows),
            Self::Archive(sink) => sink.write(spec, rows),
        }
    }
}

/// Encode the header row: `timestamp` then the schema fields, in order.
pub(crate) fn encode_header(spec: &CollectorSpec) -> String {
    let mut line = String::from("timestamp");
    for field in &spec.fields {
        line.push(',');
        line.push_str(&escape_field(field));
    }
    line.push('\n');
    line
}

/// Encode one observation against the schema. Missing fields become empty
/// cells so columns stay stable for the lifetime of the file.
pub(crate) fn encode_row(spec: &CollectorSpec, obs: &Observation) -> String {
    let mut line = escape_field(&obs.timestamp);
    for field in &spec.fields {
        line.push(',');
        if let Some(value) = obs.fields.get(field) {
            line.push_str(&escape_field(&value_to_cell(value)));
        }
    }
    line.push('\n');
    line
}

/// Render a scalar JSON value as a CSV cell.
fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quote a field if it contains a separator, quote, or newline.
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        let mut quoted = String::with_capacity(field.len() + 2);
        quoted.push('"');
        for c in field.chars() {
            if c == '"' {
                quoted.push('"');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    } else {
        field.to_string()
    }
}
