//! The generic collector abstraction and the loop shared by all variants.
//!
//! A collector encapsulates one data source, one cadence, and one output
//! stream. All variants run the same state machine:
//! SLEEPING → ACQUIRING → FORMATTING → PERSISTING → RESCHEDULING → SLEEPING.

pub mod accounting;
pub mod error;
pub mod rpc;
pub mod traffic;

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::schedule;
use crate::sink::CsvSink;

use self::error::CollectError;

/// Immutable identity and schema of one collector.
#[derive(Debug, Clone)]
pub struct CollectorSpec {
    /// Collector name; also names the output stream.
    pub name: String,
    /// Cadence in seconds, strictly positive.
    pub frequency_secs: u64,
    /// Ordered output schema, not counting the implicit `timestamp` column.
    pub fields: Vec<String>,
}

impl CollectorSpec {
    pub fn new(name: &str, frequency_secs: u64, fields: &[&str]) -> Result<Self, CollectError> {
        if frequency_secs == 0 {
            return Err(CollectError::Configuration(format!(
                "collector {name}: frequency must be strictly positive",
            )));
        }

        Ok(Self {
            name: name.to_string(),
            frequency_secs,
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
        })
    }
}

/// One timestamped row of scalar fields produced by one acquisition cycle.
///
/// Fields absent from the source are simply not set; the sink renders them
/// as empty cells against the declared schema.
#[derive(Debug, Clone)]
pub struct Observation {
    pub timestamp: String,
    pub fields: HashMap<String, Value>,
}

impl Observation {
    pub fn new(timestamp: &str) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            fields: HashMap::new(),
        }
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// One independently-scheduled acquisition + persistence unit.
///
/// The set of acquisition strategies is small and fixed (RPC, subprocess,
/// kernel probe), so this is a closed capability interface rather than an
/// open subclassing surface. `format` is a pure projection; persistence is
/// owned by the shared loop.
pub trait Collector: Send {
    /// Source-specific raw acquisition result.
    type Raw: Send;

    fn spec(&self) -> &CollectorSpec;

    /// Perform one data fetch. A `Transient` error skips the cycle; any
    /// other error terminates the loop.
    fn acquire(&mut self) -> impl Future<Output = Result<Self::Raw, CollectError>> + Send;

    /// Project the raw result onto the declared schema. Must tolerate
    /// missing optional keys by dropping the column for that row.
    fn format(&self, timestamp: &str, raw: Self::Raw) -> Vec<Observation>;
}

/// Drive one collector forever: acquire, format, persist, reschedule.
///
/// The first cycle runs immediately on startup; every subsequent cycle is
/// frequency-aligned. Returns `Ok(())` only on cancellation.
pub async fn run_collector<C: Collector>(
    mut collector: C,
    mut sink: CsvSink,
    cancel: CancellationToken,
) -> Result<(), CollectError> {
    let name = collector.spec().name.clone();
    let frequency_secs = collector.spec().frequency_secs;

    info!(collector = %name, frequency_secs, "collector loop started");

    loop {
        let timestamp = schedule::utc_timestamp();

        match collector.acquire().await {
            Ok(raw) => {
                let rows = collector.format(&timestamp, raw);
                if rows.is_empty() {
                    debug!(collector = %name, "no observations this cycle");
                } else {
                    sink.write(collector.spec(), &rows).inspect_err(|e| {
                        error!(collector = %name, error = %e, "persist failed");
                    })?;
                    debug!(collector = %name, rows = rows.len(), "persisted observations");
                }
            }
            Err(CollectError::Transient(msg)) => {
                // Skip this cycle's output and proceed to rescheduling.
                error!(collector = %name, error = %msg, "acquisition failed, skipping cycle");
            }
            Err(e) => {
                error!(collector = %name, error = %e, "collector terminating");
                return Err(e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(collector = %name, "collector loop cancelled");
                return Ok(());
            }
            _ = schedule::sleep_until_next(&name, frequency_secs) => {}
        }
    }
}
