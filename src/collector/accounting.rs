//! systemd IP accounting collector.
//!
//! Reads the cumulative IP traffic counters systemd keeps for the node's
//! service unit via `systemctl show`. The unit must have `IPAccounting=yes`;
//! anything else is a setup problem, not a transient glitch.

use std::collections::HashMap;

use tokio::process::Command;
use tracing::debug;

use super::error::CollectError;
use super::{Collector, CollectorSpec, Observation};

const FIELDS: &[&str] = &[
    "IPIngressPackets",
    "IPEgressPackets",
    "IPIngressBytes",
    "IPEgressBytes",
];

pub const DEFAULT_FREQUENCY_SECS: u64 = 5;

pub struct AccountingCollector {
    spec: CollectorSpec,
    service_unit: String,
}

impl AccountingCollector {
    pub fn new(service_unit: &str, frequency_secs: u64) -> Result<Self, CollectError> {
        Ok(Self {
            spec: CollectorSpec::new("accounting", frequency_secs, FIELDS)?,
            service_unit: service_unit.to_string(),
        })
    }
}

impl Collector for AccountingCollector {
    type Raw = HashMap<String, String>;

    fn spec(&self) -> &CollectorSpec {
        &self.spec
    }

    async fn acquire(&mut self) -> Result<Self::Raw, CollectError> {
        let mut cmd = Command::new("systemctl");
        cmd.arg("show").arg(&self.service_unit);
        for field in FIELDS {
            cmd.arg("-p").arg(field);
        }
        cmd.arg("-p").arg("IPAccounting");

        let output = cmd.output().await.map_err(|err| {
            CollectError::Transient(format!("failed to run systemctl show: {err}"))
        })?;
        if !output.status.success() {
            return Err(CollectError::Transient(format!(
                "systemctl show {} exited with {}",
                self.service_unit, output.status,
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let properties = parse_show_output(&stdout);
        debug!(unit = %self.service_unit, properties = properties.len(), "read unit accounting");

        check_accounting_enabled(&self.service_unit, &properties)?;
        Ok(properties)
    }

    fn format(&self, timestamp: &str, raw: Self::Raw) -> Vec<Observation> {
        let mut obs = Observation::new(timestamp);
        for &field in FIELDS {
            if let Some(value) = raw.get(field) {
                obs.set(field, value.as_str());
            }
        }
        vec![obs]
    }
}

fn check_accounting_enabled(
    unit: &str,
    properties: &HashMap<String, String>,
) -> Result<(), CollectError> {
    match properties.get("IPAccounting").map(String::as_str) {
        Some("yes") => Ok(()),
        other => Err(CollectError::Configuration(format!(
            "unit {unit} has IPAccounting={}, expected yes",
            other.unwrap_or("<unset>"),
        ))),
    }
}

/// Parse `systemctl show` output: one `Key=Value` pair per line.
fn parse_show_output(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
