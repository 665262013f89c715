use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::error::CollectError;
use crate::collector::{CollectorSpec, Observation};

use super::{encode_header, encode_row};

/// Simple append strategy: one CSV file per collector under the results
/// root. The header is emitted when the file is first created and never
/// again, including across process restarts. Each collector owns exactly
/// one output stream, so no cross-collector locking is needed.
pub struct AppendSink {
    path: PathBuf,
}

impl AppendSink {
    pub fn new(results_root: &Path, name: &str) -> Self {
        Self {
            path: results_root.join(format!("{name}.csv")),
        }
    }

    pub fn write(
        &mut self,
        spec: &CollectorSpec,
        rows: &[Observation],
    ) -> Result<(), CollectError> {
        if rows.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let write_header = !self.path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if write_header {
            file.write_all(encode_header(spec).as_bytes())?;
        }

        for row in rows {
            file.write_all(encode_row(spec, row).as_bytes())?;
        }

        debug!(
            collector = %spec.name,
            path = %self.path.display(),
            rows = rows.len(),
            "appended rows",
        );

        Ok(())
    }
}
