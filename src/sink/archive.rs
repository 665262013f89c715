use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, error};

use crate::collector::error::CollectError;
use crate::collector::{CollectorSpec, Observation};

use super::{encode_header, encode_row};

/// Time-bucketed archive strategy for high-volume, low-frequency dumps
/// (e.g. full address-table snapshots). Each acquisition cycle writes a new
/// gzip-compressed CSV named by the cycle's timestamp, nested under a
/// per-collector directory. Writes are idempotent by timestamp: an existing
/// file of the same name is never overwritten.
pub struct ArchiveSink {
    dir: PathBuf,
}

impl ArchiveSink {
    pub fn new(results_root: &Path, name: &str) -> Self {
        Self {
            dir: results_root.join(name),
        }
    }

    pub fn write(
        &mut self,
        spec: &CollectorSpec,
        rows: &[Observation],
    ) -> Result<(), CollectError> {
        let Some(first) = rows.first() else {
            return Ok(());
        };

        let path = self.dir.join(format!("{}.csv.gz", first.timestamp));

        if path.exists() {
            // Guards against a double invocation producing divergent
            // duplicate snapshots for the same cycle.
            error!(
                collector = %spec.name,
                path = %path.display(),
                "output file already exists, skipping",
            );
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;

        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());

        encoder.write_all(encode_header(spec).as_bytes())?;
        for row in rows {
            encoder.write_all(encode_row(spec, row).as_bytes())?;
        }
        encoder.finish()?;

        debug!(
            collector = %spec.name,
            path = %path.display(),
            rows = rows.len(),
            "wrote archive snapshot",
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn spec() -> CollectorSpec {
        CollectorSpec::new("getrawaddrman", 86_400, &["cache_id", "address", "port"])
            .expect("valid spec")
    }

    fn obs(cache_id: &str, address: &str, port: u16) -> Observation {
        let mut o = Observation::new("2024-01-01T00:00:00Z");
        o.set("cache_id", cache_id);
        o.set("address", address);
        o.set("port", port);
        o
    }

    fn read_archive(path: &Path) -> String {
        let mut decoder = GzDecoder::new(File::open(path).expect("open archive"));
        let mut content = String::new();
        decoder.read_to_string(&mut content).expect("decompress");
        content
    }

    #[test]
    fn test_archive_written_with_header_and_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = ArchiveSink::new(dir.path(), "getrawaddrman");

        sink.write(&spec(), &[obs("new", "203.0.113.5", 8333)])
            .expect("write");

        let path = dir
            .path()
            .join("getrawaddrman/2024-01-01T00:00:00Z.csv.gz");
        let content = read_archive(&path);
        assert_eq!(
            content,
            "timestamp,cache_id,address,port\n2024-01-01T00:00:00Z,new,203.0.113.5,8333\n",
        );
    }

    #[test]
    fn test_existing_archive_is_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = ArchiveSink::new(dir.path(), "getrawaddrman");

        sink.write(&spec(), &[obs("new", "203.0.113.5", 8333)])
            .expect("first write");

        // Same timestamp, different content: must be skipped, not merged.
        sink.write(&spec(), &[obs("tried", "198.51.100.1", 18333)])
            .expect("second write is a no-op");

        let path = dir
            .path()
            .join("getrawaddrman/2024-01-01T00:00:00Z.csv.gz");
        let content = read_archive(&path);
        assert!(content.contains("203.0.113.5"));
        assert!(!content.contains("198.51.100.1"));
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = ArchiveSink::new(dir.path(), "getrawaddrman");
        sink.write(&spec(), &[]).expect("empty write");
        assert!(!dir.path().join("getrawaddrman").exists());
    }
}
