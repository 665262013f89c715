//! Target process discovery.
//!
//! The tracer attaches to a running node by process name. Exactly one
//! matching process is required: zero means the node is not running, more
//! than one means the name is ambiguous and attaching would be a guess.

use crate::collector::error::CollectError;

/// Find the single PID whose `/proc/<pid>/comm` matches `name`.
#[cfg(target_os = "linux")]
pub fn find_unique_pid(name: &str) -> Result<u32, CollectError> {
    let entries = std::fs::read_dir("/proc").map_err(|err| {
        CollectError::Configuration(format!("reading /proc: {err}"))
    })?;

    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        // Processes may exit between readdir and the comm read.
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim_end() == name {
            matches.push(pid);
        }
    }

    match matches.len() {
        1 => Ok(matches[0]),
        0 => Err(CollectError::Configuration(format!(
            "no process named {name} found"
        ))),
        n => Err(CollectError::Configuration(format!(
            "expected one process named {name}, found {n}"
        ))),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn find_unique_pid(name: &str) -> Result<u32, CollectError> {
    let _ = name;
    Err(CollectError::Configuration(
        "process discovery requires /proc and is only supported on linux".to_string(),
    ))
}

/// Resolve the executable path behind a PID, for probe attachment.
#[cfg(target_os = "linux")]
pub fn exe_path(pid: u32) -> Result<std::path::PathBuf, CollectError> {
    std::fs::read_link(format!("/proc/{pid}/exe")).map_err(|err| {
        CollectError::Configuration(format!("resolving executable of pid {pid}: {err}"))
    })
}

#[cfg(not(target_os = "linux"))]
pub fn exe_path(pid: u32) -> Result<std::path::PathBuf, CollectError> {
    Err(CollectError::Configuration(format!(
        "resolving executable of pid {pid} requires /proc and is only supported on linux"
    )))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_name_is_configuration() {
        let err = find_unique_pid("no-such-process-zzz").unwrap_err();
        assert!(matches!(err, CollectError::Configuration(_)));
        assert!(err.to_string().contains("no process named"));
    }
}
