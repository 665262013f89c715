use thiserror::Error;

/// Error taxonomy for collector loops.
///
/// Only `Transient` is recovered locally (the cycle is skipped and the loop
/// continues); everything else terminates the collector's loop.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A network or process call failed or returned non-success.
    /// Logged, cycle skipped, loop continues.
    #[error("transient I/O failure: {0}")]
    Transient(String),

    /// A required precondition is unmet and cannot become true without
    /// external reconfiguration. Fatal to the collector, never retried.
    #[error("configuration precondition unmet: {0}")]
    Configuration(String),

    /// An output write failed. Fatal to the collector.
    #[error("persisting observations: {0}")]
    Persistence(#[from] std::io::Error),
}

impl CollectError {
    /// Whether this error terminates the collector's loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transient(_))
    }

    /// Whether a supervisor may restart the collector after this error.
    /// Configuration errors are terminal: restarting cannot fix them.
    pub fn is_restartable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_not_fatal() {
        let err = CollectError::Transient("connection refused".to_string());
        assert!(!err.is_fatal());
        assert!(err.is_restartable());
    }

    #[test]
    fn test_configuration_is_fatal_and_terminal() {
        let err = CollectError::Configuration("accounting disabled".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_restartable());
    }

    #[test]
    fn test_persistence_is_fatal_but_restartable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = CollectError::from(io);
        assert!(err.is_fatal());
        assert!(err.is_restartable());
    }
}
