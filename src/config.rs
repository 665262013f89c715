use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collector::accounting;
use crate::collector::rpc::RpcCall;
use crate::collector::traffic;

/// Top-level configuration for the monitoring agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory all collector output is written under. Default: "results".
    #[serde(default = "default_results_path")]
    pub results_path: String,

    /// Bitcoin Core JSON-RPC connection configuration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Per-collector enablement and cadence configuration.
    #[serde(default)]
    pub collectors: CollectorsConfig,

    /// Collector restart policy.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Bitcoin Core JSON-RPC connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Node host. Default: "127.0.0.1".
    #[serde(default = "default_rpc_host")]
    pub host: String,

    /// Node RPC port. Default: 8332.
    #[serde(default = "default_rpc_port")]
    pub port: u16,

    /// RPC username.
    #[serde(default)]
    pub user: String,

    /// RPC password.
    #[serde(default)]
    pub password: String,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Per-collector enablement and cadence configuration.
#[derive(Debug, Default, Deserialize)]
pub struct CollectorsConfig {
    /// RPC-backed collectors.
    #[serde(default)]
    pub rpc: RpcCollectorsConfig,

    /// systemd IP accounting collector.
    #[serde(default)]
    pub accounting: AccountingConfig,

    /// Kernel-probe P2P traffic collector.
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// RPC-backed collector configuration.
#[derive(Debug, Deserialize)]
pub struct RpcCollectorsConfig {
    /// Enable the RPC collector family. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-call overrides keyed by RPC method name.
    #[serde(default)]
    pub calls: HashMap<String, RpcCallConfig>,
}

/// Override block for a single RPC call.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcCallConfig {
    /// Disable this one call. Default: enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cadence override. Default: the call's built-in cadence.
    #[serde(default, with = "humantime_serde::option")]
    pub frequency: Option<Duration>,
}

/// systemd IP accounting collector configuration.
#[derive(Debug, Deserialize)]
pub struct AccountingConfig {
    /// Enable the accounting collector. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// systemd unit the node runs under. Default: "bitcoind.service".
    #[serde(default = "default_service_unit")]
    pub service_unit: String,

    /// Sampling cadence. Default: 5s.
    #[serde(default = "default_accounting_frequency", with = "humantime_serde")]
    pub frequency: Duration,
}

/// Kernel-probe P2P traffic collector configuration.
#[derive(Debug, Deserialize)]
pub struct TrafficConfig {
    /// Enable the traffic collector. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Process name to attach probes to. Default: "bitcoind".
    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Drain cadence. Default: 5s.
    #[serde(default = "default_traffic_frequency", with = "humantime_serde")]
    pub frequency: Duration,
}

/// Collector restart policy.
#[derive(Debug, Deserialize)]
pub struct SupervisorConfig {
    /// Restart collectors that fail with a recoverable error. Default: true.
    #[serde(default = "default_true")]
    pub restart: bool,

    /// Give up on a collector after this many restarts. Default: 5.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Initial restart backoff, doubled per attempt. Default: 1s.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Backoff ceiling. Default: 60s.
    #[serde(default = "default_backoff_cap", with = "humantime_serde")]
    pub backoff_cap: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_results_path() -> String {
    "results".to_string()
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    8332
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_service_unit() -> String {
    "bitcoind.service".to_string()
}

fn default_accounting_frequency() -> Duration {
    Duration::from_secs(accounting::DEFAULT_FREQUENCY_SECS)
}

fn default_process_name() -> String {
    "bitcoind".to_string()
}

fn default_traffic_frequency() -> Duration {
    Duration::from_secs(traffic::DEFAULT_FREQUENCY_SECS)
}

fn default_max_restarts() -> u32 {
    5
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            results_path: default_results_path(),
            rpc: RpcConfig::default(),
            collectors: CollectorsConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            port: default_rpc_port(),
            user: String::new(),
            password: String::new(),
            timeout: default_rpc_timeout(),
        }
    }
}

impl Default for RpcCollectorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            calls: HashMap::new(),
        }
    }
}

impl Default for RpcCallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: None,
        }
    }
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_unit: default_service_unit(),
            frequency: default_accounting_frequency(),
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            process_name: default_process_name(),
            frequency: default_traffic_frequency(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: true,
            max_restarts: default_max_restarts(),
            backoff: default_backoff(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.results_path.is_empty() {
            bail!("results_path is required");
        }

        if self.collectors.rpc.enabled {
            if self.rpc.host.is_empty() {
                bail!("rpc.host is required when RPC collectors are enabled");
            }
            for name in self.collectors.rpc.calls.keys() {
                if RpcCall::from_method(name).is_none() {
                    bail!("collectors.rpc.calls: unknown RPC call {name}");
                }
            }
            for (name, call) in &self.collectors.rpc.calls {
                if let Some(freq) = call.frequency {
                    check_frequency(&format!("collectors.rpc.calls.{name}"), freq)?;
                }
            }
        }

        if self.collectors.accounting.enabled {
            if self.collectors.accounting.service_unit.is_empty() {
                bail!("collectors.accounting.service_unit is required");
            }
            check_frequency("collectors.accounting", self.collectors.accounting.frequency)?;
        }

        if self.collectors.traffic.enabled {
            if self.collectors.traffic.process_name.is_empty() {
                bail!("collectors.traffic.process_name is required");
            }
            check_frequency("collectors.traffic", self.collectors.traffic.frequency)?;
        }

        Ok(())
    }

    /// Whether a given RPC call should run.
    pub fn rpc_call_enabled(&self, call: RpcCall) -> bool {
        self.collectors.rpc.enabled
            && self
                .collectors
                .rpc
                .calls
                .get(call.method())
                .map_or(true, |c| c.enabled)
    }

    /// Configured cadence override for a call, in whole seconds.
    pub fn rpc_call_frequency(&self, call: RpcCall) -> Option<u64> {
        self.collectors
            .rpc
            .calls
            .get(call.method())
            .and_then(|c| c.frequency)
            .map(|d| d.as_secs())
    }
}

/// Cadences drive second-aligned scheduling, so they must be a whole,
/// positive number of seconds.
fn check_frequency(what: &str, freq: Duration) -> Result<()> {
    if freq.is_zero() {
        bail!("{what}: frequency must be positive");
    }
    if freq.subsec_nanos() != 0 {
        bail!("{what}: frequency must be a whole number of seconds");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.results_path, "results");
        assert_eq!(cfg.rpc.host, "127.0.0.1");
        assert_eq!(cfg.rpc.port, 8332);
        assert_eq!(cfg.rpc.timeout, Duration::from_secs(30));
        assert!(cfg.collectors.rpc.enabled);
        assert!(!cfg.collectors.accounting.enabled);
        assert!(!cfg.collectors.traffic.enabled);
        assert_eq!(cfg.collectors.accounting.service_unit, "bitcoind.service");
        assert_eq!(cfg.collectors.traffic.process_name, "bitcoind");
        assert!(cfg.supervisor.restart);
        assert_eq!(cfg.supervisor.max_restarts, 5);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
log_level: debug
results_path: /var/lib/monitor
rpc:
  host: 10.0.0.2
  port: 18332
  user: monitor
  password: hunter2
  timeout: 10s
collectors:
  rpc:
    calls:
      getpeerinfo:
        frequency: 30s
      gettxoutsetinfo:
        enabled: false
  accounting:
    enabled: true
    service_unit: bitcoind.service
    frequency: 5s
  traffic:
    enabled: true
    process_name: bitcoind
supervisor:
  restart: true
  max_restarts: 3
  backoff: 2s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.rpc.port, 18332);
        assert_eq!(cfg.rpc.timeout, Duration::from_secs(10));
        assert_eq!(cfg.rpc_call_frequency(RpcCall::GetPeerInfo), Some(30));
        assert!(!cfg.rpc_call_enabled(RpcCall::GetTxoutSetInfo));
        assert!(cfg.rpc_call_enabled(RpcCall::GetConnectionCount));
        assert_eq!(cfg.rpc_call_frequency(RpcCall::GetConnectionCount), None);
        assert!(cfg.collectors.traffic.enabled);
        assert_eq!(cfg.supervisor.max_restarts, 3);
        assert_eq!(cfg.supervisor.backoff, Duration::from_secs(2));
        assert_eq!(cfg.supervisor.backoff_cap, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_rpc_call_rejected() {
        let mut cfg = Config::default();
        cfg.collectors
            .rpc
            .calls
            .insert("getblockcount".to_string(), RpcCallConfig::default());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown RPC call"));
    }

    #[test]
    fn test_fractional_frequency_rejected() {
        let mut cfg = Config::default();
        cfg.collectors.accounting.enabled = true;
        cfg.collectors.accounting.frequency = Duration::from_millis(1500);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"));
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let mut cfg = Config::default();
        cfg.collectors
            .rpc
            .calls
            .insert(
                "getpeerinfo".to_string(),
                RpcCallConfig {
                    enabled: true,
                    frequency: Some(Duration::ZERO),
                },
            );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_disabled_rpc_skips_rpc_checks() {
        let mut cfg = Config::default();
        cfg.collectors.rpc.enabled = false;
        cfg.rpc.host = String::new();
        cfg.validate().expect("valid without RPC");
        assert!(!cfg.rpc_call_enabled(RpcCall::GetPeerInfo));
    }
}
