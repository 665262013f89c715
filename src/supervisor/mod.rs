//! Collector supervision.
//!
//! Every enabled collector runs in its own task; one collector failing
//! never takes down its siblings. Failures that restarting might cure get
//! retried with exponential backoff, configuration failures are terminal.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::accounting::AccountingCollector;
use crate::collector::error::CollectError;
use crate::collector::rpc::{RpcCall, RpcCollector};
use crate::collector::run_collector;
use crate::config::{Config, SupervisorConfig};
use crate::rpc::HttpTransport;
use crate::sink::{AppendSink, ArchiveSink, CsvSink};

/// Restart policy derived from configuration.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub restart: bool,
    pub max_restarts: u32,
    pub backoff: Duration,
    pub backoff_cap: Duration,
}

impl RestartPolicy {
    pub fn from_config(cfg: &SupervisorConfig) -> Self {
        Self {
            restart: cfg.restart,
            max_restarts: cfg.max_restarts,
            backoff: cfg.backoff,
            backoff_cap: cfg.backoff_cap,
        }
    }

    /// Delay before restart attempt `attempt` (zero-based), doubling each
    /// time up to the cap.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Run one collector loop under the restart policy until it stops for good.
///
/// `make` builds a fresh loop future per attempt. Clean exit (cancellation)
/// and configuration errors end supervision; anything else is retried while
/// the policy allows.
pub async fn supervise<F, Fut>(
    name: &str,
    policy: RestartPolicy,
    cancel: CancellationToken,
    mut make: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CollectError>>,
{
    let mut attempts = 0u32;
    loop {
        match make().await {
            Ok(()) => {
                info!(collector = name, "collector stopped");
                return;
            }
            Err(err) if !err.is_restartable() => {
                error!(collector = name, error = %err, "collector failed, not restartable");
                return;
            }
            Err(err) => {
                if !policy.restart || attempts >= policy.max_restarts {
                    error!(
                        collector = name,
                        error = %err,
                        attempts,
                        "collector failed, giving up"
                    );
                    return;
                }
                let delay = policy.delay(attempts);
                attempts += 1;
                warn!(
                    collector = name,
                    error = %err,
                    attempt = attempts,
                    delay = ?delay,
                    "collector failed, restarting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

fn sink_for(results_root: &Path, call: RpcCall) -> CsvSink {
    if call.archive() {
        CsvSink::Archive(ArchiveSink::new(results_root, call.method()))
    } else {
        CsvSink::Append(AppendSink::new(results_root, call.method()))
    }
}

/// Build all enabled collectors and run them to completion.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<()> {
    let policy = RestartPolicy::from_config(&cfg.supervisor);
    let results_root = PathBuf::from(&cfg.results_path);
    let mut tasks = JoinSet::new();

    for &call in RpcCall::all() {
        if !cfg.rpc_call_enabled(call) {
            continue;
        }
        let frequency = cfg.rpc_call_frequency(call);
        let rpc_cfg = cfg.rpc.clone();
        let results_root = results_root.clone();
        let policy = policy.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let inner = cancel.clone();
            supervise(call.method(), policy, cancel, move || {
                let transport = HttpTransport::new(&rpc_cfg);
                let sink = sink_for(&results_root, call);
                let cancel = inner.clone();
                async move {
                    let collector = RpcCollector::new(call, transport, frequency)?;
                    run_collector(collector, sink, cancel).await
                }
            })
            .await;
        });
    }

    if cfg.collectors.accounting.enabled {
        let unit = cfg.collectors.accounting.service_unit.clone();
        let frequency = cfg.collectors.accounting.frequency.as_secs();
        let results_root = results_root.clone();
        let policy = policy.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let inner = cancel.clone();
            supervise("accounting", policy, cancel, move || {
                let unit = unit.clone();
                let sink = CsvSink::Append(AppendSink::new(&results_root, "accounting"));
                let cancel = inner.clone();
                async move {
                    let collector = AccountingCollector::new(&unit, frequency)?;
                    run_collector(collector, sink, cancel).await
                }
            })
            .await;
        });
    }

    if cfg.collectors.traffic.enabled {
        spawn_traffic(&cfg, &results_root, &policy, &cancel, &mut tasks);
    }

    if tasks.is_empty() {
        bail!("no collectors enabled, nothing to do");
    }
    info!(collectors = tasks.len(), "collectors started");

    while tasks.join_next().await.is_some() {}
    Ok(())
}

#[cfg(feature = "bpf")]
fn spawn_traffic(
    cfg: &Config,
    results_root: &Path,
    policy: &RestartPolicy,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) {
    use crate::collector::traffic::TrafficCollector;
    use crate::tracer::bpf::UsdtTracer;

    let process_name = cfg.collectors.traffic.process_name.clone();
    let frequency = cfg.collectors.traffic.frequency.as_secs();
    let results_root = results_root.to_path_buf();
    let policy = policy.clone();
    let cancel = cancel.clone();
    tasks.spawn(async move {
        let inner = cancel.clone();
        supervise("net", policy, cancel, move || {
            let tracer = UsdtTracer::new(&process_name);
            let sink = CsvSink::Append(AppendSink::new(&results_root, "net"));
            let cancel = inner.clone();
            async move {
                let collector = TrafficCollector::new(tracer, frequency, cancel.clone())?;
                run_collector(collector, sink, cancel).await
            }
        })
        .await;
    });
}

#[cfg(not(feature = "bpf"))]
fn spawn_traffic(
    _cfg: &Config,
    _results_root: &Path,
    _policy: &RestartPolicy,
    _cancel: &CancellationToken,
    _tasks: &mut JoinSet<()>,
) {
    warn!("traffic collector enabled but this build lacks kernel probe support, skipping");
}
