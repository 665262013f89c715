//! Kernel-side P2P message tracing.
//!
//! The tracer taps the node's `net:inbound_message` and
//! `net:outbound_message` probe points and streams one [`TraceEvent`] per
//! wire message. The BPF-backed implementation lives in [`bpf`] and is
//! feature gated; consumers only see the [`EventSource`] seam.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "bpf")]
pub mod bpf;

/// Which way a P2P message travelled relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// Short form used in output rows.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

/// One P2P wire message observed at the node boundary.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub peer_id: u64,
    pub peer_addr: String,
    pub peer_conn_type: String,
    pub msg_type: String,
    pub msg_size: u64,
    pub direction: Direction,
}

/// Producer side of the trace stream.
///
/// `start` loads whatever instrumentation the implementation needs and
/// returns the receiving end of the event channel. The source stops
/// producing when `cancel` fires.
pub trait EventSource: Send {
    fn start(
        &mut self,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<mpsc::Receiver<TraceEvent>>> + Send;
}
