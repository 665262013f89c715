//! P2P traffic collector.
//!
//! Drains the tracer's event stream on a short cadence, logs one row per
//! observed wire message, and keeps an in-memory per-peer aggregate with a
//! bounded ring of recent messages.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tracer::{Direction, EventSource, TraceEvent};

use super::error::CollectError;
use super::{Collector, CollectorSpec, Observation};

const FIELDS: &[&str] = &[
    "peer_id",
    "peer_conn_type",
    "peer_addr",
    "flow",
    "msg_type",
    "size",
];

pub const DEFAULT_FREQUENCY_SECS: u64 = 5;

/// How long to block waiting for the first event of a cycle.
const RECV_WAIT: Duration = Duration::from_millis(50);

/// Per-peer ring depth for recently seen messages.
const RECENT_MESSAGES: usize = 25;

/// Running aggregate for one peer.
#[derive(Debug, Default)]
pub struct PeerRecord {
    pub addr: String,
    pub conn_type: String,
    pub inbound_msgs: u64,
    pub outbound_msgs: u64,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    recent: VecDeque<TraceEvent>,
}

impl PeerRecord {
    fn record(&mut self, event: &TraceEvent) {
        self.addr = event.peer_addr.clone();
        self.conn_type = event.peer_conn_type.clone();
        match event.direction {
            Direction::Inbound => {
                self.inbound_msgs += 1;
                self.inbound_bytes += event.msg_size;
            }
            Direction::Outbound => {
                self.outbound_msgs += 1;
                self.outbound_bytes += event.msg_size;
            }
        }
        if self.recent.len() == RECENT_MESSAGES {
            self.recent.pop_front();
        }
        self.recent.push_back(event.clone());
    }

    /// Recently seen messages, oldest first, at most [`RECENT_MESSAGES`].
    pub fn recent(&self) -> impl Iterator<Item = &TraceEvent> {
        self.recent.iter()
    }
}

pub struct TrafficCollector<S: EventSource> {
    spec: CollectorSpec,
    source: S,
    cancel: CancellationToken,
    events: Option<mpsc::Receiver<TraceEvent>>,
    peers: HashMap<u64, PeerRecord>,
}

impl<S: EventSource> TrafficCollector<S> {
    pub fn new(
        source: S,
        frequency_secs: u64,
        cancel: CancellationToken,
    ) -> Result<Self, CollectError> {
        Ok(Self {
            spec: CollectorSpec::new("net", frequency_secs, FIELDS)?,
            source,
            cancel,
            events: None,
            peers: HashMap::new(),
        })
    }

    /// Per-peer aggregates built up since startup. Peers are never evicted.
    pub fn peers(&self) -> &HashMap<u64, PeerRecord> {
        &self.peers
    }

    fn record(&mut self, event: TraceEvent) {
        self.peers.entry(event.peer_id).or_default().record(&event);
    }
}

impl<S: EventSource> Collector for TrafficCollector<S> {
    type Raw = Vec<TraceEvent>;

    fn spec(&self) -> &CollectorSpec {
        &self.spec
    }

    async fn acquire(&mut self) -> Result<Self::Raw, CollectError> {
        if self.events.is_none() {
            let rx = self
                .source
                .start(self.cancel.clone())
                .await
                .map_err(|err| {
                    CollectError::Configuration(format!("starting message tracer: {err:#}"))
                })?;
            info!("message tracer attached");
            self.events = Some(rx);
        }
        let rx = self.events.as_mut().expect("receiver just installed");

        let mut batch = Vec::new();
        // Block briefly for the first event, then drain whatever is queued.
        match timeout(RECV_WAIT, rx.recv()).await {
            Ok(Some(event)) => batch.push(event),
            Ok(None) => {
                return Err(CollectError::Transient(
                    "tracer event channel closed".to_string(),
                ))
            }
            Err(_) => {}
        }
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }

        debug!(events = batch.len(), peers = self.peers.len(), "drained trace events");
        for event in &batch {
            self.record(event.clone());
        }
        Ok(batch)
    }

    fn format(&self, timestamp: &str, raw: Self::Raw) -> Vec<Observation> {
        raw.into_iter()
            .map(|event| {
                let mut obs = Observation::new(timestamp);
                obs.set("peer_id", event.peer_id);
                obs.set("peer_conn_type", event.peer_conn_type);
                obs.set("peer_addr", event.peer_addr);
                obs.set("flow", event.direction.as_str());
                obs.set("msg_type", event.msg_type);
                obs.set("size", event.msg_size);
                obs
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct ChannelSource {
        rx: Option<mpsc::Receiver<TraceEvent>>,
    }

    impl EventSource for ChannelSource {
        async fn start(
            &mut self,
            _cancel: CancellationToken,
        ) -> anyhow::Result<mpsc::Receiver<TraceEvent>> {
            self.rx.take().ok_or_else(|| anyhow::anyhow!("already started"))
        }
    }

    struct FailingSource;

    impl EventSource for FailingSource {
        async fn start(
            &mut self,
            _cancel: CancellationToken,
        ) -> anyhow::Result<mpsc::Receiver<TraceEvent>> {
            anyhow::bail!("no probe points in target binary")
        }
    }

    fn event(peer_id: u64, direction: Direction, msg_type: &str, size: u64) -> TraceEvent {
        TraceEvent {
            peer_id,
            peer_addr: format!("198.51.100.{peer_id}:8333"),
            peer_conn_type: "outbound-full-relay".to_string(),
            msg_type: msg_type.to_string(),
            msg_size: size,
            direction,
        }
    }

    fn collector_with_events(
        events: Vec<TraceEvent>,
    ) -> (TrafficCollector<ChannelSource>, mpsc::Sender<TraceEvent>) {
        let (tx, rx) = mpsc::channel(256);
        for ev in events {
            tx.try_send(ev).expect("channel capacity");
        }
        let collector =
            TrafficCollector::new(ChannelSource { rx: Some(rx) }, 5, CancellationToken::new())
                .expect("valid collector");
        (collector, tx)
    }

    #[tokio::test]
    async fn test_aggregates_counts_and_bytes_per_peer() {
        let n_in = 7u64;
        let m_out = 4u64;
        let mut events = Vec::new();
        for _ in 0..n_in {
            events.push(event(3, Direction::Inbound, "inv", 100));
        }
        for _ in 0..m_out {
            events.push(event(3, Direction::Outbound, "getdata", 40));
        }
        events.push(event(9, Direction::Inbound, "ping", 8));

        let (mut collector, _tx) = collector_with_events(events);
        let batch = collector.acquire().await.expect("acquire");
        assert_eq!(batch.len() as u64, n_in + m_out + 1);

        let peer = &collector.peers()[&3];
        assert_eq!(peer.inbound_msgs, n_in);
        assert_eq!(peer.outbound_msgs, m_out);
        assert_eq!(peer.inbound_bytes, n_in * 100);
        assert_eq!(peer.outbound_bytes, m_out * 40);
        assert_eq!(peer.recent().count() as u64, n_in + m_out);

        let other = &collector.peers()[&9];
        assert_eq!(other.inbound_msgs, 1);
        assert_eq!(other.inbound_bytes, 8);
    }

    #[tokio::test]
    async fn test_recent_ring_is_bounded_and_ordered() {
        let total = RECENT_MESSAGES + 10;
        let events: Vec<_> = (0..total)
            .map(|i| event(1, Direction::Inbound, "tx", i as u64))
            .collect();

        let (mut collector, _tx) = collector_with_events(events);
        collector.acquire().await.expect("acquire");

        let peer = &collector.peers()[&1];
        let sizes: Vec<u64> = peer.recent().map(|e| e.msg_size).collect();
        assert_eq!(sizes.len(), RECENT_MESSAGES);
        // Oldest entries were dropped; the survivors keep arrival order.
        let expected: Vec<u64> = (10..total as u64).collect();
        assert_eq!(sizes, expected);
        // Counters are not affected by ring eviction.
        assert_eq!(peer.inbound_msgs, total as u64);
    }

    #[tokio::test]
    async fn test_format_one_row_per_message() {
        let (mut collector, _tx) = collector_with_events(vec![
            event(2, Direction::Inbound, "headers", 2000),
            event(2, Direction::Outbound, "getheaders", 700),
        ]);
        let batch = collector.acquire().await.expect("acquire");
        let rows = collector.format("2024-01-01T00:00:00Z", batch);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("flow"), Some(&json!("in")));
        assert_eq!(rows[0].get("msg_type"), Some(&json!("headers")));
        assert_eq!(rows[0].get("size"), Some(&json!(2000)));
        assert_eq!(rows[1].get("flow"), Some(&json!("out")));
        assert_eq!(rows[1].get("peer_id"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_empty_cycle_yields_no_rows() {
        let (tx, rx) = mpsc::channel(1);
        let mut collector =
            TrafficCollector::new(ChannelSource { rx: Some(rx) }, 5, CancellationToken::new())
                .expect("valid collector");

        let batch = collector.acquire().await.expect("acquire");
        assert!(batch.is_empty());
        assert!(collector.peers().is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_channel_is_transient() {
        let (tx, rx) = mpsc::channel::<TraceEvent>(1);
        drop(tx);
        let mut collector =
            TrafficCollector::new(ChannelSource { rx: Some(rx) }, 5, CancellationToken::new())
                .expect("valid collector");

        let err = collector.acquire().await.unwrap_err();
        assert!(matches!(err, CollectError::Transient(_)));
    }

    #[tokio::test]
    async fn test_source_start_failure_is_configuration() {
        let mut collector =
            TrafficCollector::new(FailingSource, 5, CancellationToken::new())
                .expect("valid collector");

        let err = collector.acquire().await.unwrap_err();
        assert!(matches!(err, CollectError::Configuration(_)));
        assert!(!err.is_restartable());
    }
}
