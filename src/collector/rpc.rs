//! Collectors backed by Bitcoin Core JSON-RPC calls.
//!
//! One generic collector, one closed enum of supported calls. Each call
//! carries its method name, default cadence, argument list, output schema,
//! and result projection.

use serde_json::Value;

use crate::rpc::RpcTransport;

use super::error::CollectError;
use super::{Collector, CollectorSpec, Observation};

/// The set of Bitcoin Core RPCs this monitor knows how to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCall {
    GetConnectionCount,
    GetPeerInfo,
    GetNodeAddresses,
    GetTxoutSetInfo,
    GetRawAddrman,
}

impl RpcCall {
    /// The RPC method name; doubles as the collector/output-stream name.
    pub const fn method(self) -> &'static str {
        match self {
            Self::GetConnectionCount => "getconnectioncount",
            Self::GetPeerInfo => "getpeerinfo",
            Self::GetNodeAddresses => "getnodeaddresses",
            Self::GetTxoutSetInfo => "gettxoutsetinfo",
            Self::GetRawAddrman => "getrawaddrman",
        }
    }

    /// Default cadence in seconds.
    pub const fn default_frequency_secs(self) -> u64 {
        match self {
            Self::GetConnectionCount | Self::GetPeerInfo => 60,
            Self::GetNodeAddresses => 60 * 10,
            // gettxoutsetinfo takes minutes to execute on the node,
            // and the addrman dump is a high-volume snapshot.
            Self::GetTxoutSetInfo | Self::GetRawAddrman => 24 * 60 * 60,
        }
    }

    /// Ordered argument list sent with the call.
    pub fn params(self) -> Vec<Value> {
        match self {
            Self::GetNodeAddresses => vec![Value::from(0)],
            Self::GetRawAddrman => vec![Value::from(true)],
            _ => Vec::new(),
        }
    }

    /// Declared output schema, not counting `timestamp`.
    pub const fn fields(self) -> &'static [&'static str] {
        match self {
            Self::GetConnectionCount => &["connectioncount"],
            Self::GetPeerInfo => &[
                "addr",
                "network",
                "services",
                "relaytxes",
                "minping",
                "version",
                "subver",
                "inbound",
                "addr_relay_enabled",
                "addr_processed",
                "minfeefilter",
                "connection_type",
            ],
            Self::GetNodeAddresses => &["ipv4", "ipv6", "onion", "i2p", "cjdns"],
            Self::GetTxoutSetInfo => &[
                "height",
                "bestblock",
                "txouts",
                "bogosize",
                "hash_serialized_2",
                "total_amount",
                "transactions",
                "disk_size",
            ],
            Self::GetRawAddrman => &[
                "cache_id",
                "time",
                "services",
                "address",
                "port",
                "network",
            ],
        }
    }

    /// Whether this call's output goes to a time-bucketed archive instead
    /// of a simple append file.
    pub const fn archive(self) -> bool {
        matches!(self, Self::GetRawAddrman)
    }

    /// All supported calls.
    pub const fn all() -> &'static [Self] {
        &[
            Self::GetConnectionCount,
            Self::GetPeerInfo,
            Self::GetNodeAddresses,
            Self::GetTxoutSetInfo,
            Self::GetRawAddrman,
        ]
    }

    /// Look up a call by its method name (used for config overrides).
    pub fn from_method(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.method() == name)
    }

    /// Project the raw RPC result onto the schema. Missing optional keys
    /// are dropped for the affected row; a result of unexpected shape
    /// yields no rows at all.
    fn format(self, timestamp: &str, result: &Value) -> Vec<Observation> {
        match self {
            Self::GetConnectionCount => {
                let mut obs = Observation::new(timestamp);
                obs.set("connectioncount", result.clone());
                vec![obs]
            }

            Self::GetPeerInfo => {
                let Some(peers) = result.as_array() else {
                    return Vec::new();
                };
                peers
                    .iter()
                    .map(|peer| {
                        let mut obs = Observation::new(timestamp);
                        for &field in self.fields() {
                            if let Some(value) = peer.get(field) {
                                obs.set(field, value.clone());
                            }
                        }
                        obs
                    })
                    .collect()
            }

            Self::GetNodeAddresses => {
                let Some(addrs) = result.as_array() else {
                    return Vec::new();
                };
                let mut obs = Observation::new(timestamp);
                for &net in self.fields() {
                    let count = addrs
                        .iter()
                        .filter(|a| a.get("network").and_then(Value::as_str) == Some(net))
                        .count();
                    obs.set(net, count);
                }
                vec![obs]
            }

            Self::GetTxoutSetInfo => {
                let mut obs = Observation::new(timestamp);
                for &field in self.fields() {
                    if let Some(value) = result.get(field) {
                        obs.set(field, value.clone());
                    }
                }
                vec![obs]
            }

            Self::GetRawAddrman => {
                let Some(caches) = result.get("cache").and_then(Value::as_object) else {
                    return Vec::new();
                };
                let mut rows = Vec::new();
                for (cache_id, addrs) in caches {
                    let Some(addrs) = addrs.as_array() else {
                        continue;
                    };
                    for addr in addrs {
                        let mut obs = Observation::new(timestamp);
                        obs.set("cache_id", cache_id.as_str());
                        for &field in self.fields() {
                            if field == "cache_id" {
                                continue;
                            }
                            if let Some(value) = addr.get(field) {
                                obs.set(field, value.clone());
                            }
                        }
                        rows.push(obs);
                    }
                }
                rows
            }
        }
    }
}

/// Generic RPC collector: one instance per enabled [`RpcCall`].
pub struct RpcCollector<T: RpcTransport> {
    spec: CollectorSpec,
    call: RpcCall,
    params: Vec<Value>,
    transport: T,
}

impl<T: RpcTransport> RpcCollector<T> {
    pub fn new(
        call: RpcCall,
        transport: T,
        frequency_override: Option<u64>,
    ) -> Result<Self, CollectError> {
        let frequency = frequency_override.unwrap_or(call.default_frequency_secs());
        let spec = CollectorSpec::new(call.method(), frequency, call.fields())?;

        Ok(Self {
            spec,
            call,
            params: call.params(),
            transport,
        })
    }
}

impl<T: RpcTransport> Collector for RpcCollector<T> {
    type Raw = Value;

    fn spec(&self) -> &CollectorSpec {
        &self.spec
    }

    async fn acquire(&mut self) -> Result<Value, CollectError> {
        self.transport.call(self.call.method(), &self.params).await
    }

    fn format(&self, timestamp: &str, raw: Value) -> Vec<Observation> {
        self.call.format(timestamp, &raw)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TS: &str = "2024-01-01T00:00:00Z";

    #[test]
    fn test_default_frequencies() {
        assert_eq!(RpcCall::GetConnectionCount.default_frequency_secs(), 60);
        assert_eq!(RpcCall::GetPeerInfo.default_frequency_secs(), 60);
        assert_eq!(RpcCall::GetNodeAddresses.default_frequency_secs(), 600);
        assert_eq!(RpcCall::GetTxoutSetInfo.default_frequency_secs(), 86_400);
        assert_eq!(RpcCall::GetRawAddrman.default_frequency_secs(), 86_400);
    }

    #[test]
    fn test_from_method_round_trip() {
        for call in RpcCall::all() {
            assert_eq!(RpcCall::from_method(call.method()), Some(*call));
        }
        assert_eq!(RpcCall::from_method("getblockcount"), None);
    }

    #[test]
    fn test_only_addrman_archives() {
        for call in RpcCall::all() {
            assert_eq!(call.archive(), *call == RpcCall::GetRawAddrman);
        }
    }

    #[test]
    fn test_format_connection_count_scalar() {
        let rows = RpcCall::GetConnectionCount.format(TS, &json!(7));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, TS);
        assert_eq!(rows[0].get("connectioncount"), Some(&json!(7)));
    }

    #[test]
    fn test_format_peer_info_row_per_peer() {
        let result = json!([
            {
                "addr": "203.0.113.5:8333",
                "network": "ipv4",
                "inbound": false,
                "connection_type": "outbound-full-relay",
                "version": 70016,
            },
            {
                "addr": "x7...acd.onion:8333",
                "network": "onion",
                "inbound": true,
            },
        ]);

        let rows = RpcCall::GetPeerInfo.format(TS, &result);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("addr"), Some(&json!("203.0.113.5:8333")));
        assert_eq!(rows[0].get("version"), Some(&json!(70016)));
        // Keys absent in the source are dropped, not null-padded.
        assert_eq!(rows[1].get("version"), None);
        assert_eq!(rows[1].get("inbound"), Some(&json!(true)));
    }

    #[test]
    fn test_format_node_addresses_counts_per_network() {
        let result = json!([
            {"network": "ipv4", "address": "203.0.113.5", "port": 8333},
            {"network": "ipv4", "address": "198.51.100.1", "port": 8333},
            {"network": "onion", "address": "x7...acd.onion", "port": 8333},
        ]);

        let rows = RpcCall::GetNodeAddresses.format(TS, &result);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("ipv4"), Some(&json!(2)));
        assert_eq!(rows[0].get("onion"), Some(&json!(1)));
        assert_eq!(rows[0].get("i2p"), Some(&json!(0)));
    }

    #[test]
    fn test_format_txoutsetinfo_single_row() {
        let result = json!({
            "height": 820_000,
            "bestblock": "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
            "txouts": 83_000_000,
            "total_amount": 19_500_000.0,
            "unexpected_key": "ignored",
        });

        let rows = RpcCall::GetTxoutSetInfo.format(TS, &result);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("height"), Some(&json!(820_000)));
        assert_eq!(rows[0].get("unexpected_key"), None);
        // Not in this result: dropped, not nulled.
        assert_eq!(rows[0].get("disk_size"), None);
    }

    #[test]
    fn test_format_rawaddrman_flattens_caches() {
        let result = json!({
            "cache": {
                "new": [
                    {"time": 1_700_000_000, "address": "203.0.113.5", "port": 8333, "network": "ipv4", "services": 1033},
                    {"time": 1_700_000_100, "address": "198.51.100.1", "port": 8333, "network": "ipv4", "services": 1033},
                ],
                "tried": [
                    {"time": 1_700_000_200, "address": "x7...acd.onion", "port": 8333, "network": "onion", "services": 1032},
                ],
            },
        });

        let rows = RpcCall::GetRawAddrman.format(TS, &result);
        assert_eq!(rows.len(), 3);

        let new_rows: Vec<_> = rows
            .iter()
            .filter(|r| r.get("cache_id") == Some(&json!("new")))
            .collect();
        assert_eq!(new_rows.len(), 2);

        let tried = rows
            .iter()
            .find(|r| r.get("cache_id") == Some(&json!("tried")))
            .expect("tried row");
        assert_eq!(tried.get("address"), Some(&json!("x7...acd.onion")));
        assert_eq!(tried.get("network"), Some(&json!("onion")));
    }

    #[test]
    fn test_format_tolerates_unexpected_shape() {
        assert!(RpcCall::GetPeerInfo.format(TS, &json!(42)).is_empty());
        assert!(RpcCall::GetNodeAddresses.format(TS, &json!("nope")).is_empty());
        assert!(RpcCall::GetRawAddrman.format(TS, &json!([])).is_empty());
    }

    #[test]
    fn test_collector_spec_uses_override() {
        struct NoopTransport;
        impl RpcTransport for NoopTransport {
            async fn call(&self, _m: &str, _p: &[Value]) -> Result<Value, CollectError> {
                Ok(Value::Null)
            }
        }

        let collector = RpcCollector::new(RpcCall::GetPeerInfo, NoopTransport, Some(5))
            .expect("valid collector");
        assert_eq!(collector.spec().frequency_secs, 5);
        assert_eq!(collector.spec().name, "getpeerinfo");

        let collector = RpcCollector::new(RpcCall::GetPeerInfo, NoopTransport, None)
            .expect("valid collector");
        assert_eq!(collector.spec().frequency_secs, 60);
    }
}
