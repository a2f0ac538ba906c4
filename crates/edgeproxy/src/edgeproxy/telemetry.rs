use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::edgeproxy::server::auth::Subject;
use crate::edgeproxy::tunnel::muxer::MuxerType;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn record_forward_accepted() {
    metrics::counter!("edgeproxy_router_forward_accepted_connections_total").increment(1);
}

/// `written` went to the local side of a relay, `read` came from it.
pub fn record_relay_bytes(written: u64, read: u64) {
    metrics::counter!("edgeproxy_router_written_bytes_total").increment(written);
    metrics::counter!("edgeproxy_router_read_bytes_total").increment(read);
}

pub fn record_tunnel_connection(muxer: MuxerType) {
    metrics::counter!("edgeproxy_tunnel_connections_accepted_total", "muxer" => muxer.as_str())
        .increment(1);
}

/// Counts a client front-end connection for as long as it lives.
#[derive(Debug)]
pub struct ActiveConnGuard;

impl ActiveConnGuard {
    pub fn new() -> Self {
        metrics::gauge!("edgeproxy_client_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("edgeproxy_client_active_connections").decrement(1.0);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub subject: Subject,
    pub peer: String,
    pub muxer: &'static str,
    pub started_at_unix_ms: u64,
}

/// Tunnel connections currently attached to the server.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelInfo>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `info` until the returned guard is dropped.
    pub fn track(self: Arc<Self>, info: TunnelInfo) -> TunnelGuard {
        let id = info.id.clone();
        self.tunnels.insert(id.clone(), info);
        TunnelGuard { registry: self, id }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut out: Vec<TunnelInfo> = self.tunnels.iter().map(|t| t.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub struct TunnelGuard {
    registry: SharedTunnels,
    id: String,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.registry.tunnels.remove(&self.id);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_tunnel_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("t{n}")
}

pub type SharedTunnels = Arc<TunnelRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, started: u64) -> TunnelInfo {
        TunnelInfo {
            id: id.into(),
            subject: Subject::anonymous(),
            peer: "127.0.0.1:1".into(),
            muxer: MuxerType::YamuxMuxer.as_str(),
            started_at_unix_ms: started,
        }
    }

    #[test]
    fn registry_tracks_until_guard_drops() {
        let reg = Arc::new(TunnelRegistry::new());
        let g2 = reg.clone().track(info("t2", 20));
        let g1 = reg.clone().track(info("t1", 10));
        let ids: Vec<_> = reg.snapshot().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t1", "t2"]);

        drop(g1);
        assert_eq!(reg.len(), 1);
        drop(g2);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn tunnel_ids_are_unique() {
        assert_ne!(new_tunnel_id(), new_tunnel_id());
    }
}
