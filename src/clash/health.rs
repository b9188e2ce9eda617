//! TCP reachability checker for parsed proxy nodes.
//!
//! Every node gets its own tokio task that opens a plain TCP connection to
//! `server:port` under a fixed timeout. All tasks are joined before results
//! are returned, and results stay aligned with the input order regardless of
//! which probe finished first. Network failures are reported as data in
//! [`NodeStatus`], never as errors.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::TcpStream;

use super::node::ProxyNode;

/// Connect timeout per node.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Latency value reported for nodes that are not online.
pub const NO_LATENCY: i64 = -1;

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    /// TCP handshake completed.
    Online,
    /// Connection refused, unreachable, DNS failure and friends.
    Offline,
    /// No answer before the probe timeout.
    Timeout,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Probe result for one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: ProxyNode,
    pub state: ProbeState,
    /// Milliseconds until the TCP handshake completed, `-1` unless online.
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeStatus {
    fn online(node: ProxyNode, latency: Duration) -> Self {
        Self {
            node,
            state: ProbeState::Online,
            latency_ms: i64::try_from(latency.as_millis()).unwrap_or(i64::MAX),
            error: None,
        }
    }

    fn offline(node: ProxyNode, error: impl Into<String>) -> Self {
        Self {
            node,
            state: ProbeState::Offline,
            latency_ms: NO_LATENCY,
            error: Some(error.into()),
        }
    }

    fn timed_out(node: ProxyNode, error: impl Into<String>) -> Self {
        Self {
            node,
            state: ProbeState::Timeout,
            latency_ms: NO_LATENCY,
            error: Some(error.into()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == ProbeState::Online
    }
}

/// Counts by probe state. `online + offline + timeout == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub timeout: usize,
}

/// Connectivity checker for proxy nodes.
pub struct HealthChecker;

impl HealthChecker {
    /// Probe a single node.
    pub async fn check_node(node: ProxyNode, timeout: Duration) -> NodeStatus {
        let start = Instant::now();
        let outcome =
            tokio::time::timeout(timeout, TcpStream::connect((node.server.as_str(), node.port)))
                .await
                .ok()
                .map(|connected| connected.map(drop));
        classify(node, outcome, start.elapsed(), timeout)
    }

    /// Check all nodes in parallel with the default [`PROBE_TIMEOUT`].
    pub async fn check_all(nodes: &[ProxyNode]) -> Vec<NodeStatus> {
        Self::check_all_with_timeout(nodes, PROBE_TIMEOUT).await
    }

    /// Check all nodes in parallel, one task per node.
    ///
    /// Waits for every task. A task that panics is reported as offline for
    /// its own node; the remaining tasks are still joined.
    pub async fn check_all_with_timeout(nodes: &[ProxyNode], timeout: Duration) -> Vec<NodeStatus> {
        let handles: Vec<_> = nodes
            .iter()
            .cloned()
            .map(|node| tokio::spawn(Self::check_node(node, timeout)))
            .collect();

        let joined = futures_util::future::join_all(handles).await;

        let statuses: Vec<NodeStatus> = joined
            .into_iter()
            .zip(nodes)
            .map(|(result, node)| match result {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("probe task for {} failed: {e}", node.address());
                    NodeStatus::offline(node.clone(), format!("probe task failed: {e}"))
                }
            })
            .collect();

        let summary = summarize(&statuses);
        tracing::info!(
            "probed {} node(s): {} online, {} offline, {} timeout",
            summary.total,
            summary.online,
            summary.offline,
            summary.timeout
        );
        statuses
    }
}

/// Map a dial outcome to a status. `None` means the timer expired before
/// the connect finished.
fn classify(
    node: ProxyNode,
    outcome: Option<io::Result<()>>,
    elapsed: Duration,
    timeout: Duration,
) -> NodeStatus {
    match outcome {
        Some(Ok(())) => NodeStatus::online(node, elapsed),
        Some(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
            let detail = format!("dial {}: {e}", node.address());
            NodeStatus::timed_out(node, detail)
        }
        Some(Err(e)) => {
            let detail = format!("dial {}: {e}", node.address());
            NodeStatus::offline(node, detail)
        }
        None => {
            let detail = format!(
                "dial {}: connection timed out after {}s",
                node.address(),
                timeout.as_secs_f32()
            );
            NodeStatus::timed_out(node, detail)
        }
    }
}

/// Count statuses by state.
pub fn summarize(statuses: &[NodeStatus]) -> ProbeSummary {
    statuses.iter().fold(
        ProbeSummary {
            total: statuses.len(),
            ..ProbeSummary::default()
        },
        |mut acc, status| {
            match status.state {
                ProbeState::Online => acc.online += 1,
                ProbeState::Offline => acc.offline += 1,
                ProbeState::Timeout => acc.timeout += 1,
            }
            acc
        },
    )
}

/// Nodes whose probe succeeded, in input order.
pub fn online_only(statuses: &[NodeStatus]) -> Vec<ProxyNode> {
    statuses
        .iter()
        .filter(|s| s.is_online())
        .map(|s| s.node.clone())
        .collect()
}
