use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Default cutoff above which a flow is considered bidirectional
pub const DEFAULT_MIXED_RATIO: f64 = 0.7;

/// Dominant direction of a flow's current traffic
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Up,
    Down,
    #[default]
    Mixed,
}

impl FlowDirection {
    /// Classify from the current up/down rates.
    ///
    /// `ratio = min / max`, zero when either side is zero. Above `mixed_ratio`
    /// the flow is mixed, otherwise the larger side wins. A flow with no
    /// current traffic in either direction has no dominant side and is mixed.
    pub fn classify(up: f64, down: f64, mixed_ratio: f64) -> Self {
        let max = up.max(down);
        if max <= 0.0 {
            return FlowDirection::Mixed;
        }

        let ratio = up.min(down) / max;
        if ratio > mixed_ratio {
            FlowDirection::Mixed
        } else if up > down {
            FlowDirection::Up
        } else {
            FlowDirection::Down
        }
    }
}

/// Point-in-time view of one direction's throughput
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    /// Lifetime bytes
    pub total_bytes: u64,
    /// Moving-average rate in bytes per second
    pub avg_per_sec: f64,
}

/// Point-in-time view of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub up: ThroughputSnapshot,
    pub down: ThroughputSnapshot,
    pub direction: FlowDirection,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FlowSnapshot {
    /// Combined current rate of both directions
    pub fn throughput(&self) -> f64 {
        self.up.avg_per_sec + self.down.avg_per_sec
    }
}

/// Totals across the whole capture session
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    /// Bytes sent to every remote seen this session, including ended flows
    pub up_total: u64,
    /// Bytes received from every remote seen this session, including ended flows
    pub down_total: u64,
    /// Sum of the active flows' outgoing rates
    pub up_per_sec: f64,
    /// Sum of the active flows' incoming rates
    pub down_per_sec: f64,
}

/// One tick's report of flow starts, ends, and snapshots
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureDelta {
    /// Remotes first reported in this delta
    pub started: Vec<IpAddr>,
    /// Remotes that timed out, were evicted, or were closed by a stop
    pub ended: Vec<IpAddr>,
    /// Snapshot of every active flow
    pub updated: HashMap<IpAddr, FlowSnapshot>,
    /// Largest combined rate among active flows
    pub max_throughput: f64,
    /// Session-wide totals
    pub session: SessionTotals,
    /// Last delta of the session; the flow table is empty afterwards
    pub is_final: bool,
}

impl CaptureDelta {
    /// A delta with nothing to report
    pub fn is_quiet(&self) -> bool {
        self.started.is_empty() && self.ended.is_empty() && self.updated.is_empty()
    }

    /// Fold an unconsumed older delta into this newer one.
    ///
    /// Snapshots, throughput and the final marker come from `self`. Start/end
    /// events are unioned, except that pairs the consumer never saw cancel out:
    /// a remote started in `older` and ended in `self` disappears from both
    /// lists, as does one ended in `older` and started again in `self`.
    pub fn coalesce(mut self, older: CaptureDelta) -> CaptureDelta {
        let newly_ended: HashSet<IpAddr> = self.ended.iter().copied().collect();
        let newly_started: HashSet<IpAddr> = self.started.iter().copied().collect();

        let mut cancelled = HashSet::new();
        let mut started = Vec::with_capacity(older.started.len() + self.started.len());
        let mut ended = Vec::with_capacity(older.ended.len() + self.ended.len());

        for ip in older.started {
            if newly_ended.contains(&ip) {
                cancelled.insert(ip);
            } else {
                started.push(ip);
            }
        }

        for ip in older.ended {
            if newly_started.contains(&ip) {
                cancelled.insert(ip);
            } else {
                ended.push(ip);
            }
        }

        started.extend(self.started.into_iter().filter(|ip| !cancelled.contains(ip)));
        ended.extend(self.ended.into_iter().filter(|ip| !cancelled.contains(ip)));

        self.started = started;
        self.ended = ended;
        self
    }
}
