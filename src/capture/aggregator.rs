use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::capture::classifier::PacketDirection;
use crate::models::config::CaptureConfig;
use crate::models::delta::{
    CaptureDelta, FlowDirection, FlowSnapshot, SessionTotals, ThroughputSnapshot,
};

/// Rates below this are reported as zero
const RATE_FLOOR: f64 = 1e-3;

/// Parameters of the flow table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorSettings {
    /// Idle time after which a flow is ended
    pub timeout: Duration,
    /// Time constant of the moving average
    pub rate_window: Duration,
    /// Flow table ceiling
    pub max_flows: usize,
    /// Direction classification threshold
    pub mixed_ratio: f64,
}

impl From<&CaptureConfig> for AggregatorSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            timeout: config.connection_timeout,
            rate_window: config.rate_window,
            max_flows: config.max_flows,
            mixed_ratio: config.mixed_ratio,
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

/// Exponentially-decaying byte rate for one direction of a flow.
///
/// Each packet adds `bytes / window` to the rate, and the rate decays by
/// `exp(-dt / window)` between updates. For a steady stream of `N` bytes/s the
/// estimate settles at `N`; with no traffic it relaxes toward zero.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    total_bytes: u64,
    rate: f64,
    updated_at: Instant,
}

impl ThroughputTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            total_bytes: 0,
            rate: 0.0,
            updated_at: now,
        }
    }

    /// Account for `bytes` observed at `now`
    pub fn add(&mut self, bytes: usize, now: Instant, window: f64) {
        self.decay_to(now, window);
        self.total_bytes = self.total_bytes.saturating_add(bytes as u64);
        self.rate += bytes as f64 / window;
    }

    /// Bring the rate forward to `now` without new traffic
    pub fn decay_to(&mut self, now: Instant, window: f64) {
        // Instants earlier than the last update leave the tracker untouched
        let Some(elapsed) = now.checked_duration_since(self.updated_at) else {
            return;
        };

        self.rate *= (-elapsed.as_secs_f64() / window).exp();
        if self.rate < RATE_FLOOR {
            self.rate = 0.0;
        }
        self.updated_at = now;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn avg_per_sec(&self) -> f64 {
        self.rate
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            total_bytes: self.total_bytes,
            avg_per_sec: self.rate,
        }
    }
}

/// Traffic record for one remote address
#[derive(Debug, Clone)]
struct Flow {
    up: ThroughputTracker,
    down: ThroughputTracker,
    first_seen: Instant,
    last_seen: Instant,
    /// Whether `started` has been emitted for this flow
    reported: bool,
}

impl Flow {
    fn new(now: Instant, reported: bool) -> Self {
        Self {
            up: ThroughputTracker::new(now),
            down: ThroughputTracker::new(now),
            first_seen: now,
            last_seen: now,
            reported,
        }
    }

    fn throughput(&self) -> f64 {
        self.up.avg_per_sec() + self.down.avg_per_sec()
    }
}

/// Maps monotonic instants onto wall-clock time for snapshots
#[derive(Debug, Clone, Copy)]
struct WallClock {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl WallClock {
    fn at(&self, instant: Instant) -> DateTime<Utc> {
        let delta = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());

        match instant.checked_duration_since(self.instant) {
            Some(after) => self.wall + delta(after),
            None => self.wall - delta(self.instant - instant),
        }
    }
}

/// Live table of flows keyed by remote address.
///
/// Single-writer: owned by the capture worker, which calls [`record`] per
/// packet and [`tick`] once per reporting period.
///
/// [`record`]: FlowAggregator::record
/// [`tick`]: FlowAggregator::tick
#[derive(Debug)]
pub struct FlowAggregator {
    settings: AggregatorSettings,
    window: f64,
    flows: HashMap<IpAddr, Flow>,
    /// Reported flows evicted since the last tick, kept so a quick return
    /// resumes with its lifetime counters
    evicted: HashMap<IpAddr, Flow>,
    max_throughput: f64,
    up_total: u64,
    down_total: u64,
    clock: WallClock,
}

impl FlowAggregator {
    pub fn new(settings: AggregatorSettings, now: Instant) -> Self {
        Self {
            window: settings.rate_window.as_secs_f64().max(1e-3),
            settings: AggregatorSettings {
                max_flows: settings.max_flows.max(1),
                ..settings
            },
            flows: HashMap::new(),
            evicted: HashMap::new(),
            max_throughput: 0.0,
            up_total: 0,
            down_total: 0,
            clock: WallClock {
                instant: now,
                wall: Utc::now(),
            },
        }
    }

    /// Number of active flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Largest combined rate as of the last tick
    pub fn max_throughput(&self) -> f64 {
        self.max_throughput
    }

    /// Attribute one packet to its flow, creating the flow if needed
    pub fn record(&mut self, remote: IpAddr, direction: PacketDirection, bytes: usize, now: Instant) {
        match direction {
            PacketDirection::Up => self.up_total = self.up_total.saturating_add(bytes as u64),
            PacketDirection::Down => self.down_total = self.down_total.saturating_add(bytes as u64),
        }

        if !self.flows.contains_key(&remote) {
            if self.flows.len() >= self.settings.max_flows {
                self.evict_oldest();
            }

            // An evicted flow the consumer still shows resumes instead of restarting
            let flow = self.evicted.remove(&remote).unwrap_or_else(|| Flow::new(now, false));
            self.flows.insert(remote, flow);
        }

        if let Some(flow) = self.flows.get_mut(&remote) {
            match direction {
                PacketDirection::Up => flow.up.add(bytes, now, self.window),
                PacketDirection::Down => flow.down.add(bytes, now, self.window),
            }
            if now > flow.last_seen {
                flow.last_seen = now;
            }
        }
    }

    /// Decay every flow to `now`, end idle flows, and report the table
    pub fn tick(&mut self, now: Instant) -> CaptureDelta {
        let window = self.window;
        let timeout = self.settings.timeout;
        let mixed_ratio = self.settings.mixed_ratio;
        let clock = self.clock;

        let mut delta = CaptureDelta {
            ended: self.evicted.drain().map(|(ip, _)| ip).collect(),
            ..Default::default()
        };
        let mut session = SessionTotals {
            up_total: self.up_total,
            down_total: self.down_total,
            ..Default::default()
        };
        let mut max_throughput: f64 = 0.0;

        self.flows.retain(|ip, flow| {
            flow.up.decay_to(now, window);
            flow.down.decay_to(now, window);

            if now.saturating_duration_since(flow.last_seen) > timeout {
                // Never reported: the consumer doesn't know it exists
                if flow.reported {
                    delta.ended.push(*ip);
                }
                return false;
            }

            if !flow.reported {
                flow.reported = true;
                delta.started.push(*ip);
            }

            let up = flow.up.avg_per_sec();
            let down = flow.down.avg_per_sec();
            session.up_per_sec += up;
            session.down_per_sec += down;
            max_throughput = max_throughput.max(flow.throughput());

            delta.updated.insert(
                *ip,
                FlowSnapshot {
                    up: flow.up.snapshot(),
                    down: flow.down.snapshot(),
                    direction: FlowDirection::classify(up, down, mixed_ratio),
                    first_seen: clock.at(flow.first_seen),
                    last_seen: clock.at(flow.last_seen),
                },
            );

            true
        });

        delta.started.sort_unstable();
        delta.ended.sort_unstable();
        delta.max_throughput = max_throughput;
        delta.session = session;
        self.max_throughput = max_throughput;

        if !delta.started.is_empty() || !delta.ended.is_empty() {
            debug!(
                "tick: {} started, {} ended, {} active",
                delta.started.len(),
                delta.ended.len(),
                self.flows.len()
            );
        }

        delta
    }

    /// End every flow and clear the table.
    ///
    /// Only flows whose start was reported are listed as ended.
    pub fn stop(&mut self) -> CaptureDelta {
        let mut ended: Vec<IpAddr> = self.evicted.drain().map(|(ip, _)| ip).collect();
        ended.extend(
            self.flows
                .drain()
                .filter(|(_, flow)| flow.reported)
                .map(|(ip, _)| ip),
        );
        ended.sort_unstable();

        self.max_throughput = 0.0;

        CaptureDelta {
            ended,
            session: SessionTotals {
                up_total: self.up_total,
                down_total: self.down_total,
                ..Default::default()
            },
            is_final: true,
            ..Default::default()
        }
    }

    /// Drop the least recently seen flows to make room
    fn evict_oldest(&mut self) {
        let batch = (self.settings.max_flows / 16).max(1).min(self.flows.len());
        if batch == 0 {
            return;
        }

        let mut by_age: Vec<(Instant, IpAddr)> = self
            .flows
            .iter()
            .map(|(ip, flow)| (flow.last_seen, *ip))
            .collect();
        if batch < by_age.len() {
            by_age.select_nth_unstable(batch - 1);
        }

        for (_, ip) in by_age.into_iter().take(batch) {
            if let Some(flow) = self.flows.remove(&ip) {
                if flow.reported {
                    self.evicted.insert(ip, flow);
                }
            }
        }

        debug!("flow table full, evicted {} least recently seen flows", batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn aggregator(t0: Instant) -> FlowAggregator {
        FlowAggregator::new(
            AggregatorSettings {
                timeout: Duration::from_secs(5),
                rate_window: Duration::from_secs(1),
                max_flows: 1024,
                mixed_ratio: 0.7,
            },
            t0,
        )
    }

    #[test]
    fn empty_table_reports_nothing() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);

        for i in 1..=3 {
            let delta = agg.tick(t0 + ms(150 * i));
            assert!(delta.is_quiet());
            assert_eq!(delta.max_throughput, 0.0);
            assert!(!delta.is_final);
        }
    }

    #[test]
    fn first_packet_starts_flow() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let remote = ip("203.0.113.5");

        agg.record(remote, PacketDirection::Up, 1000, t0);
        let delta = agg.tick(t0 + ms(100));

        assert_eq!(delta.started, vec![remote]);
        assert!(delta.ended.is_empty());
        assert_eq!(delta.updated[&remote].up.total_bytes, 1000);
        assert_eq!(delta.updated[&remote].down.total_bytes, 0);
        assert_eq!(delta.updated[&remote].direction, FlowDirection::Up);
        assert!(delta.max_throughput > 0.0);
        assert_eq!(delta.session.up_total, 1000);
    }

    #[test]
    fn started_is_reported_once_until_ended() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let remote = ip("198.51.100.9");

        agg.record(remote, PacketDirection::Down, 60, t0);
        assert_eq!(agg.tick(t0 + ms(100)).started, vec![remote]);

        agg.record(remote, PacketDirection::Down, 60, t0 + ms(150));
        let delta = agg.tick(t0 + ms(200));
        assert!(delta.started.is_empty());
        assert!(delta.updated.contains_key(&remote));
    }

    #[test]
    fn idle_flow_ends_after_crossing_timeout() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let remote = ip("198.51.100.9");

        agg.record(remote, PacketDirection::Up, 500, t0);
        agg.tick(t0 + ms(100));

        let delta = agg.tick(t0 + Duration::from_secs(5));
        assert!(delta.ended.is_empty(), "exactly at the timeout is still active");
        assert!(delta.updated.contains_key(&remote));

        let delta = agg.tick(t0 + ms(5100));
        assert_eq!(delta.ended, vec![remote]);
        assert!(!delta.updated.contains_key(&remote));
        assert!(agg.is_empty());

        let delta = agg.tick(t0 + ms(5200));
        assert!(delta.is_quiet());

        agg.record(remote, PacketDirection::Up, 500, t0 + ms(6000));
        let delta = agg.tick(t0 + ms(6100));
        assert_eq!(delta.started, vec![remote]);
        assert_eq!(delta.updated[&remote].up.total_bytes, 500);
    }

    #[test]
    fn flow_born_and_expired_between_ticks_is_silent() {
        let t0 = Instant::now();
        let mut agg = FlowAggregator::new(
            AggregatorSettings {
                timeout: ms(50),
                ..AggregatorSettings::default()
            },
            t0,
        );

        agg.record(ip("198.51.100.1"), PacketDirection::Up, 100, t0);
        let delta = agg.tick(t0 + ms(200));

        assert!(delta.started.is_empty());
        assert!(delta.ended.is_empty());
        assert!(agg.is_empty());
    }

    #[test]
    fn never_started_and_ended_in_same_delta() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let a = ip("198.51.100.1");
        let b = ip("198.51.100.2");

        agg.record(a, PacketDirection::Up, 10, t0);
        agg.tick(t0 + ms(100));
        agg.record(b, PacketDirection::Up, 10, t0 + ms(5000));

        let delta = agg.tick(t0 + ms(5200));
        assert_eq!(delta.ended, vec![a]);
        assert_eq!(delta.started, vec![b]);
        for ip in &delta.started {
            assert!(!delta.ended.contains(ip));
        }
    }

    #[test]
    fn moving_average_converges_to_injection_rate() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let remote = ip("203.0.113.77");

        // 100 bytes every 100ms = 1000 B/s for 10 s, ticking between packets
        let mut last = None;
        for k in 0..100u64 {
            agg.record(remote, PacketDirection::Down, 100, t0 + ms(100 * k));
            last = Some(agg.tick(t0 + ms(100 * k + 50)));
        }

        let rate = last.unwrap().updated[&remote].down.avg_per_sec;
        assert!((rate - 1000.0).abs() < 10.0, "rate {rate} did not converge");
    }

    #[test]
    fn rate_relaxes_toward_zero_without_traffic() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let remote = ip("203.0.113.77");

        for k in 0..20u64 {
            agg.record(remote, PacketDirection::Up, 1000, t0 + ms(100 * k));
        }
        let busy = agg.tick(t0 + ms(2000)).updated[&remote].up.avg_per_sec;
        let quiet = agg.tick(t0 + ms(4000)).updated[&remote].up.avg_per_sec;

        assert!(quiet < busy / 5.0);
        assert_eq!(agg.tick(t0 + ms(4000)).max_throughput, quiet);
    }

    #[test]
    fn max_throughput_tracks_busiest_flow() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);

        agg.record(ip("198.51.100.1"), PacketDirection::Up, 100, t0);
        agg.record(ip("198.51.100.2"), PacketDirection::Up, 400, t0);
        agg.record(ip("198.51.100.2"), PacketDirection::Down, 400, t0);

        let delta = agg.tick(t0);
        let busiest = delta.updated[&ip("198.51.100.2")].throughput();
        assert_eq!(delta.max_throughput, busiest);
        assert_eq!(delta.updated[&ip("198.51.100.2")].direction, FlowDirection::Mixed);
        assert_eq!(delta.session.up_total, 500);
        assert_eq!(delta.session.down_total, 400);
    }

    #[test]
    fn stop_ends_every_reported_flow() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let a = ip("198.51.100.1");
        let b = ip("2001:db8::2");

        agg.record(a, PacketDirection::Up, 10, t0);
        agg.record(b, PacketDirection::Down, 10, t0);
        agg.tick(t0 + ms(100));

        let last = agg.stop();
        assert!(last.is_final);
        assert_eq!(last.ended.len(), 2);
        assert!(last.ended.contains(&a) && last.ended.contains(&b));
        assert!(last.updated.is_empty());
        assert!(agg.is_empty());
        assert_eq!(agg.max_throughput(), 0.0);
    }

    #[test]
    fn table_is_capped_by_evicting_least_recent() {
        let t0 = Instant::now();
        let mut agg = FlowAggregator::new(
            AggregatorSettings {
                max_flows: 4,
                ..AggregatorSettings::default()
            },
            t0,
        );

        for i in 1..=4u8 {
            agg.record(IpAddr::from([198, 51, 100, i]), PacketDirection::Up, 10, t0 + ms(i as u64));
        }
        agg.tick(t0 + ms(10));

        agg.record(ip("198.51.100.50"), PacketDirection::Up, 10, t0 + ms(20));
        assert_eq!(agg.len(), 4);

        let delta = agg.tick(t0 + ms(30));
        assert_eq!(delta.ended, vec![ip("198.51.100.1")]);
        assert_eq!(delta.started, vec![ip("198.51.100.50")]);
        assert!(!delta.updated.contains_key(&ip("198.51.100.1")));
    }

    #[test]
    fn evicted_flow_returning_before_tick_resumes() {
        let t0 = Instant::now();
        let mut agg = FlowAggregator::new(
            AggregatorSettings {
                max_flows: 1,
                ..AggregatorSettings::default()
            },
            t0,
        );
        let a = ip("198.51.100.1");
        let b = ip("198.51.100.2");

        agg.record(a, PacketDirection::Up, 5000, t0);
        let before = agg.tick(t0 + ms(10)).updated[&a].clone();

        agg.record(b, PacketDirection::Up, 10, t0 + ms(20));
        agg.record(a, PacketDirection::Up, 10, t0 + ms(30));

        let delta = agg.tick(t0 + ms(40));
        assert!(!delta.started.contains(&a));
        assert!(!delta.ended.contains(&a));

        // Lifetime counters carry over the eviction
        let after = &delta.updated[&a];
        assert_eq!(after.up.total_bytes, 5010);
        assert_eq!(after.first_seen, before.first_seen);
        assert!(after.up.avg_per_sec > 0.0);
    }

    #[test]
    fn snapshots_carry_wall_clock_times() {
        let t0 = Instant::now();
        let mut agg = aggregator(t0);
        let remote = ip("203.0.113.5");

        agg.record(remote, PacketDirection::Up, 1, t0 + ms(100));
        agg.record(remote, PacketDirection::Up, 1, t0 + ms(600));
        let snapshot = agg.tick(t0 + ms(700)).updated[&remote].clone();

        assert_eq!(
            (snapshot.last_seen - snapshot.first_seen).num_milliseconds(),
            500
        );
    }
}
