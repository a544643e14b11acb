use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::aggregator::{AggregatorSettings, FlowAggregator};
use crate::capture::backend::PacketSource;
use crate::capture::classifier::Classifier;
use crate::capture::scheduler::{DeltaSlot, TickSchedule};
use crate::models::config::CaptureConfig;
use crate::models::delta::CaptureDelta;
use crate::utils::error::{CaptureError, CaptureResult};

/// Read errors tolerated in a row before the session is abandoned
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Pause between retries after a read error
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Classification, aggregation and tick scheduling for one session.
///
/// Owns all mutable per-session state; nothing here is shared.
#[derive(Debug)]
pub struct Pipeline {
    classifier: Classifier,
    aggregator: FlowAggregator,
    schedule: TickSchedule,
}

impl Pipeline {
    pub fn new(classifier: Classifier, config: &CaptureConfig, now: Instant) -> Self {
        Self {
            classifier,
            aggregator: FlowAggregator::new(AggregatorSettings::from(config), now),
            schedule: TickSchedule::new(config.report_frequency, now),
        }
    }

    /// Feed one frame; returns whether it was attributed to a flow
    pub fn on_frame(&mut self, data: &[u8], wire_len: usize, now: Instant) -> bool {
        match self.classifier.classify(data, wire_len) {
            Some(packet) => {
                self.aggregator.record(packet.remote, packet.direction, packet.len, now);
                true
            }
            None => false,
        }
    }

    /// Produce a delta if a tick is due
    pub fn poll_tick(&mut self, now: Instant) -> Option<CaptureDelta> {
        if self.schedule.poll(now) {
            Some(self.aggregator.tick(now))
        } else {
            None
        }
    }

    /// End every flow; the returned delta is final
    pub fn finish(&mut self) -> CaptureDelta {
        self.aggregator.stop()
    }

    pub fn aggregator(&self) -> &FlowAggregator {
        &self.aggregator
    }
}

/// Counters for one worker run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub classified: u64,
    pub ticks: u64,
}

/// Closes the slot if the worker unwinds, so the forwarder never waits on a
/// dead producer
struct PanicGuard<'a>(&'a DeltaSlot);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.push(CaptureDelta {
                is_final: true,
                ..Default::default()
            });
            self.0.close(Some(CaptureError::Io("capture worker panicked".into())));
        }
    }
}

/// Capture loop: read, classify, aggregate and publish until `stop` is set
/// or the source fails.
///
/// The tick deadline is checked after every read, and reads time out within
/// one tick, so deltas keep flowing on a quiet network and a stop request is
/// observed promptly. On exit the source is released first, then the final
/// delta is published and the slot closed with the failure, if any.
pub fn run(
    mut source: Box<dyn PacketSource>,
    mut pipeline: Pipeline,
    slot: DeltaSlot,
    stop: Arc<AtomicBool>,
) -> CaptureResult<WorkerStats> {
    let _guard = PanicGuard(&slot);
    let mut stats = WorkerStats::default();
    let mut consecutive_errors = 0;
    let mut failure = None;

    info!("Capture loop started ({:?} link)", source.link_kind());

    while !stop.load(Ordering::Acquire) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                consecutive_errors = 0;
                stats.frames += 1;
                if pipeline.on_frame(frame.data, frame.wire_len, Instant::now()) {
                    stats.classified += 1;
                }
            }
            Ok(None) => {
                consecutive_errors = 0;
                trace!("Read timed out");
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("Too many consecutive read errors ({}), stopping capture: {}", consecutive_errors, e);
                    failure = Some(e);
                    break;
                }
                warn!("Error reading packet: {}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }

        if let Some(delta) = pipeline.poll_tick(Instant::now()) {
            stats.ticks += 1;
            slot.push(delta);
        }
    }

    drop(source);
    slot.push(pipeline.finish());
    slot.close(failure.clone());

    debug!(
        "Capture loop finished: {} frames, {} classified, {} ticks, {} deltas coalesced",
        stats.frames,
        stats.classified,
        stats.ticks,
        slot.coalesced()
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::Frame;
    use crate::capture::classifier::LinkKind;
    use std::collections::{HashSet, VecDeque};
    use std::net::IpAddr;

    enum Step {
        Frame(Vec<u8>),
        Timeout,
        Fail,
    }

    /// Replays a script, then times out forever
    struct Scripted {
        steps: VecDeque<Step>,
        current: Vec<u8>,
        read_delay: Duration,
    }

    impl PacketSource for Scripted {
        fn link_kind(&self) -> LinkKind {
            LinkKind::Raw
        }

        fn next_frame(&mut self) -> CaptureResult<Option<Frame<'_>>> {
            thread::sleep(self.read_delay);
            match self.steps.pop_front() {
                Some(Step::Frame(data)) => {
                    self.current = data;
                    Ok(Some(Frame {
                        data: &self.current,
                        wire_len: self.current.len(),
                    }))
                }
                Some(Step::Fail) => Err(CaptureError::Io("link down".into())),
                Some(Step::Timeout) | None => Ok(None),
            }
        }
    }

    fn ipv4(src: [u8; 4], dst: [u8; 4], len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; len.max(20)];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = 6;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    fn pipeline(config: &CaptureConfig) -> Pipeline {
        let local: HashSet<IpAddr> = ["192.168.1.10".parse().unwrap()].into_iter().collect();
        Pipeline::new(Classifier::new(LinkKind::Raw, local), config, Instant::now())
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            report_frequency: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn pipeline_attributes_frames() {
        let config = config();
        let mut pipeline = pipeline(&config);
        let now = Instant::now();

        assert!(pipeline.on_frame(&ipv4([192, 168, 1, 10], [93, 184, 216, 34], 100), 100, now));
        assert!(!pipeline.on_frame(&[0xde, 0xad], 2, now));
        assert_eq!(pipeline.aggregator().len(), 1);

        assert!(pipeline.poll_tick(now).is_none());
        let delta = pipeline.poll_tick(now + Duration::from_millis(25)).unwrap();
        assert_eq!(delta.started, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);

        let last = pipeline.finish();
        assert!(last.is_final);
        assert_eq!(last.ended, delta.started);
    }

    #[test]
    fn stop_flag_ends_session_with_final_delta() {
        let source = Scripted {
            steps: vec![
                Step::Frame(ipv4([192, 168, 1, 10], [93, 184, 216, 34], 120)),
                Step::Frame(ipv4([93, 184, 216, 34], [192, 168, 1, 10], 1500)),
            ]
            .into(),
            current: Vec::new(),
            read_delay: Duration::from_millis(5),
        };
        let config = config();
        let slot = DeltaSlot::new();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let slot = slot.clone();
            let stop = stop.clone();
            let pipeline = pipeline(&config);
            thread::spawn(move || run(Box::new(source), pipeline, slot, stop))
        };

        let first = slot.recv_blocking().unwrap();
        assert_eq!(first.started.len(), 1);

        stop.store(true, Ordering::Release);
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.classified, 2);

        let mut last = None;
        while let Some(delta) = slot.recv_blocking() {
            last = Some(delta);
        }
        let last = last.unwrap();
        assert!(last.is_final);
        assert_eq!(last.ended, first.started);
        assert_eq!(last.session.down_total, 1500);
        assert!(slot.exit_error().is_none());
    }

    #[test]
    fn persistent_read_errors_end_session() {
        let mut steps: VecDeque<Step> = vec![Step::Timeout].into();
        steps.extend((0..MAX_CONSECUTIVE_ERRORS).map(|_| Step::Fail));
        let source = Scripted {
            steps,
            current: Vec::new(),
            read_delay: Duration::ZERO,
        };
        let config = config();
        let slot = DeltaSlot::new();

        let result = run(
            Box::new(source),
            pipeline(&config),
            slot.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        assert_eq!(result, Err(CaptureError::Io("link down".into())));
        assert!(slot.is_closed());
        assert_eq!(slot.exit_error(), Some(CaptureError::Io("link down".into())));

        let mut last = None;
        while let Some(delta) = slot.try_recv() {
            last = Some(delta);
        }
        assert!(last.unwrap().is_final);
    }

    #[test]
    fn transient_errors_are_tolerated() {
        let source = Scripted {
            steps: vec![Step::Fail, Step::Fail, Step::Timeout, Step::Fail].into(),
            current: Vec::new(),
            read_delay: Duration::from_millis(1),
        };
        let config = config();
        let slot = DeltaSlot::new();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let slot = slot.clone();
            let stop = stop.clone();
            let pipeline = pipeline(&config);
            thread::spawn(move || run(Box::new(source), pipeline, slot, stop))
        };

        thread::sleep(Duration::from_millis(400));
        assert!(!slot.is_closed());

        stop.store(true, Ordering::Release);
        assert!(handle.join().unwrap().is_ok());
        assert!(slot.exit_error().is_none());
    }
}
