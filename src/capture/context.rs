use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crate::capture::backend::CaptureBackend;
use crate::capture::classifier::Classifier;
use crate::capture::scheduler::DeltaSlot;
use crate::capture::worker::{self, Pipeline, WorkerStats};
use crate::events::EventHub;
use crate::models::config::CaptureConfig;
use crate::models::delta::CaptureDelta;
use crate::models::device::Device;
use crate::models::state::{PcapState, SessionStatus};
use crate::utils::error::{CaptureError, CaptureResult, ErrorKind};

/// Handles of the running session
struct Session {
    id: u64,
    /// Controller that started the session
    owner: u64,
    device: Device,
    stop: Arc<AtomicBool>,
    slot: DeltaSlot,
    /// Taken by whoever tears the session down
    worker: Option<JoinHandle<CaptureResult<WorkerStats>>>,
    forwarder: Option<JoinHandle<()>>,
}

/// A start that has not finished launching yet
struct Pending {
    owner: u64,
    device: String,
    /// Thread running the start, which must not wait on itself
    thread: ThreadId,
    /// Stop requested from that thread while starting
    stop_requested: bool,
}

struct Shared {
    available: bool,
    version: Option<String>,
    status: SessionStatus,
    devices: Vec<Device>,
    session: Option<Session>,
    pending: Option<Pending>,
    last_error: Option<CaptureError>,
    /// Persistent error kinds already published once
    surfaced: HashSet<ErrorKind>,
    next_session: u64,
}

/// Process-wide owner of the capture backend and the single capture session.
///
/// At most one session runs at a time. Deltas are published through the
/// [`EventHub`] from a forwarder thread, state changes from whichever thread
/// caused them. Dropping the context stops any running session.
pub struct PcapContext {
    backend: Arc<dyn CaptureBackend>,
    hub: EventHub,
    shared: Mutex<Shared>,
    /// Serializes state publication so listeners see changes in order
    publishing: ReentrantMutex<()>,
    /// Signalled when a start leaves `Starting`
    launched: Condvar,
    next_controller: AtomicU64,
}

impl PcapContext {
    /// Probe the backend and enumerate devices.
    ///
    /// A missing backend is not an error here: the context starts in
    /// [`SessionStatus::Unavailable`] and reports why through its state.
    pub fn init(backend: Arc<dyn CaptureBackend>) -> Arc<Self> {
        let mut shared = Shared {
            available: false,
            version: None,
            status: SessionStatus::Unavailable,
            devices: Vec::new(),
            session: None,
            pending: None,
            last_error: None,
            surfaced: HashSet::new(),
            next_session: 1,
        };

        match backend.probe() {
            Ok(()) => {
                shared.available = true;
                shared.version = backend.version();
                shared.status = SessionStatus::Idle;

                match backend.devices() {
                    Ok(devices) => shared.devices = devices,
                    Err(e) => warn!("Failed to enumerate devices: {}", e),
                }
                info!(
                    "Capture backend ready ({}), {} devices",
                    shared.version.as_deref().unwrap_or("unknown version"),
                    shared.devices.len()
                );
            }
            Err(e) => {
                warn!("Capture backend unavailable: {}", e);
                shared.surfaced.insert(e.kind());
                shared.last_error = Some(e);
            }
        }

        Arc::new(Self {
            backend,
            hub: EventHub::new(),
            shared: Mutex::new(shared),
            publishing: ReentrantMutex::new(()),
            launched: Condvar::new(),
            next_controller: AtomicU64::new(1),
        })
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn state(&self) -> PcapState {
        let shared = self.shared.lock();
        PcapState {
            available: shared.available,
            version: shared.version.clone(),
            status: shared.status,
            devices: shared.devices.clone(),
            active_device: shared.session.as_ref().map(|s| s.device.clone()),
            error: shared.last_error.clone(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    /// Controller that owns the running or starting session, if any
    pub fn active_owner(&self) -> Option<u64> {
        let shared = self.shared.lock();
        shared
            .session
            .as_ref()
            .map(|s| s.owner)
            .or_else(|| shared.pending.as_ref().map(|p| p.owner))
    }

    pub(crate) fn register_controller(&self) -> u64 {
        self.next_controller.fetch_add(1, Ordering::Relaxed)
    }

    pub fn has_capture_privilege(&self) -> bool {
        self.backend.has_capture_privilege()
    }

    /// Re-enumerate devices, publishing a state change if the list moved
    pub fn refresh_devices(&self) -> CaptureResult<Vec<Device>> {
        if !self.shared.lock().available {
            return Err(self.fail(self.unavailable()));
        }

        let devices = self.backend.devices()?;
        let changed = {
            let mut shared = self.shared.lock();
            let changed = shared.devices != devices;
            shared.devices = devices.clone();
            changed
        };

        if changed {
            debug!("Device list changed, {} devices", devices.len());
            self.publish_state();
        }
        Ok(devices)
    }

    /// Start capturing on `device_name`.
    ///
    /// Fails with [`CaptureError::AlreadyCapturing`] while any session is
    /// starting, running or stopping. Every failure is also published as a
    /// state change.
    pub fn start(self: &Arc<Self>, device_name: &str, config: &CaptureConfig, owner: u64) -> CaptureResult<()> {
        {
            let mut shared = self.shared.lock();
            if !shared.available {
                drop(shared);
                return Err(self.fail(self.unavailable()));
            }
            if shared.status.is_active() {
                let current = match (&shared.session, &shared.pending) {
                    (Some(session), _) => session.device.name.clone(),
                    (None, Some(pending)) => pending.device.clone(),
                    (None, None) => device_name.to_string(),
                };
                drop(shared);
                return Err(self.fail(CaptureError::AlreadyCapturing(current)));
            }

            shared.status = SessionStatus::Starting;
            shared.pending = Some(Pending {
                owner,
                device: device_name.to_string(),
                thread: thread::current().id(),
                stop_requested: false,
            });
            shared.last_error = None;
        }
        self.publish_state();

        let launched = self.launch(device_name, config, owner);
        let stop_requested = {
            let mut shared = self.shared.lock();
            if launched.is_err() {
                shared.status = SessionStatus::Idle;
            }
            shared.pending.take().is_some_and(|p| p.stop_requested)
        };
        self.launched.notify_all();

        match launched {
            Ok(()) => {
                info!("Capture started on {}", device_name);
                self.publish_state();
                if stop_requested {
                    self.stop_blocking()?;
                }
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                self.publish_state();
                Err(e)
            }
        }
    }

    fn launch(self: &Arc<Self>, device_name: &str, config: &CaptureConfig, owner: u64) -> CaptureResult<()> {
        let devices = self.backend.devices()?;
        self.shared.lock().devices = devices.clone();

        let device = devices
            .into_iter()
            .find(|d| d.name == device_name)
            .ok_or_else(|| CaptureError::DeviceNotFound(device_name.to_string()))?;

        if !self.backend.has_capture_privilege() {
            return Err(CaptureError::InsufficientPermissions);
        }

        let source = self.backend.open(&device, config)?;
        let local: HashSet<IpAddr> = device.addresses.iter().copied().collect();
        if local.is_empty() {
            warn!("{} has no addresses, inferring local side from routability", device.name);
        }
        let classifier = Classifier::new(source.link_kind(), local).skip_non_global(config.skip_non_global);
        let pipeline = Pipeline::new(classifier, config, Instant::now());

        let slot = DeltaSlot::new();
        let stop = Arc::new(AtomicBool::new(false));
        let id = {
            let mut shared = self.shared.lock();
            let id = shared.next_session;
            shared.next_session += 1;
            id
        };

        let forwarder = {
            let slot = slot.clone();
            let hub = self.hub.clone();
            let context = Arc::downgrade(self);
            thread::Builder::new()
                .name("delta-forwarder".into())
                .spawn(move || forward(slot, hub, context, id))?
        };

        let worker = {
            let slot = slot.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("capture-{}", device.name))
                .spawn(move || worker::run(source, pipeline, slot, stop))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                slot.close(None);
                let _ = forwarder.join();
                return Err(e.into());
            }
        };

        let mut shared = self.shared.lock();
        shared.session = Some(Session {
            id,
            owner,
            device,
            stop,
            slot,
            worker: Some(worker),
            forwarder: Some(forwarder),
        });
        shared.status = SessionStatus::Capturing;
        Ok(())
    }

    /// Stop the running session and wait for it to wind down.
    ///
    /// Idempotent: returns `Ok` when nothing is running or another caller is
    /// already stopping. A session still starting is waited for and then
    /// stopped. The final delta has been published when this returns, unless
    /// called from a listener on the capture threads or the starting thread.
    pub fn stop_blocking(&self) -> CaptureResult<()> {
        let (device, stop, slot, worker, forwarder) = {
            let mut shared = self.shared.lock();
            if let Some(pending) = shared.pending.as_mut() {
                if pending.thread == thread::current().id() {
                    // A state listener of the starting thread; start() stops once launched
                    pending.stop_requested = true;
                    return Ok(());
                }
                debug!("Waiting for capture on {} to finish starting", pending.device);
                while shared.pending.is_some() {
                    self.launched.wait(&mut shared);
                }
            }

            let Some(session) = shared.session.as_mut() else {
                return Ok(());
            };
            let Some(worker) = session.worker.take() else {
                return Ok(());
            };
            let teardown = (
                session.device.name.clone(),
                session.stop.clone(),
                session.slot.clone(),
                worker,
                session.forwarder.take(),
            );
            shared.status = SessionStatus::Stopping;
            teardown
        };
        self.publish_state();

        info!("Stopping capture on {}", device);
        stop.store(true, Ordering::Release);

        let outcome = match worker.join() {
            Ok(result) => result,
            Err(_) => {
                slot.push(CaptureDelta {
                    is_final: true,
                    ..Default::default()
                });
                slot.close(None);
                Err(CaptureError::Io("capture worker panicked".into()))
            }
        };

        if let Some(forwarder) = forwarder {
            // A delta listener stopping the session runs on the forwarder itself
            if forwarder.thread().id() != thread::current().id() {
                let _ = forwarder.join();
            }
        }

        {
            let mut shared = self.shared.lock();
            shared.session = None;
            shared.status = SessionStatus::Idle;
        }

        match outcome {
            Ok(stats) => {
                info!(
                    "Capture stopped on {} ({} frames, {} attributed)",
                    device, stats.frames, stats.classified
                );
                self.publish_state();
            }
            Err(e) => {
                info!("Capture on {} stopped after a read failure", device);
                self.record_error(&e);
                self.publish_state();
            }
        }
        Ok(())
    }

    /// Exit hook: stop any session so the capture handle is released
    pub fn shutdown(&self) {
        if let Err(e) = self.stop_blocking() {
            error!("Failed to stop capture on shutdown: {}", e);
        }
    }

    /// The worker ended on its own; clean up unless a stop got there first
    fn session_ended(&self, id: u64, failure: Option<CaptureError>) {
        let (device, worker) = {
            let mut shared = self.shared.lock();
            let ours = matches!(&shared.session, Some(s) if s.id == id && s.worker.is_some());
            if !ours {
                return;
            }
            let Some(session) = shared.session.take() else {
                return;
            };
            shared.status = SessionStatus::Idle;
            (session.device.name, session.worker)
        };

        let joined = worker.and_then(|w| w.join().ok());
        let failure = failure.or_else(|| joined.and_then(Result::err));

        match failure {
            Some(e) => {
                info!("Capture on {} ended unexpectedly", device);
                self.record_error(&e);
            }
            None => info!("Capture on {} ended", device),
        }
        self.publish_state();
    }

    fn unavailable(&self) -> CaptureError {
        match &self.shared.lock().last_error {
            Some(e @ CaptureError::BackendUnavailable(_)) => e.clone(),
            _ => CaptureError::BackendUnavailable("no packet capture library found".into()),
        }
    }

    /// Make `err` the state's error; false if it is a persistent kind that
    /// was already surfaced
    fn record_error(&self, err: &CaptureError) -> bool {
        let fresh = {
            let mut shared = self.shared.lock();
            shared.last_error = Some(err.clone());
            !err.is_persistent() || shared.surfaced.insert(err.kind())
        };

        if !fresh {
            debug!("{} (already reported)", err);
        } else if err.is_persistent() {
            warn!("{}", err);
        } else {
            error!("{}", err);
        }
        fresh
    }

    /// Report an error that leaves the status unchanged, once per kind for
    /// persistent errors
    fn fail(&self, err: CaptureError) -> CaptureError {
        if self.record_error(&err) {
            self.publish_state();
        }
        err
    }

    fn publish_state(&self) {
        let _guard = self.publishing.lock();
        let state = self.state();
        self.hub.publish_state(&state);
    }
}

impl Drop for PcapContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drain the session slot into the hub, then report the session's end
fn forward(slot: DeltaSlot, hub: EventHub, context: Weak<PcapContext>, id: u64) {
    while let Some(delta) = slot.recv_blocking() {
        hub.publish_delta(&delta);
    }

    if let Some(context) = context.upgrade() {
        context.session_ended(id, slot.exit_error());
    }
}
