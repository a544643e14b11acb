use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::capture::context::PcapContext;
use crate::events::SubscriptionId;
use crate::models::config::CaptureConfig;
use crate::models::delta::CaptureDelta;
use crate::models::device::Device;
use crate::models::state::PcapState;
use crate::utils::error::{CaptureError, CaptureResult};

/// Manages capture sessions on behalf of one consumer.
///
/// A consumer (a UI page, the CLI) attaches a new manager each time it
/// (re)initializes. Attaching stops any session a previous manager left
/// running, and dropping a manager removes its listeners.
pub struct CaptureManager {
    id: u64,

    /// Shared capture context
    context: Arc<PcapContext>,

    /// Tuning applied to sessions started without an override
    config: CaptureConfig,

    /// Listeners registered through this manager
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl CaptureManager {
    /// Attach to the shared context, stopping a session left by an earlier
    /// manager
    pub async fn attach(context: Arc<PcapContext>, config: CaptureConfig) -> CaptureResult<Self> {
        let id = context.register_controller();

        if let Some(owner) = context.active_owner() {
            warn!("Stopping capture left running by controller {}", owner);
            let stale = context.clone();
            tokio::task::spawn_blocking(move || stale.stop_blocking())
                .await
                .map_err(|e| CaptureError::Io(e.to_string()))??;
        }

        info!("Capture controller {} attached", id);
        Ok(Self {
            id,
            context,
            config,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &Arc<PcapContext> {
        &self.context
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Re-enumerate capture devices, preferred first
    pub fn enumerate_devices(&self) -> CaptureResult<Vec<Device>> {
        self.context.refresh_devices()
    }

    pub fn has_capture_privilege(&self) -> bool {
        self.context.has_capture_privilege()
    }

    /// Start capturing on `device` with this manager's configuration
    pub async fn start_capture(&self, device: &str) -> CaptureResult<()> {
        self.start_capture_with(device, &self.config).await
    }

    /// Start capturing on `device` with an explicit configuration
    pub async fn start_capture_with(&self, device: &str, config: &CaptureConfig) -> CaptureResult<()> {
        info!("Starting capture on interface: {}", device);
        let context = self.context.clone();
        let device = device.to_string();
        let config = config.clone();
        let owner = self.id;
        tokio::task::spawn_blocking(move || context.start(&device, &config, owner))
            .await
            .map_err(|e| CaptureError::Io(e.to_string()))?
    }

    /// Stop the running session, waiting for its final delta. A no-op when
    /// nothing is running.
    pub async fn stop_capture(&self) -> CaptureResult<()> {
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || context.stop_blocking())
            .await
            .map_err(|e| CaptureError::Io(e.to_string()))?
    }

    pub fn current_state(&self) -> PcapState {
        self.context.state()
    }

    /// Whether this manager started the running session
    pub fn owns_session(&self) -> bool {
        self.context.active_owner() == Some(self.id)
    }

    pub fn on_delta<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CaptureDelta) + Send + Sync + 'static,
    {
        let id = self.context.hub().on_delta(listener);
        self.subscriptions.lock().push(id);
        id
    }

    pub fn on_state_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PcapState) + Send + Sync + 'static,
    {
        let id = self.context.hub().on_state_change(listener);
        self.subscriptions.lock().push(id);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.lock().retain(|sub| *sub != id);
        self.context.hub().unsubscribe(id)
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        for id in self.subscriptions.lock().drain(..) {
            self.context.hub().unsubscribe(id);
        }
    }
}
