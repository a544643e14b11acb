use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::delta::CaptureDelta;
use crate::models::state::PcapState;

pub type DeltaListener = Arc<dyn Fn(&CaptureDelta) + Send + Sync>;
pub type StateListener = Arc<dyn Fn(&PcapState) + Send + Sync>;

/// Handle for removing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Default)]
struct Listeners {
    deltas: RwLock<Vec<(SubscriptionId, DeltaListener)>>,
    states: RwLock<Vec<(SubscriptionId, StateListener)>>,
}

/// Fan-out of capture deltas and state changes to registered listeners.
///
/// Listeners run on the publishing thread, in registration order. They may
/// subscribe or unsubscribe from inside a callback; the change applies from
/// the next publish.
#[derive(Clone, Default)]
pub struct EventHub {
    listeners: Arc<Listeners>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_delta<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CaptureDelta) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.listeners.deltas.write().push((id, Arc::new(listener)));
        id
    }

    pub fn on_state_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PcapState) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.listeners.states.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.listeners.deltas.write().retain(|(sub, _)| {
            let keep = *sub != id;
            removed |= !keep;
            keep
        });
        self.listeners.states.write().retain(|(sub, _)| {
            let keep = *sub != id;
            removed |= !keep;
            keep
        });

        if removed {
            debug!("Removed listener {:?}", id);
        }
        removed
    }

    pub fn publish_delta(&self, delta: &CaptureDelta) {
        let listeners: Vec<DeltaListener> = self
            .listeners
            .deltas
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(delta);
        }
    }

    pub fn publish_state(&self, state: &PcapState) {
        let listeners: Vec<StateListener> = self
            .listeners
            .states
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(state);
        }
    }

    /// Number of registered listeners of both kinds
    pub fn listener_count(&self) -> usize {
        self.listeners.deltas.read().len() + self.listeners.states.read().len()
    }
}
