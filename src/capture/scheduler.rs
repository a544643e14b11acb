use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::models::delta::CaptureDelta;
use crate::utils::error::CaptureError;

/// Fixed-period tick deadline, polled from the capture loop
#[derive(Debug, Clone)]
pub struct TickSchedule {
    period: Duration,
    next: Instant,
}

impl TickSchedule {
    /// First tick fires one period after `start`
    pub fn new(period: Duration, start: Instant) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            period,
            next: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether a tick is due at `now`; advances the deadline when it is.
    ///
    /// A loop that fell behind by several periods gets one tick, not a burst.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }

        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
        true
    }

    /// Time left until the next tick
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }
}

#[derive(Default)]
struct SlotState {
    /// Never more than one non-final delta after the last final one
    pending: VecDeque<CaptureDelta>,
    closed: bool,
    close_on_final: bool,
    exit_error: Option<CaptureError>,
    /// Deltas folded into a newer one before being consumed
    coalesced: u64,
}

struct SlotInner {
    state: Mutex<SlotState>,
    ready: Condvar,
    notify: Notify,
}

/// Single-slot, latest-wins delta channel.
///
/// Pushing while a delta is still unconsumed coalesces the two (see
/// [`CaptureDelta::coalesce`]), so memory stays bounded when the consumer is
/// slow while start/end pairing is preserved. Final deltas are never folded
/// into a later one.
///
/// A slot from [`new`](Self::new) carries one session: the final delta closes
/// it and later pushes are discarded. A [`persistent`](Self::persistent) slot
/// spans sessions and only closes explicitly.
#[derive(Clone)]
pub struct DeltaSlot {
    inner: Arc<SlotInner>,
}

impl Default for DeltaSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaSlot {
    pub fn new() -> Self {
        Self::with_state(SlotState {
            close_on_final: true,
            ..Default::default()
        })
    }

    /// A slot that stays open across final deltas
    pub fn persistent() -> Self {
        Self::with_state(SlotState::default())
    }

    fn with_state(state: SlotState) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(state),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Publish a delta; returns false if the slot is already closed
    pub fn push(&self, delta: CaptureDelta) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }

            let is_final = delta.is_final;
            match state.pending.back_mut() {
                Some(older) if !older.is_final => {
                    *older = delta.coalesce(std::mem::take(older));
                    state.coalesced += 1;
                }
                _ => state.pending.push_back(delta),
            }
            state.closed = is_final && state.close_on_final;
        }

        self.wake();
        true
    }

    /// Close without a final delta, recording why the producer stopped
    pub fn close(&self, error: Option<CaptureError>) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            if error.is_some() {
                state.exit_error = error;
            }
        }

        self.wake();
    }

    /// Take the pending delta without waiting
    pub fn try_recv(&self) -> Option<CaptureDelta> {
        self.inner.state.lock().pending.pop_front()
    }

    /// Wait for the next delta; `None` once closed and drained
    pub async fn recv(&self) -> Option<CaptureDelta> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(delta) = state.pending.pop_front() {
                    return Some(delta);
                }
                if state.closed {
                    return None;
                }
            }

            self.inner.notify.notified().await;
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for plain threads
    pub fn recv_blocking(&self) -> Option<CaptureDelta> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some(delta);
            }
            if state.closed {
                return None;
            }
            self.inner.ready.wait(&mut state);
        }
    }

    /// Error the producer closed with, if any
    pub fn exit_error(&self) -> Option<CaptureError> {
        self.inner.state.lock().exit_error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// How many deltas were merged into a later one before delivery
    pub fn coalesced(&self) -> u64 {
        self.inner.state.lock().coalesced
    }

    fn wake(&self) {
        self.inner.ready.notify_all();
        self.inner.notify.notify_one();
    }
}
