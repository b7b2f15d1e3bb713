//! Transport state bookkeeping shared by every transport implementation.
//!
//! Background tasks report what happened on the medium through an unbounded
//! channel; the owner pulls events through [`Lifecycle`], which updates the
//! transport state as each event is observed. State therefore only changes
//! on the owner's side and needs no locking.

use tokio::sync::mpsc;

use crate::traits::{TransportEvent, TransportState};

/// Sending half handed to a transport's background tasks.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Event stream plus the state derived from it.
pub struct Lifecycle {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    state: TransportState,
    writable: bool,
    finished: bool,
}

impl Lifecycle {
    /// Create a lifecycle in the `Closed` state and the sink feeding it.
    pub fn new() -> (Self, EventSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            events: rx,
            state: TransportState::Closed,
            writable: false,
            finished: false,
        };
        (lifecycle, tx)
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_writable(&self) -> bool {
        self.writable && self.state == TransportState::Open
    }

    /// Owner-initiated transition (open, close).
    pub fn transition(&mut self, new_state: TransportState) -> TransportState {
        let old = self.state;
        if self.finished {
            return old;
        }
        if new_state != TransportState::Open {
            self.writable = false;
        }
        self.state = new_state;
        old
    }

    /// Back from `Paused`. A pause still in flight is handled by the owner.
    pub fn resume(&mut self) {
        if !self.finished && self.state == TransportState::Paused {
            self.state = TransportState::Open;
            self.writable = true;
        }
    }

    /// A batch was handed to the medium; not writable until `Drained`.
    pub fn mark_sending(&mut self) {
        self.writable = false;
    }

    /// Apply an event's effect on state. Returns `false` if the event arrives
    /// after `Closed` and must be discarded.
    pub fn observe(&mut self, event: &TransportEvent) -> bool {
        if self.finished {
            return false;
        }
        match event {
            TransportEvent::Opened => {
                if matches!(self.state, TransportState::Opening | TransportState::Closed) {
                    self.state = TransportState::Open;
                    self.writable = true;
                }
            }
            TransportEvent::Drained => {
                if self.state == TransportState::Open {
                    self.writable = true;
                }
            }
            TransportEvent::Paused => {
                self.state = TransportState::Paused;
                self.writable = false;
            }
            TransportEvent::Closed(_) => {
                self.state = TransportState::Closed;
                self.writable = false;
                self.finished = true;
            }
            TransportEvent::Packet(_) | TransportEvent::Error(_) => {}
        }
        true
    }

    /// Wait for the next event. Cancel-safe.
    pub async fn next(&mut self) -> Option<TransportEvent> {
        loop {
            if self.finished {
                return None;
            }
            let event = self.events.recv().await?;
            if self.observe(&event) {
                return Some(event);
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.try_recv().ok()?;
        self.observe(&event).then_some(event)
    }
}
