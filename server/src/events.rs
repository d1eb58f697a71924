//! Event emission.
//!
//! Engines publish typed events scoped to a character, corporation or
//! sector. The bus is the sending half of an unbounded channel; the network
//! layer owns the receiving half and routes envelopes to connected
//! sessions. Delivery beyond that (corporation fan-out, offline queues) is
//! the transport's concern, not the engines'.

use log::{debug, warn};
use shared::entities::{Owner, ShipState};
use shared::{EventScope, GameEvent};
use tokio::sync::mpsc;

/// One scoped event ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub scope: EventScope,
    pub event: GameEvent,
}

/// Sending half of the event pipeline, cheap to clone into engines.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventBus {
    /// Creates the bus and the consumer half the network layer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    pub fn emit(&self, scope: EventScope, event: GameEvent) {
        debug!("emitting {:?} event: {:?}", scope, event);
        if self.tx.send(EventEnvelope { scope, event }).is_err() {
            // Receiver gone during shutdown; the mutation already committed.
            warn!("event dropped: consumer closed");
        }
    }

    /// Emits the actor-visible ship snapshot required after every
    /// successful mutation, scoped to the ship's owner.
    pub fn emit_ship_status(&self, ship: &ShipState) {
        let scope = match ship.owner {
            Owner::Character(id) => EventScope::Character(id),
            Owner::Corporation(id) => EventScope::Corporation(id),
        };
        self.emit(
            scope,
            GameEvent::ShipStatus { ship: ship.clone() },
        );
    }
}
