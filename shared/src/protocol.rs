//! Wire protocol and error taxonomy.
//!
//! One serde enum carries both packet directions over UDP + bincode, the
//! way the transport expects a single frame type. Errors travel inside
//! result packets, so the taxonomy lives here too.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::entities::{
    CharacterId, CombatId, CombatantId, Commodity, CorporationId, GarrisonId, PortId,
    SectorId, ShipId, ShipState, TradeDirection,
};

/// Operations subject to rate limiting and request dispatch.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    SubmitCombatAction,
    ExecuteTrade,
    SubmitMove,
}

/// Resources whose shortage fails a request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Credits,
    /// Goods in the ship's hold.
    Cargo,
    CargoSpace,
    /// Goods in the port's inventory.
    Stock,
    PortCapacity,
    Fighters,
    WarpPower,
}

/// Abstract status families the transport maps responses onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ClientError,
    NotFound,
    Conflict,
    ServerError,
}

/// Everything an engine can reject a request with.
///
/// Validation, precondition, authorization and resource errors are terminal
/// for the request. Conflicts are retried internally only by the trading
/// engine; everywhere else the caller retries. Infrastructure errors are
/// logged and surfaced as server errors.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
pub enum GameError {
    /// Malformed or out-of-range input, rejected before touching state.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: u64 },

    /// The entity exists but is in the wrong state for this operation.
    #[error("wrong state: {reason}")]
    WrongState { reason: String },

    /// A concurrent writer won the race; reload and retry.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("denied: {reason}")]
    Denied { reason: String },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("insufficient {resource:?}: need {required}, have {available}")]
    Insufficient {
        resource: Resource,
        required: u64,
        available: u64,
    },

    #[error("infrastructure failure: {reason}")]
    Infrastructure { reason: String },
}

impl GameError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        GameError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &str, id: impl Into<u64>) -> Self {
        GameError::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    pub fn wrong_state(reason: impl Into<String>) -> Self {
        GameError::WrongState {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        GameError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn insufficient(resource: Resource, required: u64, available: u64) -> Self {
        GameError::Insufficient {
            resource,
            required,
            available,
        }
    }

    /// The abstract status family this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            GameError::InvalidInput { .. }
            | GameError::WrongState { .. }
            | GameError::Denied { .. }
            | GameError::RateLimited
            | GameError::Insufficient { .. } => ErrorClass::ClientError,
            GameError::NotFound { .. } => ErrorClass::NotFound,
            GameError::Conflict { .. } => ErrorClass::Conflict,
            GameError::Infrastructure { .. } => ErrorClass::ServerError,
        }
    }
}

/// A combat action as submitted on the wire, before validation.
///
/// `commit` distinguishes "not given" (`None`, defaulted to a minimal
/// commitment) from "given as zero" (`Some(0)`, rejected). Validation turns
/// this into the internal [`crate::entities::CombatAction`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum ActionRequest {
    Attack {
        target: CombatantId,
        commit: Option<u32>,
    },
    Brace,
    Flee {
        destination: SectorId,
    },
    Pay {
        target: Option<GarrisonId>,
    },
}

/// Delivery scope of an emitted event.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    Character(CharacterId),
    Corporation(CorporationId),
    Sector(SectorId),
}

/// Per-participant result of one resolved round.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ParticipantOutcome {
    pub hits_dealt: u32,
    pub fighters_lost: u32,
    pub shields_lost: u32,
    pub fighters_remaining: u32,
    pub shields_remaining: u32,
    pub fled_to: Option<SectorId>,
    pub destroyed: bool,
    /// The engine braced for this combatant at the deadline.
    pub timed_out: bool,
}

/// Full outcome of one resolved round.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoundOutcome {
    /// The round that was resolved (the encounter is already on the next).
    pub round: u32,
    pub ended: bool,
    pub participants: BTreeMap<CombatantId, ParticipantOutcome>,
}

/// Receipt for a committed trade.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TradeReceipt {
    pub port_id: PortId,
    pub commodity: Commodity,
    pub direction: TradeDirection,
    pub quantity: u32,
    pub unit_price: u64,
    pub total: u64,
    pub credits_remaining: u64,
    /// Conditional-commit attempts the trade needed (1 = no contention).
    pub attempts: u32,
}

/// Receipt for an accepted hyperspace departure.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct MoveReceipt {
    pub ship_id: ShipId,
    pub origin: SectorId,
    pub destination: SectorId,
    /// Expected arrival, epoch milliseconds.
    pub eta: u64,
}

/// Result of one accepted combat submission.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub combat_id: CombatId,
    /// Round the action was filed under.
    pub round: u32,
    /// Set when the submission completed the round (or found the deadline
    /// already past) and resolution ran synchronously.
    pub resolved: Option<RoundOutcome>,
}

/// Events published by the engines, scoped by [`EventScope`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum GameEvent {
    ActionAccepted {
        combat_id: CombatId,
        round: u32,
        combatant: CombatantId,
    },
    CombatStarted {
        combat_id: CombatId,
        sector_id: SectorId,
        participants: Vec<CombatantId>,
    },
    /// An action landed but the round is still waiting on other combatants.
    RoundWaiting {
        combat_id: CombatId,
        round: u32,
        waiting_on: Vec<CombatantId>,
    },
    RoundResolved {
        combat_id: CombatId,
        outcome: RoundOutcome,
    },
    CombatEnded {
        combat_id: CombatId,
        round: u32,
    },
    TollPaid {
        combat_id: CombatId,
        garrison: GarrisonId,
        payer: CharacterId,
        amount: u64,
    },
    TradeCompleted {
        receipt: TradeReceipt,
    },
    HyperspaceDeparted {
        ship_id: ShipId,
        origin: SectorId,
        destination: SectorId,
        eta: u64,
    },
    HyperspaceArrived {
        ship_id: ShipId,
        sector_id: SectorId,
    },
    /// The actor's authoritative ship snapshot after any visible mutation.
    ShipStatus {
        ship: ShipState,
    },
}

/// Every frame that crosses the wire, in either direction.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // client -> server
    Connect {
        character_id: CharacterId,
        client_version: u32,
    },
    Disconnect,
    SubmitCombatAction {
        combat_id: CombatId,
        combatant_id: CombatantId,
        action: ActionRequest,
        /// Stale-round guard: when given, must match the current round.
        round: Option<u32>,
    },
    ExecuteTrade {
        character_id: CharacterId,
        port_id: PortId,
        commodity: Commodity,
        direction: TradeDirection,
        quantity: u32,
    },
    SubmitMove {
        character_id: CharacterId,
        destination: SectorId,
    },

    // server -> client
    Connected {
        character_id: CharacterId,
    },
    Disconnected {
        reason: String,
    },
    CombatActionResult {
        result: Result<SubmitOutcome, GameError>,
    },
    TradeResult {
        result: Result<TradeReceipt, GameError>,
    },
    MoveResult {
        result: Result<MoveReceipt, GameError>,
    },
    Event {
        scope: EventScope,
        event: GameEvent,
    },
}
