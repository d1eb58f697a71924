//! # Shared Game Types
//!
//! Types and pure logic shared between the authoritative server and any
//! client speaking its wire protocol:
//!
//! - Entity rows persisted by the server (ships, characters, ports,
//!   garrisons, combat encounters) in [`entities`]
//! - The commodity price curves and port trade-direction rules in [`pricing`]
//! - The bincode wire protocol, event payloads and the error taxonomy in
//!   [`protocol`]
//!
//! Everything here is deterministic and I/O free. The server owns all
//! mutation; clients only ever see these types serialized inside
//! [`protocol::Packet`] frames.

pub mod entities;
pub mod pricing;
pub mod protocol;

pub use entities::*;
pub use pricing::{buy_from_port_price, sell_to_port_price};
pub use protocol::{
    ActionRequest, ErrorClass, EventScope, GameError, GameEvent, MoveReceipt, Operation,
    Packet, ParticipantOutcome, Resource, RoundOutcome, SubmitOutcome, TradeReceipt,
};

/// Wire protocol version; bumped on incompatible packet changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of tradeable commodities (fuel ore, organics, equipment).
pub const COMMODITY_COUNT: usize = 3;

/// Base unit price per commodity, indexed by [`Commodity::index`].
pub const BASE_PRICES: [u32; COMMODITY_COUNT] = [25, 45, 90];

/// Price multiplier range when a port sells to a player (scarcity premium).
pub const SELL_PRICE_MIN: f64 = 1.0;
pub const SELL_PRICE_MAX: f64 = 1.6;

/// Price multiplier range when a port buys from a player (need premium).
pub const BUY_PRICE_MIN: f64 = 0.6;
pub const BUY_PRICE_MAX: f64 = 1.2;

/// Fraction of committed fighters that land as hits on the target.
pub const COMBAT_ODDS: f64 = 0.6;

/// Incoming hits are scaled by this factor when the target braces.
pub const BRACE_MITIGATION: f64 = 0.5;

/// Fraction of committed fighters the attacker loses to the defenders.
pub const ATTACKER_ATTRITION: f64 = 0.25;

/// Maximum conditional-commit attempts for one trade before giving up.
pub const MAX_TRADE_ATTEMPTS: u32 = 15;

/// Base delay for the jittered exponential trade backoff, in milliseconds.
pub const TRADE_BACKOFF_BASE_MS: u64 = 10;
