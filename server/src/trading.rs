//! Trading engine: optimistic concurrency against port inventory.
//!
//! A trade is computed purely against fresh snapshots, then committed with
//! compare-and-swap on the port row version. Losing the race costs a
//! jittered backoff and a full reload/revalidate; losing it
//! `MAX_TRADE_ATTEMPTS` times fails the trade with a conflict the caller
//! may retry. The follow-up ship commit is the second leg of a saga: if it
//! fails, the port change is reversed best-effort and the failure logged.

use crate::events::EventBus;
use crate::gateway::{Gateway, GatewayError};
use crate::retry::{JitterSource, RetryPolicy, ThreadJitter};
use log::{error, info, warn};
use shared::entities::{
    CharacterId, Commodity, PortId, PortInventory, ShipId, ShipState, TradeDirection,
};
use shared::pricing::trade_unit_price;
use shared::{EventScope, GameError, GameEvent, Resource, TradeReceipt};
use std::sync::Arc;

/// The fully validated, not yet committed result of a trade computation.
#[derive(Debug, Clone, PartialEq)]
struct TradePlan {
    new_port: PortInventory,
    unit_price: u64,
    total: u64,
}

/// Validates a trade against port and ship snapshots and computes the
/// post-trade port row. Pure; all I/O happens around it.
fn plan_trade(
    port: &PortInventory,
    ship: &ShipState,
    commodity: Commodity,
    direction: TradeDirection,
    quantity: u32,
) -> Result<TradePlan, GameError> {
    if ship.sector_id != Some(port.sector_id) {
        return Err(GameError::wrong_state(format!(
            "ship {} is not in port {}'s sector",
            ship.ship_id, port.port_id
        )));
    }
    if !port.supports(commodity, direction) {
        return Err(GameError::invalid(format!(
            "port {} does not support {:?} {:?}",
            port.port_id, direction, commodity
        )));
    }

    let unit_price = trade_unit_price(port, commodity, direction);
    let total = unit_price * u64::from(quantity);
    let slot = commodity.index();
    let mut new_port = port.clone();

    match direction {
        TradeDirection::Buy => {
            let stock = port.stock_of(commodity);
            if stock < quantity {
                return Err(GameError::insufficient(
                    Resource::Stock,
                    u64::from(quantity),
                    u64::from(stock),
                ));
            }
            if ship.credits < total {
                return Err(GameError::insufficient(
                    Resource::Credits,
                    total,
                    ship.credits,
                ));
            }
            if ship.cargo_space() < quantity {
                return Err(GameError::insufficient(
                    Resource::CargoSpace,
                    u64::from(quantity),
                    u64::from(ship.cargo_space()),
                ));
            }
            new_port.stock[slot] -= quantity;
        }
        TradeDirection::Sell => {
            let held = ship.cargo[slot];
            if held < quantity {
                return Err(GameError::insufficient(
                    Resource::Cargo,
                    u64::from(quantity),
                    u64::from(held),
                ));
            }
            let space = port.space_for(commodity);
            if space < quantity {
                return Err(GameError::insufficient(
                    Resource::PortCapacity,
                    u64::from(quantity),
                    u64::from(space),
                ));
            }
            new_port.stock[slot] += quantity;
        }
    }

    Ok(TradePlan {
        new_port,
        unit_price,
        total,
    })
}

pub struct TradingEngine {
    gateway: Arc<Gateway>,
    events: EventBus,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl TradingEngine {
    pub fn new(gateway: Arc<Gateway>, events: EventBus) -> Self {
        TradingEngine {
            gateway,
            events,
            policy: RetryPolicy::trade_default(),
            jitter: Arc::new(ThreadJitter),
        }
    }

    /// Overrides the retry policy and jitter source (deterministic tests).
    pub fn with_policy(
        gateway: Arc<Gateway>,
        events: EventBus,
        policy: RetryPolicy,
        jitter: Arc<dyn JitterSource>,
    ) -> Self {
        TradingEngine {
            gateway,
            events,
            policy,
            jitter,
        }
    }

    /// Executes one trade for the character's active ship.
    pub async fn execute_trade(
        &self,
        character_id: CharacterId,
        port_id: PortId,
        commodity: Commodity,
        direction: TradeDirection,
        quantity: u32,
    ) -> Result<TradeReceipt, GameError> {
        if quantity == 0 {
            return Err(GameError::invalid("quantity must be positive"));
        }

        let character = self.gateway.characters.load(character_id).await?;
        let ship_id = character.value.ship_id;

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                let delay = self.policy.backoff_delay(attempt - 1, self.jitter.as_ref());
                tokio::time::sleep(delay).await;
            }

            // Fresh snapshots every attempt; prices and validation are only
            // meaningful against the state the commit is conditioned on.
            let port = self.gateway.ports.load(port_id).await?;
            let ship = self.gateway.ships.load(ship_id).await?;
            let plan = plan_trade(&port.value, &ship.value, commodity, direction, quantity)?;

            match self
                .gateway
                .ports
                .update_if_version(port_id, port.version, plan.new_port.clone())
                .await
            {
                Ok(_) => {
                    let receipt = self
                        .commit_ship(
                            ship_id, port_id, commodity, direction, quantity, &plan,
                            attempt + 1,
                        )
                        .await?;
                    info!(
                        "trade committed: character {} {:?} {} x{:?} at port {} for {} (attempt {})",
                        character_id,
                        direction,
                        quantity,
                        commodity,
                        port_id,
                        receipt.total,
                        receipt.attempts
                    );
                    self.events.emit(
                        EventScope::Character(character_id),
                        GameEvent::TradeCompleted {
                            receipt: receipt.clone(),
                        },
                    );
                    return Ok(receipt);
                }
                Err(GatewayError::NoMatch { .. }) => {
                    warn!(
                        "port {} version changed under trade attempt {}, retrying",
                        port_id,
                        attempt + 1
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(GameError::conflict(format!(
            "port {} contention exhausted {} attempts",
            port_id, self.policy.max_attempts
        )))
    }

    /// Second saga leg: apply the trade to the ship, revalidating the
    /// resources under the row lock. On failure the port commit is
    /// reversed best-effort.
    async fn commit_ship(
        &self,
        ship_id: ShipId,
        port_id: PortId,
        commodity: Commodity,
        direction: TradeDirection,
        quantity: u32,
        plan: &TradePlan,
        attempts: u32,
    ) -> Result<TradeReceipt, GameError> {
        let slot = commodity.index();
        let total = plan.total;

        let updated = match direction {
            TradeDirection::Buy => {
                self.gateway
                    .ships
                    .update_if(
                        ship_id,
                        |ship| ship.credits >= total && ship.cargo_space() >= quantity,
                        |ship| {
                            ship.credits -= total;
                            ship.cargo[slot] += quantity;
                        },
                    )
                    .await
            }
            TradeDirection::Sell => {
                self.gateway
                    .ships
                    .update_if(
                        ship_id,
                        |ship| ship.cargo[slot] >= quantity,
                        |ship| {
                            ship.cargo[slot] -= quantity;
                            ship.credits += total;
                        },
                    )
                    .await
            }
        };

        match updated {
            Ok(ship) => {
                self.events.emit_ship_status(&ship.value);
                Ok(TradeReceipt {
                    port_id,
                    commodity,
                    direction,
                    quantity,
                    unit_price: plan.unit_price,
                    total,
                    credits_remaining: ship.value.credits,
                    attempts,
                })
            }
            Err(err) => {
                error!(
                    "ship {} commit failed after port {} commit: {}; compensating",
                    ship_id, port_id, err
                );
                self.compensate_port(port_id, commodity, direction, quantity)
                    .await;
                Err(GameError::conflict(format!(
                    "ship {} changed during trade commit",
                    ship_id
                )))
            }
        }
    }

    /// Best-effort reversal of a committed port delta. Applies the inverse
    /// delta (never a blind restore, which would clobber concurrent
    /// trades), clamped to the slot's bounds. Its own failure is logged and
    /// not re-thrown; looping here could only corrupt state further.
    async fn compensate_port(
        &self,
        port_id: PortId,
        commodity: Commodity,
        direction: TradeDirection,
        quantity: u32,
    ) {
        let slot = commodity.index();
        let result = self
            .gateway
            .ports
            .update(port_id, |port| match direction {
                TradeDirection::Buy => {
                    port.stock[slot] =
                        (port.stock[slot] + quantity).min(port.max_capacity[slot]);
                }
                TradeDirection::Sell => {
                    port.stock[slot] = port.stock[slot].saturating_sub(quantity);
                }
            })
            .await;

        match result {
            Ok(_) => warn!(
                "compensated port {} after failed ship commit ({:?} {:?} x{})",
                port_id, direction, commodity, quantity
            ),
            Err(err) => error!(
                "compensation of port {} failed, inventory may be skewed: {}",
                port_id, err
            ),
        }
    }
}
