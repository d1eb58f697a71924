//! Commodity price curves.
//!
//! Prices are pure functions of a port's current stock and capacity. A port
//! selling into scarcity charges more; a port buying toward saturation pays
//! less. Both curves fall monotonically as stock rises.

use crate::entities::{Commodity, PortInventory, TradeDirection};
use crate::{BASE_PRICES, BUY_PRICE_MAX, BUY_PRICE_MIN, SELL_PRICE_MAX, SELL_PRICE_MIN};

/// Raw multiplier shared by both curves: `min + (max - min) * sqrt(1 - fill)`.
fn scarcity_multiplier(stock: u32, capacity: u32, min: f64, max: f64) -> f64 {
    if capacity == 0 {
        return min;
    }
    let fill = f64::from(stock.min(capacity)) / f64::from(capacity);
    min + (max - min) * (1.0 - fill).sqrt()
}

/// Unit price a player pays when buying this commodity from a port,
/// rounded to the nearest credit.
pub fn buy_from_port_price(base: u32, stock: u32, capacity: u32) -> u64 {
    let multiplier = scarcity_multiplier(stock, capacity, SELL_PRICE_MIN, SELL_PRICE_MAX);
    (f64::from(base) * multiplier).round() as u64
}

/// Unit price a port pays when buying this commodity from a player,
/// rounded to the nearest credit.
pub fn sell_to_port_price(base: u32, stock: u32, capacity: u32) -> u64 {
    let multiplier = scarcity_multiplier(stock, capacity, BUY_PRICE_MIN, BUY_PRICE_MAX);
    (f64::from(base) * multiplier).round() as u64
}

/// Unit price for a trade against the port's current stock.
pub fn trade_unit_price(
    port: &PortInventory,
    commodity: Commodity,
    direction: TradeDirection,
) -> u64 {
    let base = BASE_PRICES[commodity.index()];
    let stock = port.stock_of(commodity);
    let capacity = port.capacity_of(commodity);
    match direction {
        TradeDirection::Buy => buy_from_port_price(base, stock, capacity),
        TradeDirection::Sell => sell_to_port_price(base, stock, capacity),
    }
}
