//! Request gates: authorization and rate limiting.
//!
//! Both run before any engine logic touches shared state. They are seams
//! onto external services; the defaults here are an ownership check and a
//! per-actor fixed-window counter.

use shared::entities::{CharacterId, CharacterState, Owner, ShipState};
use shared::{GameError, Operation};
use std::collections::HashMap;
use std::sync::Mutex;

/// Decides whether an actor may act on a ship.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, actor: &CharacterState, ship: &ShipState) -> Result<(), GameError>;
}

/// Default policy: a character pilots their own ships and those of their
/// corporation.
#[derive(Debug, Default)]
pub struct OwnershipAuthorizer;

impl Authorizer for OwnershipAuthorizer {
    fn authorize(&self, actor: &CharacterState, ship: &ShipState) -> Result<(), GameError> {
        let allowed = match ship.owner {
            Owner::Character(id) => id == actor.character_id,
            Owner::Corporation(id) => actor.corporation == Some(id),
        };
        if allowed {
            Ok(())
        } else {
            Err(GameError::Denied {
                reason: format!(
                    "character {} does not control ship {}",
                    actor.character_id, ship.ship_id
                ),
            })
        }
    }
}

/// Throttles operations per actor.
pub trait RateLimiter: Send + Sync {
    fn check(&self, actor: CharacterId, operation: Operation) -> Result<(), GameError>;
}

/// Fixed-window counter per (actor, operation).
#[derive(Debug)]
pub struct WindowLimiter {
    max_per_window: u32,
    window_ms: u64,
    windows: Mutex<HashMap<(CharacterId, Operation), (u64, u32)>>,
    clock: fn() -> u64,
}

impl WindowLimiter {
    pub fn new(max_per_window: u32, window_ms: u64) -> Self {
        WindowLimiter {
            max_per_window,
            window_ms,
            windows: Mutex::new(HashMap::new()),
            clock: crate::util::now_ms,
        }
    }

    #[cfg(test)]
    fn with_clock(max_per_window: u32, window_ms: u64, clock: fn() -> u64) -> Self {
        WindowLimiter {
            max_per_window,
            window_ms,
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl RateLimiter for WindowLimiter {
    fn check(&self, actor: CharacterId, operation: Operation) -> Result<(), GameError> {
        let now = (self.clock)();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let (start, count) = windows.entry((actor, operation)).or_insert((now, 0));

        if now.saturating_sub(*start) >= self.window_ms {
            *start = now;
            *count = 0;
        }
        if *count >= self.max_per_window {
            return Err(GameError::RateLimited);
        }
        *count += 1;
        Ok(())
    }
}
