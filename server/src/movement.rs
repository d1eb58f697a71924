//! Movement engine: the two-phase hyperspace transition.
//!
//! Phase 1 (depart) is a single predicate-guarded update, so of two racing
//! move requests exactly one can flip the ship into hyperspace. The transit
//! wait holds no lock: the row is inert because the depart predicate can no
//! longer match. Phase 2 (arrive) finalizes unconditionally. A crash
//! between the phases strands the ship until the recovery sweep finalizes
//! any transit whose eta is long past.

use crate::combat::CombatEngine;
use crate::events::EventBus;
use crate::gateway::{Gateway, GatewayError};
use crate::map::SectorMap;
use crate::util::now_ms;
use log::{error, info, warn};
use shared::entities::{CharacterId, CharacterState, Owner, SectorId, ShipId, ShipState};
use shared::{GameError, GameEvent, EventScope, MoveReceipt, Resource};
use std::sync::Arc;
use std::time::Duration;

/// How far past its eta a transit may run before the recovery sweep
/// finalizes it anyway.
pub const STUCK_SHIP_GRACE_MS: u64 = 60_000;

#[derive(Clone)]
pub struct MovementEngine {
    gateway: Arc<Gateway>,
    events: EventBus,
    map: Arc<dyn SectorMap>,
    combat: Arc<CombatEngine>,
    /// Transit duration per unit of warp cost.
    transit_ms_per_warp: u64,
}

impl MovementEngine {
    pub fn new(
        gateway: Arc<Gateway>,
        events: EventBus,
        map: Arc<dyn SectorMap>,
        combat: Arc<CombatEngine>,
        transit_ms_per_warp: u64,
    ) -> Self {
        MovementEngine {
            gateway,
            events,
            map,
            combat,
            transit_ms_per_warp,
        }
    }

    /// Phase 1: validates and commits the departure, then schedules the
    /// arrival task. Returns as soon as the ship is in hyperspace.
    pub async fn submit_move(
        &self,
        character_id: CharacterId,
        destination: SectorId,
    ) -> Result<MoveReceipt, GameError> {
        let character = self.gateway.characters.load(character_id).await?;
        let ship_id = character.value.ship_id;
        let ship = self.gateway.ships.load(ship_id).await?;
        let ship = &ship.value;

        if ship.in_hyperspace {
            return Err(GameError::conflict(format!(
                "ship {} is already in hyperspace",
                ship_id
            )));
        }
        let origin = ship
            .sector_id
            .ok_or_else(|| GameError::wrong_state("ship has no current sector"))?;
        if !self.map.are_adjacent(origin, destination) {
            return Err(GameError::invalid(format!(
                "sector {} is not adjacent to sector {}",
                destination, origin
            )));
        }
        if ship.warp_power < ship.warp_cost {
            return Err(GameError::insufficient(
                Resource::WarpPower,
                u64::from(ship.warp_cost),
                u64::from(ship.warp_power),
            ));
        }
        if let Some(combat_id) = self
            .combat
            .active_encounter_for(character_id, origin)
            .await
        {
            return Err(GameError::wrong_state(format!(
                "character {} is engaged in combat {}",
                character_id, combat_id
            )));
        }

        let warp_cost = ship.warp_cost;
        let eta = now_ms() + u64::from(warp_cost) * self.transit_ms_per_warp;

        // The depart commit: only valid from the exact state we validated.
        let departed = self
            .gateway
            .ships
            .update_if(
                ship_id,
                |s| !s.in_hyperspace && s.sector_id == Some(origin),
                |s| {
                    s.in_hyperspace = true;
                    s.hyperspace_destination = Some(destination);
                    s.hyperspace_eta = Some(eta);
                    s.sector_id = None;
                    s.warp_power -= warp_cost;
                },
            )
            .await
            .map_err(|err| match err {
                GatewayError::NoMatch { .. } => GameError::conflict(format!(
                    "ship {} was moved by a concurrent request",
                    ship_id
                )),
                other => other.into(),
            })?;

        info!(
            "ship {} departed sector {} for sector {} (eta {})",
            ship_id, origin, destination, eta
        );
        self.events.emit(
            EventScope::Sector(origin),
            GameEvent::HyperspaceDeparted {
                ship_id,
                origin,
                destination,
                eta,
            },
        );
        self.events.emit_ship_status(&departed.value);

        // Arrival runs on its own task; the request returns immediately.
        let engine = self.clone();
        tokio::spawn(async move {
            let wait = eta.saturating_sub(now_ms());
            tokio::time::sleep(Duration::from_millis(wait)).await;
            engine.finalize_arrival(ship_id).await;
        });

        Ok(MoveReceipt {
            ship_id,
            origin,
            destination,
            eta,
        })
    }

    /// Phase 2: unconditional finalization. Safe to call more than once;
    /// a ship that already arrived is left alone.
    pub async fn finalize_arrival(&self, ship_id: ShipId) {
        let row = match self.gateway.ships.load(ship_id).await {
            Ok(row) => row,
            Err(err) => {
                error!("arrival of ship {} failed to load: {}", ship_id, err);
                return;
            }
        };
        if !row.value.in_hyperspace {
            return;
        }
        let Some(destination) = row.value.hyperspace_destination else {
            // Flag set without a destination: repair the row.
            warn!("ship {} in hyperspace with no destination, clearing", ship_id);
            let _ = self
                .gateway
                .ships
                .update(ship_id, |s| {
                    s.in_hyperspace = false;
                    s.hyperspace_eta = None;
                })
                .await;
            return;
        };

        let arrived = self
            .gateway
            .ships
            .update(ship_id, |s| {
                s.sector_id = Some(destination);
                s.in_hyperspace = false;
                s.hyperspace_destination = None;
                s.hyperspace_eta = None;
            })
            .await;
        let arrived = match arrived {
            Ok(row) => row.value,
            Err(err) => {
                error!("arrival of ship {} failed to commit: {}", ship_id, err);
                return;
            }
        };

        info!("ship {} arrived in sector {}", ship_id, destination);
        self.events.emit(
            EventScope::Sector(destination),
            GameEvent::HyperspaceArrived {
                ship_id,
                sector_id: destination,
            },
        );
        self.events.emit_ship_status(&arrived);

        // Arrival may drop the ship straight into a garrison fight.
        if let Some(pilot) = self.pilot_of(&arrived).await {
            if let Err(err) = self
                .combat
                .engage_garrison(&pilot, &arrived, destination)
                .await
            {
                error!(
                    "garrison engagement on arrival of ship {} failed: {}",
                    ship_id, err
                );
            }
        }
    }

    /// Recovery sweep: finalizes any transit whose eta is more than the
    /// grace period in the past (the arrival task died with its process).
    pub async fn recover_stuck_ships(&self, now: u64) -> Vec<ShipId> {
        let stuck = self
            .gateway
            .ships
            .filter(|s| {
                s.in_hyperspace
                    && s.hyperspace_eta
                        .is_some_and(|eta| eta + STUCK_SHIP_GRACE_MS <= now)
            })
            .await;

        let mut recovered = Vec::new();
        for row in stuck {
            let ship_id = row.value.ship_id;
            warn!(
                "ship {} stuck in hyperspace past eta {:?}, finalizing",
                ship_id, row.value.hyperspace_eta
            );
            self.finalize_arrival(ship_id).await;
            recovered.push(ship_id);
        }
        recovered
    }

    /// The character piloting this ship, resolved through ownership.
    async fn pilot_of(&self, ship: &ShipState) -> Option<CharacterState> {
        match ship.owner {
            Owner::Character(id) => self
                .gateway
                .characters
                .load(id)
                .await
                .ok()
                .map(|row| row.value),
            Owner::Corporation(_) => self
                .gateway
                .characters
                .filter(|c| c.ship_id == ship.ship_id)
                .await
                .into_iter()
                .map(|row| row.value)
                .next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::StaticMap;
    use shared::entities::GarrisonState;

    const ORIGIN: SectorId = 1;
    const DEST: SectorId = 2;

    fn ship() -> ShipState {
        ShipState {
            ship_id: 20,
            owner: Owner::Character(5),
            sector_id: Some(ORIGIN),
            credits: 1_000,
            cargo: [0; 3],
            cargo_capacity: 40,
            fighters: 10,
            shields: 5,
            is_escape_pod: false,
            warp_power: 9,
            warp_power_capacity: 12,
            warp_cost: 3,
            in_hyperspace: false,
            hyperspace_destination: None,
            hyperspace_eta: None,
        }
    }

    async fn world(transit_ms: u64) -> (Arc<MovementEngine>, Arc<Gateway>) {
        let gateway = Arc::new(Gateway::new());
        gateway.ships.insert(20, ship()).await;
        gateway
            .characters
            .insert(
                5,
                CharacterState {
                    character_id: 5,
                    corporation: None,
                    ship_id: 20,
                },
            )
            .await;

        let mut map = StaticMap::new();
        map.link(ORIGIN, DEST);
        let map: Arc<dyn SectorMap> = Arc::new(map);

        let (events, _rx) = EventBus::new();
        let combat = Arc::new(CombatEngine::new(
            Arc::clone(&gateway),
            events.clone(),
            Arc::clone(&map),
            30_000,
        ));
        let engine = Arc::new(MovementEngine::new(
            Arc::clone(&gateway),
            events,
            map,
            combat,
            transit_ms,
        ));
        (engine, gateway)
    }

    #[tokio::test]
    async fn test_depart_flips_ship_into_hyperspace() {
        let (engine, gateway) = world(10_000).await;

        let receipt = engine.submit_move(5, DEST).await.unwrap();
        assert_eq!(receipt.origin, ORIGIN);
        assert_eq!(receipt.destination, DEST);

        let ship = gateway.ships.load(20).await.unwrap().value;
        assert!(ship.in_hyperspace);
        assert_eq!(ship.sector_id, None);
        assert_eq!(ship.hyperspace_destination, Some(DEST));
        assert_eq!(ship.hyperspace_eta, Some(receipt.eta));
        assert_eq!(ship.warp_power, 6);
        assert!(ship.hyperspace_fields_consistent());
    }

    #[tokio::test]
    async fn test_second_move_conflicts_and_keeps_destination() {
        let (engine, gateway) = world(10_000).await;
        engine.submit_move(5, DEST).await.unwrap();

        let err = engine.submit_move(5, DEST).await.unwrap_err();
        assert!(matches!(err, GameError::Conflict { .. }));

        let ship = gateway.ships.load(20).await.unwrap().value;
        assert_eq!(ship.hyperspace_destination, Some(DEST));
        assert_eq!(ship.warp_power, 6);
    }

    #[tokio::test]
    async fn test_non_adjacent_destination_rejected() {
        let (engine, _gateway) = world(10_000).await;
        let err = engine.submit_move(5, 42).await.unwrap_err();
        assert!(matches!(err, GameError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_warp_power_rejected() {
        let (engine, gateway) = world(10_000).await;
        gateway
            .ships
            .update(20, |s| s.warp_power = 2)
            .await
            .unwrap();

        let err = engine.submit_move(5, DEST).await.unwrap_err();
        assert_eq!(err, GameError::insufficient(Resource::WarpPower, 3, 2));
    }

    #[tokio::test]
    async fn test_active_combat_blocks_departure() {
        let (engine, gateway) = world(10_000).await;
        let mut enc = shared::entities::CombatEncounter::new(3, ORIGIN);
        enc.participants.insert(
            shared::entities::CombatantId::Character(5),
            shared::entities::CombatantState::character(5, 10, 0),
        );
        gateway.encounters.insert(3, enc).await;

        let err = engine.submit_move(5, DEST).await.unwrap_err();
        assert!(matches!(err, GameError::WrongState { .. }));
    }

    #[tokio::test]
    async fn test_arrival_finalizes_ship() {
        let (engine, gateway) = world(1).await;
        engine.submit_move(5, DEST).await.unwrap();

        // warp_cost 3 * 1ms transit: give the arrival task time to run.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ship = gateway.ships.load(20).await.unwrap().value;
        assert!(!ship.in_hyperspace);
        assert_eq!(ship.sector_id, Some(DEST));
        assert_eq!(ship.hyperspace_destination, None);
        assert_eq!(ship.hyperspace_eta, None);
        assert!(ship.hyperspace_fields_consistent());
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let (engine, gateway) = world(1).await;
        engine.submit_move(5, DEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let before = gateway.ships.load(20).await.unwrap();
        engine.finalize_arrival(20).await;
        let after = gateway.ships.load(20).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_arrival_engages_garrison() {
        let (engine, gateway) = world(1).await;
        gateway
            .garrisons
            .insert(
                4,
                GarrisonState {
                    garrison_id: 4,
                    sector_id: DEST,
                    owner: Owner::Character(99),
                    fighters: 25,
                    toll: 0,
                    toll_balance: 0,
                },
            )
            .await;

        engine.submit_move(5, DEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let encounters = gateway.encounters.filter(|_| true).await;
        assert_eq!(encounters.len(), 1);
        let enc = &encounters[0].value;
        assert_eq!(enc.sector_id, DEST);
        assert!(enc
            .participants
            .contains_key(&shared::entities::CombatantId::Character(5)));
        assert!(enc
            .participants
            .contains_key(&shared::entities::CombatantId::Garrison(4)));
    }

    #[tokio::test]
    async fn test_recovery_finalizes_stuck_ship() {
        let (engine, gateway) = world(10_000).await;
        // A transit whose arrival task never ran.
        gateway
            .ships
            .update(20, |s| {
                s.in_hyperspace = true;
                s.sector_id = None;
                s.hyperspace_destination = Some(DEST);
                s.hyperspace_eta = Some(1_000);
            })
            .await
            .unwrap();

        let recovered = engine.recover_stuck_ships(now_ms()).await;
        assert_eq!(recovered, vec![20]);

        let ship = gateway.ships.load(20).await.unwrap().value;
        assert!(!ship.in_hyperspace);
        assert_eq!(ship.sector_id, Some(DEST));
    }

    #[tokio::test]
    async fn test_recovery_leaves_fresh_transits_alone() {
        let (engine, gateway) = world(60_000).await;
        engine.submit_move(5, DEST).await.unwrap();

        let recovered = engine.recover_stuck_ships(now_ms()).await;
        assert!(recovered.is_empty());

        let ship = gateway.ships.load(20).await.unwrap().value;
        assert!(ship.in_hyperspace);
    }
}
