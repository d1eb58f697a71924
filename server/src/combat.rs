//! Combat resolution engine.
//!
//! One encounter row is the shared state of a multi-party turn-based fight.
//! Submissions are read-modify-write against a fresh snapshot and committed
//! with compare-and-swap on the row version, so two near-simultaneous
//! submissions serialize and the loser sees a conflict. A round resolves
//! when every obligated combatant has acted or the deadline passes; the
//! resolution itself is a pure transform from one encounter snapshot to the
//! next, never an in-place mutation.

use crate::events::EventBus;
use crate::gateway::{Gateway, GatewayError};
use crate::map::SectorMap;
use crate::util::now_ms;
use log::{error, info, warn};
use shared::entities::{
    CharacterId, CharacterState, CombatAction, CombatEncounter, CombatId, CombatantId,
    CombatantState, GarrisonId, Owner, RoundActionState, SectorId, ShipId, ShipState,
    TollEntry, TollPayment,
};
use shared::protocol::ActionRequest;
use shared::{
    EventScope, GameError, GameEvent, ParticipantOutcome, Resource, RoundOutcome,
    SubmitOutcome, ATTACKER_ATTRITION, BRACE_MITIGATION, COMBAT_ODDS,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A toll already debited from the payer, awaiting the encounter commit.
#[derive(Debug, Clone)]
struct CollectedToll {
    garrison: GarrisonId,
    payment: TollPayment,
}

pub struct CombatEngine {
    gateway: Arc<Gateway>,
    events: EventBus,
    map: Arc<dyn SectorMap>,
    round_deadline_ms: u64,
}

impl CombatEngine {
    pub fn new(
        gateway: Arc<Gateway>,
        events: EventBus,
        map: Arc<dyn SectorMap>,
        round_deadline_ms: u64,
    ) -> Self {
        CombatEngine {
            gateway,
            events,
            map,
            round_deadline_ms,
        }
    }

    /// Returns the un-ended encounter in `sector` this character is an
    /// active participant of, if any. Movement consults this before
    /// letting a ship depart.
    pub async fn active_encounter_for(
        &self,
        character_id: CharacterId,
        sector: SectorId,
    ) -> Option<CombatId> {
        let id = CombatantId::Character(character_id);
        self.gateway
            .encounters
            .filter(|enc| {
                !enc.ended
                    && enc.sector_id == sector
                    && enc.participant(id).is_some_and(|c| c.is_active())
            })
            .await
            .into_iter()
            .map(|row| row.value.combat_id)
            .next()
    }

    /// Encounter-creation path for arrivals: a hostile garrison with
    /// fighters engages the incoming ship. Returns the new encounter id,
    /// or None when the sector holds nothing hostile (or the pilot is
    /// already engaged there).
    pub async fn engage_garrison(
        &self,
        pilot: &CharacterState,
        ship: &ShipState,
        sector: SectorId,
    ) -> Result<Option<CombatId>, GameError> {
        if self
            .active_encounter_for(pilot.character_id, sector)
            .await
            .is_some()
        {
            return Ok(None);
        }

        let hostiles = self
            .gateway
            .garrisons
            .filter(|g| {
                g.sector_id == sector && g.fighters > 0 && !owned_by(g.owner, pilot)
            })
            .await;
        if hostiles.is_empty() {
            return Ok(None);
        }

        let combat_id = self.gateway.allocate_combat_id();
        let mut encounter = CombatEncounter::new(combat_id, sector);
        encounter.deadline = Some(now_ms() + self.round_deadline_ms);

        let mut pilot_state =
            CombatantState::character(pilot.character_id, ship.fighters, ship.shields);
        pilot_state.is_escape_pod = ship.is_escape_pod;
        encounter.participants.insert(pilot_state.id, pilot_state);

        for garrison in &hostiles {
            let g = &garrison.value;
            encounter.participants.insert(
                CombatantId::Garrison(g.garrison_id),
                CombatantState::garrison(g.garrison_id, g.fighters),
            );
            if g.toll > 0 {
                encounter.tolls.entries.insert(
                    g.garrison_id,
                    TollEntry {
                        amount: g.toll,
                        paid: false,
                        balance: 0,
                        payments: Vec::new(),
                    },
                );
            }
        }

        let participants: Vec<CombatantId> = encounter.participants.keys().copied().collect();
        self.gateway.encounters.insert(combat_id, encounter).await;
        info!(
            "combat {} started in sector {} with {} participants",
            combat_id,
            sector,
            participants.len()
        );
        self.events.emit(
            EventScope::Sector(sector),
            GameEvent::CombatStarted {
                combat_id,
                sector_id: sector,
                participants,
            },
        );
        Ok(Some(combat_id))
    }

    /// Files one combatant's action for the current round, resolving the
    /// round synchronously when it becomes ready or its deadline has
    /// already passed.
    pub async fn submit_action(
        &self,
        combat_id: CombatId,
        combatant_id: CombatantId,
        request: ActionRequest,
        round_hint: Option<u32>,
    ) -> Result<SubmitOutcome, GameError> {
        let now = now_ms();
        let row = self.gateway.encounters.load(combat_id).await?;
        let encounter = &row.value;

        if encounter.ended {
            return Err(GameError::wrong_state(format!(
                "combat {} has ended",
                combat_id
            )));
        }
        if let Some(hint) = round_hint {
            if hint != encounter.round {
                return Err(GameError::conflict(format!(
                    "round {} is stale, combat {} is on round {}",
                    hint, combat_id, encounter.round
                )));
            }
        }

        let character_id = match combatant_id {
            CombatantId::Character(id) => id,
            CombatantId::Garrison(_) => {
                return Err(GameError::invalid("garrisons do not submit actions"))
            }
        };
        let combatant = encounter
            .participant(combatant_id)
            .ok_or_else(|| GameError::invalid("combatant is not part of this encounter"))?;
        if !combatant.is_active() {
            return Err(GameError::wrong_state(
                "combatant already destroyed or gone",
            ));
        }
        if encounter.pending.contains_key(&combatant_id) {
            return Err(GameError::conflict(format!(
                "action already submitted for round {}",
                encounter.round
            )));
        }

        // Validate the wire request into a concrete action. Toll payments
        // resolve immediately and carry their own persistence.
        let (action, payment) = match request {
            ActionRequest::Attack { target, commit } => {
                if combatant.fighters == 0 {
                    return Err(GameError::insufficient(Resource::Fighters, 1, 0));
                }
                if target == combatant_id {
                    return Err(GameError::invalid("cannot attack yourself"));
                }
                if encounter.participant(target).is_none() {
                    return Err(GameError::invalid("target is not part of this encounter"));
                }
                // An omitted commit defaults to the minimum; an explicit
                // zero is the caller's mistake and is rejected.
                let commit = match commit {
                    None => 1,
                    Some(0) => {
                        return Err(GameError::invalid("commit must be positive"))
                    }
                    Some(n) => n,
                };
                let commit = commit.min(combatant.fighters).max(1);
                (CombatAction::Attack { target, commit }, None)
            }
            ActionRequest::Brace => (CombatAction::Brace, None),
            ActionRequest::Flee { destination } => {
                if combatant.is_escape_pod {
                    return Err(GameError::invalid("escape pods cannot flee"));
                }
                if !self.map.are_adjacent(encounter.sector_id, destination) {
                    return Err(GameError::invalid(format!(
                        "sector {} is not adjacent to sector {}",
                        destination, encounter.sector_id
                    )));
                }
                (CombatAction::Flee { destination }, None)
            }
            ActionRequest::Pay { target } => {
                let garrison_id =
                    encounter.tolls.resolve_target(target).ok_or_else(|| {
                        GameError::wrong_state("no toll available in this encounter")
                    })?;
                let amount = encounter.tolls.entries[&garrison_id].amount;
                let collected = self
                    .collect_toll(character_id, garrison_id, amount)
                    .await?;
                (
                    CombatAction::Pay {
                        garrison: garrison_id,
                        amount,
                    },
                    Some(collected),
                )
            }
        };

        let mut next = encounter.clone();
        next.pending.insert(
            combatant_id,
            RoundActionState {
                action,
                submitted_at: now,
                timed_out: false,
            },
        );
        if next.deadline.is_none() {
            next.deadline = Some(now + self.round_deadline_ms);
        }
        if let Some(collected) = &payment {
            apply_payment(&mut next, combatant_id, collected);
        }

        let submitted_round = next.round;
        let should_resolve = next.is_ready() || next.deadline_elapsed(now);
        let resolved = if should_resolve {
            Some(resolve_round(&next, now, self.round_deadline_ms))
        } else {
            None
        };
        let to_commit = resolved
            .as_ref()
            .map(|(enc, _)| enc.clone())
            .unwrap_or_else(|| next.clone());

        match self
            .gateway
            .encounters
            .update_if_version(combat_id, row.version, to_commit)
            .await
        {
            Ok(_) => {}
            Err(err) => {
                if let Some(collected) = &payment {
                    self.refund_toll(character_id, collected).await;
                }
                return Err(match err {
                    GatewayError::NoMatch { .. } => GameError::conflict(format!(
                        "combat {} changed during submission",
                        combat_id
                    )),
                    other => other.into(),
                });
            }
        }

        self.events.emit(
            EventScope::Character(character_id),
            GameEvent::ActionAccepted {
                combat_id,
                round: submitted_round,
                combatant: combatant_id,
            },
        );
        if let Some(collected) = &payment {
            self.events.emit(
                EventScope::Sector(encounter.sector_id),
                GameEvent::TollPaid {
                    combat_id,
                    garrison: collected.garrison,
                    payer: character_id,
                    amount: collected.payment.amount,
                },
            );
        }

        let outcome = match resolved {
            Some((resolved_enc, outcome)) => {
                self.finish_resolution(&resolved_enc, &outcome).await;
                Some(outcome)
            }
            None => {
                let waiting_on: Vec<CombatantId> = next
                    .obligated()
                    .filter(|c| !next.pending.contains_key(&c.id))
                    .map(|c| c.id)
                    .collect();
                self.events.emit(
                    EventScope::Sector(encounter.sector_id),
                    GameEvent::RoundWaiting {
                        combat_id,
                        round: submitted_round,
                        waiting_on,
                    },
                );
                None
            }
        };

        Ok(SubmitOutcome {
            combat_id,
            round: submitted_round,
            resolved: outcome,
        })
    }

    /// Force-resolves every encounter whose deadline has elapsed. Driven by
    /// the periodic sweeper so rounds conclude even when nobody submits.
    pub async fn force_resolve_due(&self, now: u64) -> Vec<CombatId> {
        let due = self
            .gateway
            .encounters
            .filter(|enc| !enc.ended && enc.deadline_elapsed(now))
            .await;

        let mut resolved_ids = Vec::new();
        for row in due {
            let combat_id = row.value.combat_id;
            let (resolved, outcome) = resolve_round(&row.value, now, self.round_deadline_ms);
            match self
                .gateway
                .encounters
                .update_if_version(combat_id, row.version, resolved.clone())
                .await
            {
                Ok(_) => {
                    info!(
                        "combat {} round {} force-resolved at deadline",
                        combat_id, outcome.round
                    );
                    self.finish_resolution(&resolved, &outcome).await;
                    resolved_ids.push(combat_id);
                }
                Err(GatewayError::NoMatch { .. }) => {
                    // A submission beat the sweeper to it; nothing to do.
                }
                Err(err) => error!("force-resolve of combat {} failed: {}", combat_id, err),
            }
        }
        resolved_ids
    }

    /// Debits the payer's ship and persists the garrison's toll balance.
    /// Both failure modes reject the whole submission.
    async fn collect_toll(
        &self,
        payer: CharacterId,
        garrison_id: GarrisonId,
        amount: u64,
    ) -> Result<CollectedToll, GameError> {
        let collected = CollectedToll {
            garrison: garrison_id,
            payment: TollPayment {
                payer,
                amount,
                paid_at: now_ms(),
            },
        };
        if amount == 0 {
            return Ok(collected);
        }

        let character = self.gateway.characters.load(payer).await?;
        let ship_id = character.value.ship_id;
        let ship = self.gateway.ships.load(ship_id).await?;
        if ship.value.credits < amount {
            return Err(GameError::insufficient(
                Resource::Credits,
                amount,
                ship.value.credits,
            ));
        }

        let debited = self
            .gateway
            .ships
            .update_if(
                ship_id,
                |s| s.credits >= amount,
                |s| s.credits -= amount,
            )
            .await
            .map_err(|err| match err {
                GatewayError::NoMatch { .. } => {
                    GameError::insufficient(Resource::Credits, amount, 0)
                }
                other => other.into(),
            })?;

        if let Err(err) = self
            .gateway
            .garrisons
            .update(garrison_id, |g| g.toll_balance += amount)
            .await
        {
            // The debit committed but the garrison row is gone; refund.
            error!(
                "garrison {} vanished during toll payment: {}; refunding",
                garrison_id, err
            );
            self.refund_ship(ship_id, amount).await;
            return Err(GameError::wrong_state("no toll available in this encounter"));
        }

        self.events.emit_ship_status(&debited.value);
        Ok(collected)
    }

    /// Best-effort compensation when the encounter commit loses the race
    /// after a toll was collected.
    async fn refund_toll(&self, payer: CharacterId, collected: &CollectedToll) {
        let amount = collected.payment.amount;
        if amount == 0 {
            return;
        }
        warn!(
            "compensating toll payment of {} by character {}",
            amount, payer
        );
        if let Ok(character) = self.gateway.characters.load(payer).await {
            self.refund_ship(character.value.ship_id, amount).await;
        }
        if let Err(err) = self
            .gateway
            .garrisons
            .update(collected.garrison, |g| {
                g.toll_balance = g.toll_balance.saturating_sub(amount);
            })
            .await
        {
            error!("toll balance compensation failed: {}", err);
        }
    }

    async fn refund_ship(&self, ship_id: ShipId, amount: u64) {
        match self
            .gateway
            .ships
            .update(ship_id, |s| s.credits += amount)
            .await
        {
            Ok(row) => self.events.emit_ship_status(&row.value),
            Err(err) => error!("credit refund to ship {} failed: {}", ship_id, err),
        }
    }

    /// Post-commit side effects of a resolved round: relocate fleers, sync
    /// survivors' rows when the encounter ends, and emit the outcome.
    async fn finish_resolution(&self, encounter: &CombatEncounter, outcome: &RoundOutcome) {
        for (id, participant_outcome) in &outcome.participants {
            if let (CombatantId::Character(character_id), Some(destination)) =
                (id, participant_outcome.fled_to)
            {
                self.relocate_fled_ship(*character_id, destination).await;
            }
        }

        if outcome.ended {
            self.sync_rows_on_end(encounter).await;
            self.events.emit(
                EventScope::Sector(encounter.sector_id),
                GameEvent::CombatEnded {
                    combat_id: encounter.combat_id,
                    round: outcome.round,
                },
            );
        } else {
            self.events.emit(
                EventScope::Sector(encounter.sector_id),
                GameEvent::RoundResolved {
                    combat_id: encounter.combat_id,
                    outcome: outcome.clone(),
                },
            );
        }
    }

    async fn relocate_fled_ship(&self, character_id: CharacterId, destination: SectorId) {
        let ship_id = match self.gateway.characters.load(character_id).await {
            Ok(character) => character.value.ship_id,
            Err(err) => {
                error!("fled character {} has no row: {}", character_id, err);
                return;
            }
        };
        match self
            .gateway
            .ships
            .update_if(
                ship_id,
                |s| !s.in_hyperspace,
                |s| s.sector_id = Some(destination),
            )
            .await
        {
            Ok(ship) => {
                info!(
                    "ship {} fled combat to sector {}",
                    ship_id, destination
                );
                self.events.emit_ship_status(&ship.value);
            }
            Err(err) => error!("relocating fled ship {} failed: {}", ship_id, err),
        }
    }

    /// When a fight ends, write surviving fighter/shield counts back to the
    /// ship and garrison rows. Best-effort: the encounter row already holds
    /// the authoritative record.
    async fn sync_rows_on_end(&self, encounter: &CombatEncounter) {
        for combatant in encounter.participants.values() {
            match combatant.id {
                CombatantId::Character(character_id) => {
                    let Ok(character) = self.gateway.characters.load(character_id).await
                    else {
                        continue;
                    };
                    let result = self
                        .gateway
                        .ships
                        .update(character.value.ship_id, |s| {
                            s.fighters = combatant.fighters;
                            s.shields = combatant.shields;
                        })
                        .await;
                    match result {
                        Ok(row) => self.events.emit_ship_status(&row.value),
                        Err(err) => warn!(
                            "post-combat sync of ship {} failed: {}",
                            character.value.ship_id, err
                        ),
                    }
                }
                CombatantId::Garrison(garrison_id) => {
                    let result = self
                        .gateway
                        .garrisons
                        .update(garrison_id, |g| g.fighters = combatant.fighters)
                        .await;
                    if let Err(err) = result {
                        warn!("post-combat sync of garrison {} failed: {}", garrison_id, err);
                    }
                }
            }
        }
    }
}

fn owned_by(owner: Owner, character: &CharacterState) -> bool {
    match owner {
        Owner::Character(id) => id == character.character_id,
        Owner::Corporation(id) => character.corporation == Some(id),
    }
}

/// Records a completed toll payment in the encounter snapshot and walks the
/// payer out of the fight.
fn apply_payment(encounter: &mut CombatEncounter, payer: CombatantId, collected: &CollectedToll) {
    if let Some(entry) = encounter.tolls.entries.get_mut(&collected.garrison) {
        entry.paid = true;
        entry.balance += collected.payment.amount;
        entry.payments.push(collected.payment.clone());
    }
    if let Some(combatant) = encounter.participants.get_mut(&payer) {
        combatant.exited = true;
    }
}

/// Applies every pending action of the current round and returns the next
/// encounter snapshot plus the outcome report. Pure and deterministic:
/// participants are walked in key order and no randomness is involved.
pub fn resolve_round(
    encounter: &CombatEncounter,
    now: u64,
    next_deadline_ms: u64,
) -> (CombatEncounter, RoundOutcome) {
    let mut next = encounter.clone();
    let mut outcomes: std::collections::BTreeMap<CombatantId, ParticipantOutcome> = next
        .participants
        .keys()
        .map(|id| (*id, ParticipantOutcome::default()))
        .collect();

    // A no-show braces by default.
    let obligated: Vec<CombatantId> = next.obligated().map(|c| c.id).collect();
    for id in obligated {
        if !next.pending.contains_key(&id) {
            next.pending.insert(
                id,
                RoundActionState {
                    action: CombatAction::Brace,
                    submitted_at: now,
                    timed_out: true,
                },
            );
            if let Some(outcome) = outcomes.get_mut(&id) {
                outcome.timed_out = true;
            }
        }
    }

    let actions: Vec<(CombatantId, RoundActionState)> = next
        .pending
        .iter()
        .map(|(id, state)| (*id, state.clone()))
        .collect();

    let attacked: BTreeSet<CombatantId> = actions
        .iter()
        .filter_map(|(_, state)| match state.action {
            CombatAction::Attack { target, .. } => Some(target),
            _ => None,
        })
        .collect();
    let bracing: BTreeSet<CombatantId> = actions
        .iter()
        .filter_map(|(id, state)| matches!(state.action, CombatAction::Brace).then_some(*id))
        .collect();

    // Flee first: an untargeted fleer leaves before any fire is exchanged;
    // a targeted one is intercepted and stays for the round.
    for (id, state) in &actions {
        if let CombatAction::Flee { destination } = state.action {
            if !attacked.contains(id) {
                if let Some(combatant) = next.participants.get_mut(id) {
                    combatant.exited = true;
                }
                if let Some(outcome) = outcomes.get_mut(id) {
                    outcome.fled_to = Some(destination);
                }
            }
        }
    }

    for (id, state) in &actions {
        let CombatAction::Attack { target, commit } = state.action else {
            continue;
        };

        // Earlier attacks this round may already have thinned the attacker.
        let attacker_fighters = next
            .participants
            .get(id)
            .map(|c| if c.destroyed { 0 } else { c.fighters })
            .unwrap_or(0);
        let commit = commit.min(attacker_fighters);
        if commit == 0 {
            continue;
        }
        let target_alive = next
            .participants
            .get(&target)
            .is_some_and(|c| c.is_active());
        if !target_alive {
            continue;
        }

        let mut hits = (f64::from(commit) * COMBAT_ODDS).round() as u32;
        if bracing.contains(&target) {
            hits = (f64::from(hits) * BRACE_MITIGATION).floor() as u32;
        }

        if let Some(victim) = next.participants.get_mut(&target) {
            let shield_loss = victim.shields.min(hits);
            let fighter_loss = victim.fighters.min(hits - shield_loss);
            victim.shields -= shield_loss;
            victim.fighters -= fighter_loss;
            if fighter_loss > 0 && victim.fighters == 0 {
                victim.destroyed = true;
            }
            let destroyed = victim.destroyed;
            if let Some(outcome) = outcomes.get_mut(&target) {
                outcome.shields_lost += shield_loss;
                outcome.fighters_lost += fighter_loss;
                outcome.destroyed = destroyed;
            }
        }

        let attrition = (f64::from(commit) * ATTACKER_ATTRITION).floor() as u32;
        if let Some(attacker) = next.participants.get_mut(id) {
            let loss = attacker.fighters.min(attrition);
            attacker.fighters -= loss;
            if loss > 0 && attacker.fighters == 0 {
                attacker.destroyed = true;
            }
            let destroyed = attacker.destroyed;
            if let Some(outcome) = outcomes.get_mut(id) {
                outcome.hits_dealt += hits;
                outcome.fighters_lost += loss;
                outcome.destroyed = destroyed;
            }
        }
    }

    for (id, combatant) in &next.participants {
        if let Some(outcome) = outcomes.get_mut(id) {
            outcome.fighters_remaining = combatant.fighters;
            outcome.shields_remaining = combatant.shields;
        }
    }

    let resolved_round = next.round;
    next.round += 1;
    next.pending.clear();
    next.ended = next.is_over();
    next.deadline = if next.ended {
        None
    } else {
        Some(now + next_deadline_ms)
    };

    let outcome = RoundOutcome {
        round: resolved_round,
        ended: next.ended,
        participants: outcomes,
    };
    (next, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEnvelope;
    use crate::map::StaticMap;
    use shared::entities::GarrisonState;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SECTOR: SectorId = 100;
    const NEIGHBOR: SectorId = 101;

    fn ship(ship_id: ShipId, owner_char: CharacterId) -> ShipState {
        ShipState {
            ship_id,
            owner: Owner::Character(owner_char),
            sector_id: Some(SECTOR),
            credits: 5_000,
            cargo: [0; 3],
            cargo_capacity: 40,
            fighters: 50,
            shields: 20,
            is_escape_pod: false,
            warp_power: 30,
            warp_power_capacity: 40,
            warp_cost: 3,
            in_hyperspace: false,
            hyperspace_destination: None,
            hyperspace_eta: None,
        }
    }

    fn character(character_id: CharacterId, ship_id: ShipId) -> CharacterState {
        CharacterState {
            character_id,
            corporation: None,
            ship_id,
        }
    }

    fn duel_encounter(combat_id: CombatId) -> CombatEncounter {
        let mut enc = CombatEncounter::new(combat_id, SECTOR);
        enc.deadline = Some(now_ms() + 60_000);
        enc.participants.insert(
            CombatantId::Character(1),
            CombatantState::character(1, 50, 20),
        );
        enc.participants.insert(
            CombatantId::Character(2),
            CombatantState::character(2, 30, 10),
        );
        enc
    }

    async fn world() -> (CombatEngine, Arc<Gateway>, UnboundedReceiver<EventEnvelope>) {
        let gateway = Arc::new(Gateway::new());
        gateway.ships.insert(11, ship(11, 1)).await;
        gateway.ships.insert(12, ship(12, 2)).await;
        gateway.characters.insert(1, character(1, 11)).await;
        gateway.characters.insert(2, character(2, 12)).await;

        let mut map = StaticMap::new();
        map.link(SECTOR, NEIGHBOR);
        map.link(SECTOR, 102);

        let (events, rx) = EventBus::new();
        let engine = CombatEngine::new(
            Arc::clone(&gateway),
            events,
            Arc::new(map),
            30_000,
        );
        (engine, gateway, rx)
    }

    fn brace_state(timed_out: bool) -> RoundActionState {
        RoundActionState {
            action: CombatAction::Brace,
            submitted_at: 0,
            timed_out,
        }
    }

    mod resolution {
        use super::*;

        #[test]
        fn test_no_shows_brace_by_default() {
            let enc = duel_encounter(1);
            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);

            assert_eq!(next.round, 2);
            assert!(next.pending.is_empty());
            for id in [CombatantId::Character(1), CombatantId::Character(2)] {
                assert!(outcome.participants[&id].timed_out);
                assert_eq!(outcome.participants[&id].fighters_lost, 0);
            }
            assert!(!next.ended);
            assert_eq!(next.deadline, Some(31_000));
        }

        #[test]
        fn test_attack_drains_shields_before_fighters() {
            let mut enc = duel_encounter(1);
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Attack {
                        target: CombatantId::Character(2),
                        commit: 10,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );
            enc.pending
                .insert(CombatantId::Character(2), brace_state(false));

            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);

            // 10 committed * 0.6 odds = 6 hits, halved to 3 by the brace.
            let victim = &outcome.participants[&CombatantId::Character(2)];
            assert_eq!(victim.shields_lost, 3);
            assert_eq!(victim.fighters_lost, 0);
            assert_eq!(next.participants[&CombatantId::Character(2)].shields, 7);
            assert_eq!(next.participants[&CombatantId::Character(2)].fighters, 30);

            // Attacker pays attrition: floor(10 * 0.25) = 2.
            let attacker = &outcome.participants[&CombatantId::Character(1)];
            assert_eq!(attacker.hits_dealt, 3);
            assert_eq!(attacker.fighters_lost, 2);
            assert_eq!(next.participants[&CombatantId::Character(1)].fighters, 48);
        }

        #[test]
        fn test_synthesized_brace_still_mitigates() {
            let mut enc = duel_encounter(1);
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Attack {
                        target: CombatantId::Character(2),
                        commit: 30,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );

            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);

            // 30 * 0.6 = 18 hits, halved to 9 because the no-show's
            // synthesized brace counts as bracing.
            let victim = &outcome.participants[&CombatantId::Character(2)];
            assert!(victim.timed_out);
            assert_eq!(victim.shields_lost + victim.fighters_lost, 9);
            assert_eq!(next.participants[&CombatantId::Character(2)].shields, 1);
        }

        #[test]
        fn test_fighters_reaching_zero_marks_destroyed() {
            let mut enc = duel_encounter(1);
            enc.participants.insert(
                CombatantId::Character(2),
                CombatantState::character(2, 2, 0),
            );
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Attack {
                        target: CombatantId::Character(2),
                        commit: 50,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );
            enc.pending
                .insert(CombatantId::Character(2), brace_state(false));

            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);

            let victim = &next.participants[&CombatantId::Character(2)];
            assert_eq!(victim.fighters, 0);
            assert!(victim.destroyed);
            assert!(outcome.participants[&CombatantId::Character(2)].destroyed);
            // Last fighting combatant standing: the encounter is over.
            assert!(next.ended);
            assert!(outcome.ended);
            assert_eq!(next.deadline, None);
        }

        #[test]
        fn test_untargeted_fleer_escapes() {
            let mut enc = duel_encounter(1);
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Flee {
                        destination: NEIGHBOR,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );
            enc.pending
                .insert(CombatantId::Character(2), brace_state(false));

            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);

            assert!(next.participants[&CombatantId::Character(1)].exited);
            assert_eq!(
                outcome.participants[&CombatantId::Character(1)].fled_to,
                Some(NEIGHBOR)
            );
            // Fleer gone, one active combatant left.
            assert!(next.ended);
        }

        #[test]
        fn test_targeted_fleer_is_intercepted() {
            let mut enc = duel_encounter(1);
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Flee {
                        destination: NEIGHBOR,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );
            enc.pending.insert(
                CombatantId::Character(2),
                RoundActionState {
                    action: CombatAction::Attack {
                        target: CombatantId::Character(1),
                        commit: 10,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );

            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);

            let fleer = &next.participants[&CombatantId::Character(1)];
            assert!(!fleer.exited);
            assert_eq!(outcome.participants[&CombatantId::Character(1)].fled_to, None);
            // The intercepted fleer still takes the full 6 hits.
            assert_eq!(
                outcome.participants[&CombatantId::Character(1)].shields_lost,
                6
            );
            assert!(!next.ended);
        }

        #[test]
        fn test_round_increments_exactly_once() {
            let enc = duel_encounter(1);
            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);
            assert_eq!(outcome.round, 1);
            assert_eq!(next.round, 2);

            let (after, second) = resolve_round(&next, 2_000, 30_000);
            assert_eq!(second.round, 2);
            assert_eq!(after.round, 3);
        }

        #[test]
        fn test_pay_action_has_no_combat_effect() {
            let mut enc = duel_encounter(1);
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Pay {
                        garrison: 9,
                        amount: 250,
                    },
                    submitted_at: 0,
                    timed_out: false,
                },
            );
            enc.pending
                .insert(CombatantId::Character(2), brace_state(false));

            let (next, outcome) = resolve_round(&enc, 1_000, 30_000);
            assert_eq!(outcome.participants[&CombatantId::Character(2)].fighters_lost, 0);
            assert_eq!(next.participants[&CombatantId::Character(2)].shields, 10);
        }
    }

    mod submission {
        use super::*;

        #[tokio::test]
        async fn test_first_action_is_stored_not_resolved() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            let outcome = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Attack {
                        target: CombatantId::Character(2),
                        commit: Some(10),
                    },
                    Some(1),
                )
                .await
                .unwrap();

            assert_eq!(outcome.round, 1);
            assert!(outcome.resolved.is_none());

            let enc = gateway.encounters.load(7).await.unwrap().value;
            assert_eq!(enc.round, 1);
            assert!(enc.pending.contains_key(&CombatantId::Character(1)));
        }

        #[tokio::test]
        async fn test_last_action_triggers_synchronous_resolution() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Brace,
                    Some(1),
                )
                .await
                .unwrap();
            let outcome = engine
                .submit_action(
                    7,
                    CombatantId::Character(2),
                    ActionRequest::Attack {
                        target: CombatantId::Character(1),
                        commit: Some(10),
                    },
                    Some(1),
                )
                .await
                .unwrap();

            let resolved = outcome.resolved.expect("round should have resolved");
            assert_eq!(resolved.round, 1);

            let enc = gateway.encounters.load(7).await.unwrap().value;
            assert_eq!(enc.round, 2);
            assert!(enc.pending.is_empty());
        }

        #[tokio::test]
        async fn test_elapsed_deadline_resolves_on_any_submission() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            enc.deadline = Some(now_ms().saturating_sub(5_000));
            gateway.encounters.insert(7, enc).await;

            // Only one of two obligated combatants acts, but the deadline
            // is already past: resolution runs and braces the no-show.
            let outcome = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Brace,
                    Some(1),
                )
                .await
                .unwrap();

            let resolved = outcome.resolved.expect("deadline should force resolution");
            assert!(resolved.participants[&CombatantId::Character(2)].timed_out);
            assert!(!resolved.participants[&CombatantId::Character(1)].timed_out);
        }

        #[tokio::test]
        async fn test_stale_round_hint_rejected() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            enc.round = 3;
            gateway.encounters.insert(7, enc).await;

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Brace,
                    Some(2),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::Conflict { .. }));
        }

        #[tokio::test]
        async fn test_duplicate_submission_rejected() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            engine
                .submit_action(7, CombatantId::Character(1), ActionRequest::Brace, None)
                .await
                .unwrap();
            let err = engine
                .submit_action(7, CombatantId::Character(1), ActionRequest::Brace, None)
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::Conflict { .. }));
        }

        #[tokio::test]
        async fn test_ended_encounter_accepts_nothing() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            enc.ended = true;
            gateway.encounters.insert(7, enc).await;

            let err = engine
                .submit_action(7, CombatantId::Character(1), ActionRequest::Brace, None)
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::WrongState { .. }));
        }

        #[tokio::test]
        async fn test_unknown_encounter_not_found() {
            let (engine, _gateway, _rx) = world().await;
            let err = engine
                .submit_action(99, CombatantId::Character(1), ActionRequest::Brace, None)
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::NotFound { .. }));
        }

        #[tokio::test]
        async fn test_garrison_cannot_submit() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            let err = engine
                .submit_action(7, CombatantId::Garrison(9), ActionRequest::Brace, None)
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::InvalidInput { .. }));
        }

        #[tokio::test]
        async fn test_attack_requires_fighters() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            enc.participants.insert(
                CombatantId::Character(1),
                CombatantState::character(1, 0, 20),
            );
            gateway.encounters.insert(7, enc).await;

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Attack {
                        target: CombatantId::Character(2),
                        commit: Some(5),
                    },
                    None,
                )
                .await
                .unwrap_err();
            assert_eq!(err, GameError::insufficient(Resource::Fighters, 1, 0));
        }

        #[tokio::test]
        async fn test_explicit_zero_commit_rejected_omitted_defaults() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Attack {
                        target: CombatantId::Character(2),
                        commit: Some(0),
                    },
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::InvalidInput { .. }));

            // Omitted commit is coerced to the minimum of one fighter.
            engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Attack {
                        target: CombatantId::Character(2),
                        commit: None,
                    },
                    None,
                )
                .await
                .unwrap();
            let enc = gateway.encounters.load(7).await.unwrap().value;
            let action = &enc.pending[&CombatantId::Character(1)].action;
            assert_eq!(
                *action,
                CombatAction::Attack {
                    target: CombatantId::Character(2),
                    commit: 1
                }
            );
        }

        #[tokio::test]
        async fn test_commit_clamped_to_fighter_count() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            engine
                .submit_action(
                    7,
                    CombatantId::Character(2),
                    ActionRequest::Attack {
                        target: CombatantId::Character(1),
                        commit: Some(500),
                    },
                    None,
                )
                .await
                .unwrap();

            let enc = gateway.encounters.load(7).await.unwrap().value;
            let action = &enc.pending[&CombatantId::Character(2)].action;
            assert_eq!(
                *action,
                CombatAction::Attack {
                    target: CombatantId::Character(1),
                    commit: 30
                }
            );
        }

        #[tokio::test]
        async fn test_attack_needs_valid_other_target() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            let self_target = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Attack {
                        target: CombatantId::Character(1),
                        commit: Some(5),
                    },
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(self_target, GameError::InvalidInput { .. }));

            let stranger = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Attack {
                        target: CombatantId::Character(42),
                        commit: Some(5),
                    },
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(stranger, GameError::InvalidInput { .. }));
        }

        #[tokio::test]
        async fn test_escape_pod_cannot_flee() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            let mut pod = CombatantState::character(1, 5, 0);
            pod.is_escape_pod = true;
            enc.participants.insert(CombatantId::Character(1), pod);
            gateway.encounters.insert(7, enc).await;

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Flee {
                        destination: NEIGHBOR,
                    },
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::InvalidInput { .. }));
        }

        #[tokio::test]
        async fn test_flee_requires_adjacent_destination() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Flee { destination: 999 },
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::InvalidInput { .. }));
        }
    }

    mod tolls {
        use super::*;

        async fn toll_world() -> (CombatEngine, Arc<Gateway>, UnboundedReceiver<EventEnvelope>)
        {
            let (engine, gateway, rx) = world().await;
            gateway
                .garrisons
                .insert(
                    9,
                    GarrisonState {
                        garrison_id: 9,
                        sector_id: SECTOR,
                        owner: Owner::Character(99),
                        fighters: 40,
                        toll: 250,
                        toll_balance: 0,
                    },
                )
                .await;

            let mut enc = duel_encounter(7);
            enc.participants
                .insert(CombatantId::Garrison(9), CombatantState::garrison(9, 40));
            enc.tolls.entries.insert(
                9,
                TollEntry {
                    amount: 250,
                    paid: false,
                    balance: 0,
                    payments: Vec::new(),
                },
            );
            gateway.encounters.insert(7, enc).await;
            (engine, gateway, rx)
        }

        #[tokio::test]
        async fn test_payment_debits_and_exits() {
            let (engine, gateway, _rx) = toll_world().await;

            let outcome = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Pay { target: Some(9) },
                    Some(1),
                )
                .await
                .unwrap();
            assert_eq!(outcome.round, 1);

            let ship = gateway.ships.load(11).await.unwrap().value;
            assert_eq!(ship.credits, 5_000 - 250);

            let garrison = gateway.garrisons.load(9).await.unwrap().value;
            assert_eq!(garrison.toll_balance, 250);

            let enc = gateway.encounters.load(7).await.unwrap().value;
            let entry = &enc.tolls.entries[&9];
            assert!(entry.paid);
            assert_eq!(entry.balance, 250);
            assert_eq!(entry.payments.len(), 1);
            assert_eq!(entry.payments[0].payer, 1);
            assert!(enc.participants[&CombatantId::Character(1)].exited);
            // Payment still counts as this round's action.
            assert!(enc.pending.contains_key(&CombatantId::Character(1)));
        }

        #[tokio::test]
        async fn test_payment_counts_toward_readiness() {
            let (engine, _gateway, _rx) = toll_world().await;

            engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Pay { target: None },
                    None,
                )
                .await
                .unwrap();
            // The payer left; character 2 completing the round resolves it.
            let outcome = engine
                .submit_action(7, CombatantId::Character(2), ActionRequest::Brace, None)
                .await
                .unwrap();
            assert!(outcome.resolved.is_some());
        }

        #[tokio::test]
        async fn test_insufficient_funds_rejects_whole_submission() {
            let (engine, gateway, _rx) = toll_world().await;
            gateway
                .ships
                .update(11, |s| s.credits = 100)
                .await
                .unwrap();

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Pay { target: Some(9) },
                    None,
                )
                .await
                .unwrap_err();
            assert_eq!(err, GameError::insufficient(Resource::Credits, 250, 100));

            // Nothing committed anywhere.
            let enc = gateway.encounters.load(7).await.unwrap().value;
            assert!(!enc.tolls.entries[&9].paid);
            assert!(enc.pending.is_empty());
            assert_eq!(gateway.garrisons.load(9).await.unwrap().value.toll_balance, 0);
        }

        #[tokio::test]
        async fn test_pay_without_toll_rejected() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            let err = engine
                .submit_action(
                    7,
                    CombatantId::Character(1),
                    ActionRequest::Pay { target: None },
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::WrongState { .. }));
        }
    }

    mod engagement {
        use super::*;

        async fn garrisoned_world() -> (CombatEngine, Arc<Gateway>, UnboundedReceiver<EventEnvelope>)
        {
            let (engine, gateway, rx) = world().await;
            gateway
                .garrisons
                .insert(
                    9,
                    GarrisonState {
                        garrison_id: 9,
                        sector_id: SECTOR,
                        owner: Owner::Character(99),
                        fighters: 40,
                        toll: 250,
                        toll_balance: 0,
                    },
                )
                .await;
            (engine, gateway, rx)
        }

        #[tokio::test]
        async fn test_arrival_engages_hostile_garrison() {
            let (engine, gateway, _rx) = garrisoned_world().await;
            let pilot = character(1, 11);
            let ship = ship(11, 1);

            let combat_id = engine
                .engage_garrison(&pilot, &ship, SECTOR)
                .await
                .unwrap()
                .expect("hostile garrison should engage");

            let enc = gateway.encounters.load(combat_id).await.unwrap().value;
            assert_eq!(enc.round, 1);
            assert!(enc.deadline.is_some());
            assert_eq!(enc.participants.len(), 2);
            assert_eq!(
                enc.participants[&CombatantId::Character(1)].fighters,
                ship.fighters
            );
            assert_eq!(enc.tolls.entries[&9].amount, 250);
        }

        #[tokio::test]
        async fn test_own_garrison_does_not_engage() {
            let (engine, gateway, _rx) = garrisoned_world().await;
            gateway
                .garrisons
                .update(9, |g| g.owner = Owner::Character(1))
                .await
                .unwrap();

            let result = engine
                .engage_garrison(&character(1, 11), &ship(11, 1), SECTOR)
                .await
                .unwrap();
            assert_eq!(result, None);
        }

        #[tokio::test]
        async fn test_no_double_engagement() {
            let (engine, _gateway, _rx) = garrisoned_world().await;
            let pilot = character(1, 11);
            let arriving = ship(11, 1);

            let first = engine
                .engage_garrison(&pilot, &arriving, SECTOR)
                .await
                .unwrap();
            assert!(first.is_some());

            let second = engine
                .engage_garrison(&pilot, &arriving, SECTOR)
                .await
                .unwrap();
            assert_eq!(second, None);
        }

        #[tokio::test]
        async fn test_active_encounter_lookup() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;

            assert_eq!(engine.active_encounter_for(1, SECTOR).await, Some(7));
            assert_eq!(engine.active_encounter_for(1, NEIGHBOR).await, None);
            assert_eq!(engine.active_encounter_for(42, SECTOR).await, None);

            gateway
                .encounters
                .update(7, |enc| enc.ended = true)
                .await
                .unwrap();
            assert_eq!(engine.active_encounter_for(1, SECTOR).await, None);
        }
    }

    mod sweeper {
        use super::*;

        #[tokio::test]
        async fn test_force_resolve_past_deadline() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            enc.deadline = Some(1_000);
            gateway.encounters.insert(7, enc).await;

            let resolved = engine.force_resolve_due(now_ms()).await;
            assert_eq!(resolved, vec![7]);

            let enc = gateway.encounters.load(7).await.unwrap().value;
            assert_eq!(enc.round, 2);
            assert!(enc.pending.is_empty());
        }

        #[tokio::test]
        async fn test_sweeper_skips_future_deadlines_and_ended() {
            let (engine, gateway, _rx) = world().await;
            gateway.encounters.insert(7, duel_encounter(7)).await;
            let mut ended = duel_encounter(8);
            ended.ended = true;
            ended.deadline = Some(1_000);
            gateway.encounters.insert(8, ended).await;

            let resolved = engine.force_resolve_due(now_ms()).await;
            assert!(resolved.is_empty());
        }

        #[tokio::test]
        async fn test_end_of_combat_syncs_ship_rows() {
            let (engine, gateway, _rx) = world().await;
            let mut enc = duel_encounter(7);
            // Character 2 already worn down to almost nothing.
            enc.participants.insert(
                CombatantId::Character(2),
                CombatantState::character(2, 1, 0),
            );
            enc.deadline = Some(1_000);
            enc.pending.insert(
                CombatantId::Character(1),
                RoundActionState {
                    action: CombatAction::Attack {
                        target: CombatantId::Character(2),
                        commit: 50,
                    },
                    submitted_at: 500,
                    timed_out: false,
                },
            );
            gateway.encounters.insert(7, enc).await;

            engine.force_resolve_due(now_ms()).await;

            let enc = gateway.encounters.load(7).await.unwrap().value;
            assert!(enc.ended);

            // Survivor counts written back to the ship rows.
            let winner = gateway.ships.load(11).await.unwrap().value;
            assert_eq!(
                winner.fighters,
                enc.participants[&CombatantId::Character(1)].fighters
            );
            let loser = gateway.ships.load(12).await.unwrap().value;
            assert_eq!(loser.fighters, 0);
        }
    }
}
