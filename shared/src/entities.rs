//! Persisted entity rows and the combat action model.
//!
//! These are the shared mutable entities every request handler loads fresh
//! from the persistence gateway, transforms, and conditionally commits.
//! Encounters use `BTreeMap` rather than `HashMap` so round resolution walks
//! participants in a deterministic order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::COMMODITY_COUNT;

pub type CharacterId = u32;
pub type CorporationId = u32;
pub type ShipId = u32;
pub type SectorId = u32;
pub type PortId = u32;
pub type GarrisonId = u32;
pub type CombatId = u64;

/// The three tradeable commodities, in port-code slot order.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Commodity {
    FuelOre,
    Organics,
    Equipment,
}

impl Commodity {
    pub const ALL: [Commodity; COMMODITY_COUNT] =
        [Commodity::FuelOre, Commodity::Organics, Commodity::Equipment];

    /// Slot index into port codes, stock arrays and cargo holds.
    pub fn index(self) -> usize {
        match self {
            Commodity::FuelOre => 0,
            Commodity::Organics => 1,
            Commodity::Equipment => 2,
        }
    }
}

/// Trade direction from the player's point of view.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeDirection {
    /// Player buys from the port (port must sell the commodity).
    Buy,
    /// Player sells to the port (port must buy the commodity).
    Sell,
}

/// Exclusive owner of a ship or garrison.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Character(CharacterId),
    Corporation(CorporationId),
}

/// One ship row. Mutated only through the engines, never directly.
///
/// `sector_id` is the authoritative location only while `in_hyperspace` is
/// false; a ship in transit is in no sector at all.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ShipState {
    pub ship_id: ShipId,
    pub owner: Owner,
    pub sector_id: Option<SectorId>,
    pub credits: u64,
    pub cargo: [u32; COMMODITY_COUNT],
    pub cargo_capacity: u32,
    /// Deployed-fighter complement carried into combat encounters.
    pub fighters: u32,
    pub shields: u32,
    /// Escape pods may not flee an encounter.
    pub is_escape_pod: bool,
    pub warp_power: u32,
    pub warp_power_capacity: u32,
    /// Warp power consumed by one jump with this hull.
    pub warp_cost: u32,
    pub in_hyperspace: bool,
    pub hyperspace_destination: Option<SectorId>,
    /// Expected arrival time, epoch milliseconds.
    pub hyperspace_eta: Option<u64>,
}

impl ShipState {
    pub fn cargo_used(&self) -> u32 {
        self.cargo.iter().sum()
    }

    pub fn cargo_space(&self) -> u32 {
        self.cargo_capacity.saturating_sub(self.cargo_used())
    }

    /// Checks the hyperspace field invariant: destination and eta are set
    /// exactly while the ship is in transit.
    pub fn hyperspace_fields_consistent(&self) -> bool {
        self.in_hyperspace == self.hyperspace_destination.is_some()
            && self.in_hyperspace == self.hyperspace_eta.is_some()
            && (self.in_hyperspace != self.sector_id.is_some())
    }
}

/// Minimal character row: the actor behind trade and movement requests.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CharacterState {
    pub character_id: CharacterId,
    pub corporation: Option<CorporationId>,
    /// The ship this character currently pilots.
    pub ship_id: ShipId,
}

/// One port row. Stock is committed only via compare-and-swap on the row
/// version, so concurrent trades can never lose an update.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PortInventory {
    pub port_id: PortId,
    pub sector_id: SectorId,
    /// Three characters, one per commodity slot: `S` means the port sells
    /// that commodity to players, `B` means it buys it from them.
    pub code: String,
    pub stock: [u32; COMMODITY_COUNT],
    pub max_capacity: [u32; COMMODITY_COUNT],
}

impl PortInventory {
    fn slot(&self, commodity: Commodity) -> Option<char> {
        self.code.chars().nth(commodity.index())
    }

    /// True when the port sells this commodity to players.
    pub fn sells(&self, commodity: Commodity) -> bool {
        self.slot(commodity) == Some('S')
    }

    /// True when the port buys this commodity from players.
    pub fn buys(&self, commodity: Commodity) -> bool {
        self.slot(commodity) == Some('B')
    }

    pub fn supports(&self, commodity: Commodity, direction: TradeDirection) -> bool {
        match direction {
            TradeDirection::Buy => self.sells(commodity),
            TradeDirection::Sell => self.buys(commodity),
        }
    }

    pub fn stock_of(&self, commodity: Commodity) -> u32 {
        self.stock[commodity.index()]
    }

    pub fn capacity_of(&self, commodity: Commodity) -> u32 {
        self.max_capacity[commodity.index()]
    }

    /// Units of this commodity the port can still absorb.
    pub fn space_for(&self, commodity: Commodity) -> u32 {
        self.capacity_of(commodity)
            .saturating_sub(self.stock_of(commodity))
    }

    /// Stock never exceeds capacity in any slot.
    pub fn stock_within_capacity(&self) -> bool {
        self.stock
            .iter()
            .zip(self.max_capacity.iter())
            .all(|(s, c)| s <= c)
    }
}

/// A standing sector garrison: deployed fighters that engage arriving ships
/// and may demand a toll instead of a fight.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GarrisonState {
    pub garrison_id: GarrisonId,
    pub sector_id: SectorId,
    pub owner: Owner,
    pub fighters: u32,
    /// Credits demanded for safe passage; zero means no toll is offered.
    pub toll: u64,
    /// Accumulated toll payments, persisted on every successful payment.
    pub toll_balance: u64,
}

/// Identifies a combatant within an encounter. The two id namespaces are
/// kept apart by construction, and "only characters submit actions" is a
/// pattern match instead of a runtime tag check.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum CombatantId {
    Character(CharacterId),
    Garrison(GarrisonId),
}

impl CombatantId {
    pub fn is_character(self) -> bool {
        matches!(self, CombatantId::Character(_))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CombatantKind {
    Character,
    Garrison,
}

/// Per-combatant state inside an encounter. Destroyed and exited combatants
/// stay in the participant map for the historical record; they only drop
/// out of readiness.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CombatantState {
    pub id: CombatantId,
    pub kind: CombatantKind,
    pub fighters: u32,
    pub shields: u32,
    /// Escape pods may not flee and are not waited on for readiness.
    pub is_escape_pod: bool,
    pub destroyed: bool,
    /// Fled or paid the toll and left.
    pub exited: bool,
}

impl CombatantState {
    pub fn character(id: CharacterId, fighters: u32, shields: u32) -> Self {
        CombatantState {
            id: CombatantId::Character(id),
            kind: CombatantKind::Character,
            fighters,
            shields,
            is_escape_pod: false,
            destroyed: false,
            exited: false,
        }
    }

    pub fn garrison(id: GarrisonId, fighters: u32) -> Self {
        CombatantState {
            id: CombatantId::Garrison(id),
            kind: CombatantKind::Garrison,
            fighters,
            shields: 0,
            is_escape_pod: false,
            destroyed: false,
            exited: false,
        }
    }

    /// Still present in the fight: neither destroyed nor exited.
    pub fn is_active(&self) -> bool {
        !self.destroyed && !self.exited
    }

    /// Must this combatant act before the round can resolve early?
    /// Garrisons are always ready; escape pods are never waited on.
    pub fn is_obligated(&self) -> bool {
        self.kind == CombatantKind::Character && self.is_active() && !self.is_escape_pod
    }
}

/// A validated combat action. Closed sum type: adding an action without
/// handling it in the resolver is a compile error.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum CombatAction {
    Attack { target: CombatantId, commit: u32 },
    Brace,
    Flee { destination: SectorId },
    Pay { garrison: GarrisonId, amount: u64 },
}

/// One combatant's accepted action for the current round.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoundActionState {
    pub action: CombatAction,
    /// Epoch milliseconds at acceptance.
    pub submitted_at: u64,
    /// True when the engine synthesized this action at the deadline.
    pub timed_out: bool,
}

/// One recorded toll payment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TollPayment {
    pub payer: CharacterId,
    pub amount: u64,
    pub paid_at: u64,
}

/// Toll terms for one garrison in an encounter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TollEntry {
    pub amount: u64,
    pub paid: bool,
    /// Running balance collected through this encounter.
    pub balance: u64,
    pub payments: Vec<TollPayment>,
}

/// Per-encounter toll side-table: which garrisons demand payment and who
/// has paid them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TollRegistry {
    pub entries: BTreeMap<GarrisonId, TollEntry>,
}

impl TollRegistry {
    /// Resolves the garrison a payment is aimed at: the explicit target, or
    /// the sole registry entry when the choice is unambiguous.
    pub fn resolve_target(&self, target: Option<GarrisonId>) -> Option<GarrisonId> {
        match target {
            Some(id) => self.entries.contains_key(&id).then_some(id),
            None if self.entries.len() == 1 => self.entries.keys().next().copied(),
            None => None,
        }
    }
}

/// The shared state of one ongoing fight.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CombatEncounter {
    pub combat_id: CombatId,
    pub sector_id: SectorId,
    /// Starts at 1 and increments on every resolution.
    pub round: u32,
    /// Forced-resolution deadline for the current round, epoch milliseconds.
    /// Assigned when the round's first action arrives.
    pub deadline: Option<u64>,
    /// Terminal; an ended encounter accepts no further actions.
    pub ended: bool,
    pub participants: BTreeMap<CombatantId, CombatantState>,
    /// Accepted actions for the current round, cleared on resolution.
    pub pending: BTreeMap<CombatantId, RoundActionState>,
    pub tolls: TollRegistry,
}

impl CombatEncounter {
    pub fn new(combat_id: CombatId, sector_id: SectorId) -> Self {
        CombatEncounter {
            combat_id,
            sector_id,
            round: 1,
            deadline: None,
            ended: false,
            participants: BTreeMap::new(),
            pending: BTreeMap::new(),
            tolls: TollRegistry::default(),
        }
    }

    pub fn participant(&self, id: CombatantId) -> Option<&CombatantState> {
        self.participants.get(&id)
    }

    /// Combatants the round waits on before resolving early.
    pub fn obligated(&self) -> impl Iterator<Item = &CombatantState> {
        self.participants.values().filter(|c| c.is_obligated())
    }

    /// Round readiness: every obligated combatant has a pending action.
    pub fn is_ready(&self) -> bool {
        self.obligated().all(|c| self.pending.contains_key(&c.id))
    }

    pub fn deadline_elapsed(&self, now: u64) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    pub fn active(&self) -> impl Iterator<Item = &CombatantState> {
        self.participants.values().filter(|c| c.is_active())
    }

    /// Terminal condition: at most one active combatant remains, none of
    /// the active ones can still fight, or every active character has
    /// fled, paid or been destroyed.
    pub fn is_over(&self) -> bool {
        let active: Vec<&CombatantState> = self.active().collect();
        let fighting = active.iter().filter(|c| c.fighters > 0).count();
        let characters = active
            .iter()
            .filter(|c| c.kind == CombatantKind::Character)
            .count();
        active.len() <= 1 || fighting == 0 || characters == 0
    }
}
