//! Persistence gateway: versioned entity tables with conditional updates.
//!
//! Every row carries a monotonic version. Engines load a snapshot, compute
//! the next state without I/O, and commit with either a compare-and-swap on
//! the version or a predicate-guarded update. A commit that matches no row
//! is a conflict: a concurrent writer got there first, and the caller
//! decides whether to reload-and-retry (trading) or fail (combat, movement).

use shared::entities::{
    CharacterId, CharacterState, CombatEncounter, CombatId, GarrisonId, GarrisonState,
    PortId, PortInventory, ShipId, ShipState,
};
use shared::GameError;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Failures of the storage layer itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    /// The conditional update matched zero rows: version or predicate no
    /// longer holds.
    #[error("conditional update of {entity} {id} matched no row")]
    NoMatch { entity: &'static str, id: u64 },
}

impl From<GatewayError> for GameError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound { entity, id } => GameError::not_found(entity, id),
            GatewayError::NoMatch { entity, id } => {
                GameError::conflict(format!("concurrent update of {} {}", entity, id))
            }
        }
    }
}

/// A row snapshot paired with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// One entity table. All mutation goes through the update methods below so
/// the version counter never skips or repeats.
#[derive(Debug)]
pub struct Table<K, T> {
    entity: &'static str,
    rows: RwLock<HashMap<K, Versioned<T>>>,
}

impl<K, T> Table<K, T>
where
    K: Eq + Hash + Copy + Into<u64>,
    T: Clone,
{
    pub fn new(entity: &'static str) -> Self {
        Table {
            entity,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a fresh row at version 1, replacing any existing row.
    pub async fn insert(&self, id: K, value: T) {
        let mut rows = self.rows.write().await;
        rows.insert(id, Versioned { value, version: 1 });
    }

    /// Loads a snapshot of the row and the version it was read at.
    pub async fn load(&self, id: K) -> Result<Versioned<T>, GatewayError> {
        let rows = self.rows.read().await;
        rows.get(&id).cloned().ok_or(GatewayError::NotFound {
            entity: self.entity,
            id: id.into(),
        })
    }

    /// Compare-and-swap: commits `value` and bumps the version only if the
    /// stored version still equals `expected`. Returns the new version.
    pub async fn update_if_version(
        &self,
        id: K,
        expected: u64,
        value: T,
    ) -> Result<u64, GatewayError> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(GatewayError::NotFound {
            entity: self.entity,
            id: id.into(),
        })?;
        if row.version != expected {
            return Err(GatewayError::NoMatch {
                entity: self.entity,
                id: id.into(),
            });
        }
        row.value = value;
        row.version += 1;
        Ok(row.version)
    }

    /// Predicate-guarded read-modify-write: applies `mutate` and bumps the
    /// version only while `predicate` holds against the current row.
    pub async fn update_if<P, M>(
        &self,
        id: K,
        predicate: P,
        mutate: M,
    ) -> Result<Versioned<T>, GatewayError>
    where
        P: FnOnce(&T) -> bool,
        M: FnOnce(&mut T),
    {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(GatewayError::NotFound {
            entity: self.entity,
            id: id.into(),
        })?;
        if !predicate(&row.value) {
            return Err(GatewayError::NoMatch {
                entity: self.entity,
                id: id.into(),
            });
        }
        mutate(&mut row.value);
        row.version += 1;
        Ok(row.clone())
    }

    /// Unconditional read-modify-write. Reserved for finalization steps
    /// whose preceding phase already made the row inert (hyperspace
    /// arrival).
    pub async fn update<M>(&self, id: K, mutate: M) -> Result<Versioned<T>, GatewayError>
    where
        M: FnOnce(&mut T),
    {
        self.update_if(id, |_| true, mutate).await
    }

    pub async fn ids(&self) -> Vec<K> {
        let rows = self.rows.read().await;
        rows.keys().copied().collect()
    }

    /// Snapshots of every row matching the filter.
    pub async fn filter<F>(&self, keep: F) -> Vec<Versioned<T>>
    where
        F: Fn(&T) -> bool,
    {
        let rows = self.rows.read().await;
        rows.values().filter(|row| keep(&row.value)).cloned().collect()
    }
}

/// The relational store behind all three engines.
#[derive(Debug)]
pub struct Gateway {
    pub ships: Table<ShipId, ShipState>,
    pub characters: Table<CharacterId, CharacterState>,
    pub ports: Table<PortId, PortInventory>,
    pub garrisons: Table<GarrisonId, GarrisonState>,
    pub encounters: Table<CombatId, CombatEncounter>,
    next_combat_id: AtomicU64,
}

impl Gateway {
    pub fn new() -> Self {
        Gateway {
            ships: Table::new("ship"),
            characters: Table::new("character"),
            ports: Table::new("port"),
            garrisons: Table::new("garrison"),
            encounters: Table::new("encounter"),
            next_combat_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_combat_id(&self) -> CombatId {
        self.next_combat_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Gateway::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table<u32, u64> {
        Table::new("counter")
    }

    #[tokio::test]
    async fn test_load_missing_row() {
        let t = table();
        let err = t.load(1).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotFound {
                entity: "counter",
                id: 1
            }
        );
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let t = table();
        t.insert(1, 10).await;

        let row = t.load(1).await.unwrap();
        assert_eq!(row.value, 10);
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn test_cas_commits_on_matching_version() {
        let t = table();
        t.insert(1, 10).await;

        let row = t.load(1).await.unwrap();
        let new_version = t.update_if_version(1, row.version, 20).await.unwrap();
        assert_eq!(new_version, 2);
        assert_eq!(t.load(1).await.unwrap().value, 20);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let t = table();
        t.insert(1, 10).await;

        let stale = t.load(1).await.unwrap();
        t.update_if_version(1, stale.version, 20).await.unwrap();

        // Second writer computed against the old snapshot.
        let err = t.update_if_version(1, stale.version, 30).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::NoMatch {
                entity: "counter",
                id: 1
            }
        );
        assert_eq!(t.load(1).await.unwrap().value, 20);
    }

    #[tokio::test]
    async fn test_version_strictly_monotonic() {
        let t = table();
        t.insert(1, 0).await;

        let mut last = t.load(1).await.unwrap().version;
        for i in 0..5 {
            let v = t.update_if_version(1, last, i).await.unwrap();
            assert_eq!(v, last + 1);
            last = v;
        }
    }

    #[tokio::test]
    async fn test_update_if_predicate_pass_and_fail() {
        let t = table();
        t.insert(1, 10).await;

        let row = t
            .update_if(1, |v| *v >= 10, |v| *v -= 10)
            .await
            .unwrap();
        assert_eq!(row.value, 0);
        assert_eq!(row.version, 2);

        let err = t.update_if(1, |v| *v >= 10, |v| *v -= 10).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::NoMatch {
                entity: "counter",
                id: 1
            }
        );
        // Failed predicate must leave the row untouched.
        let row = t.load(1).await.unwrap();
        assert_eq!(row.value, 0);
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_filter_snapshots() {
        let t = table();
        t.insert(1, 5).await;
        t.insert(2, 15).await;
        t.insert(3, 25).await;

        let mut big: Vec<u64> = t
            .filter(|v| *v > 10)
            .await
            .into_iter()
            .map(|row| row.value)
            .collect();
        big.sort_unstable();
        assert_eq!(big, vec![15, 25]);
    }

    #[test]
    fn test_gateway_error_maps_to_game_error() {
        let not_found: GameError = GatewayError::NotFound {
            entity: "ship",
            id: 9,
        }
        .into();
        assert_eq!(not_found, GameError::not_found("ship", 9u32));

        let conflict: GameError = GatewayError::NoMatch {
            entity: "port",
            id: 2,
        }
        .into();
        assert!(matches!(conflict, GameError::Conflict { .. }));
    }

    #[test]
    fn test_combat_id_allocation_is_unique() {
        let gateway = Gateway::new();
        let a = gateway.allocate_combat_id();
        let b = gateway.allocate_combat_id();
        assert_ne!(a, b);
    }
}
