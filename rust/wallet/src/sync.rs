//! Local pool and liquidity-position state, merged from chain observations.
//!
//! Observations can arrive late, twice, or out of order. Merges are field-level overwrites
//! guarded by the observation block, so replaying an update is harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive};
use serde::{Deserialize, Serialize};
use starknet::core::types::Felt;
use starknet_crypto::poseidon_hash;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::codec::{felt_to_hex, split, u128_string, U256Words};
use crate::curve::{check_tick, tick_at_sqrt_ratio, tick_matches_price};
use crate::error::ClientError;
use crate::persist::Persistence;

const POSITION_ID_DOMAIN: u64 = 0x504f534954494f4e; // "POSITION"
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub pool_id: Felt,
    pub sqrt_price_x128: U256Words,
    pub tick: i32,
    #[serde(with = "u128_string")]
    pub liquidity: u128,
    pub fee_growth_global0: U256Words,
    pub fee_growth_global1: U256Words,
    pub last_update_block: u64,
}

impl PoolState {
    fn empty(pool_id: Felt) -> Self {
        Self {
            pool_id,
            sqrt_price_x128: U256Words::ZERO,
            tick: 0,
            liquidity: 0,
            fee_growth_global0: U256Words::ZERO,
            fee_growth_global1: U256Words::ZERO,
            last_update_block: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.sqrt_price_x128.is_zero()
    }
}

/// Fields observed at `block`. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUpdate {
    pub block: u64,
    pub sqrt_price_x128: Option<U256Words>,
    pub tick: Option<i32>,
    pub liquidity: Option<u128>,
    pub fee_growth_global0: Option<U256Words>,
    pub fee_growth_global1: Option<U256Words>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpPosition {
    pub id: Felt,
    pub tick_lower: i32,
    pub tick_upper: i32,
    #[serde(with = "u128_string")]
    pub liquidity: u128,
    pub fee_growth_inside0_last: U256Words,
    pub fee_growth_inside1_last: U256Words,
    #[serde(with = "u128_string")]
    pub tokens_owed0: u128,
    #[serde(with = "u128_string")]
    pub tokens_owed1: u128,
    pub created_at: u64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionUpdate {
    pub observed_at: u64,
    pub liquidity: Option<u128>,
    pub fee_growth_inside0_last: Option<U256Words>,
    pub fee_growth_inside1_last: Option<U256Words>,
    /// Absolute owed amounts, not increments.
    pub tokens_owed0: Option<u128>,
    pub tokens_owed1: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Pool(PoolState),
    Position(LpPosition),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    #[serde(default)]
    pub pools: Vec<PoolState>,
    #[serde(default)]
    pub positions: Vec<LpPosition>,
}

pub fn position_id(position_commitment: Felt) -> Felt {
    poseidon_hash(position_commitment, Felt::from(POSITION_ID_DOMAIN))
}

pub struct StateSync {
    pools: RwLock<HashMap<Felt, Arc<Mutex<PoolState>>>>,
    positions: RwLock<HashMap<Felt, Arc<Mutex<LpPosition>>>>,
    events: broadcast::Sender<SyncEvent>,
    persistence: Box<dyn Persistence<SyncSnapshot>>,
    save_lock: Mutex<()>,
}

impl StateSync {
    pub fn new(initial: SyncSnapshot, persistence: impl Persistence<SyncSnapshot> + 'static) -> Self {
        let pools = initial
            .pools
            .into_iter()
            .map(|pool| (pool.pool_id, Arc::new(Mutex::new(pool))))
            .collect();
        let positions = initial
            .positions
            .into_iter()
            .map(|position| (position.id, Arc::new(Mutex::new(position))))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pools: RwLock::new(pools),
            positions: RwLock::new(positions),
            events,
            persistence: Box::new(persistence),
            save_lock: Mutex::new(()),
        }
    }

    pub fn load(persistence: impl Persistence<SyncSnapshot> + 'static) -> Result<Self, ClientError> {
        let initial = persistence.load()?.unwrap_or_default();
        info!(
            pools = initial.pools.len(),
            positions = initial.positions.len(),
            "pool state loaded"
        );
        Ok(Self::new(initial, persistence))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self, pool_id: &Felt) -> Option<PoolState> {
        let slot = read_map(&self.pools).get(pool_id).cloned()?;
        let state = lock(&slot).clone();
        Some(state)
    }

    pub fn position(&self, id: &Felt) -> Option<LpPosition> {
        let slot = read_map(&self.positions).get(id).cloned()?;
        let position = lock(&slot).clone();
        Some(position)
    }

    pub fn positions(&self) -> Vec<LpPosition> {
        let slots: Vec<_> = read_map(&self.positions).values().cloned().collect();
        let mut positions: Vec<LpPosition> = slots.iter().map(|slot| lock(slot).clone()).collect();
        positions.sort_by_key(|p| (p.created_at, felt_to_hex(&p.id)));
        positions
    }

    /// Merges one pool observation. Stale observations and regressing fee growth are ignored;
    /// a tick that contradicts the price is rejected.
    pub fn apply_pool_update(&self, pool_id: Felt, update: PoolUpdate) -> Result<PoolState, ClientError> {
        let slot = {
            let mut pools = self
                .pools
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match pools.get(&pool_id) {
                Some(slot) => slot.clone(),
                None => {
                    // a rejected first observation must not leave an uninitialized pool behind
                    merge_pool(&PoolState::empty(pool_id), &update)?;
                    pools
                        .entry(pool_id)
                        .or_insert_with(|| Arc::new(Mutex::new(PoolState::empty(pool_id))))
                        .clone()
                }
            }
        };

        let (merged, changed) = {
            let mut state = lock(&slot);
            if update.block < state.last_update_block {
                warn!(
                    pool = %felt_to_hex(&pool_id),
                    block = update.block,
                    last_update_block = state.last_update_block,
                    "stale pool update ignored"
                );
                return Ok(state.clone());
            }
            let merged = merge_pool(&state, &update)?;
            let changed = merged != *state;
            *state = merged.clone();
            (merged, changed)
        };

        if changed {
            debug!(pool = %felt_to_hex(&pool_id), block = update.block, tick = merged.tick, "pool state merged");
            let _ = self.events.send(SyncEvent::Pool(merged.clone()));
            self.persist()?;
        }
        Ok(merged)
    }

    /// Starts tracking a position minted through `position_commitment`. Re-opening is a no-op.
    pub fn open_position(
        &self,
        position_commitment: Felt,
        tick_lower: i32,
        tick_upper: i32,
        liquidity: u128,
        observed_at: u64,
    ) -> Result<LpPosition, ClientError> {
        check_tick(tick_lower)?;
        check_tick(tick_upper)?;
        if tick_lower >= tick_upper {
            return Err(ClientError::Validation(format!(
                "tick_lower {tick_lower} must be below tick_upper {tick_upper}"
            )));
        }
        let id = position_id(position_commitment);
        let (position, created) = {
            let mut positions = self
                .positions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match positions.get(&id) {
                Some(existing) => (lock(existing).clone(), false),
                None => {
                    let position = LpPosition {
                        id,
                        tick_lower,
                        tick_upper,
                        liquidity,
                        fee_growth_inside0_last: U256Words::ZERO,
                        fee_growth_inside1_last: U256Words::ZERO,
                        tokens_owed0: 0,
                        tokens_owed1: 0,
                        created_at: observed_at,
                        last_updated: observed_at,
                    };
                    positions.insert(id, Arc::new(Mutex::new(position.clone())));
                    (position, true)
                }
            }
        };
        if created {
            info!(position = %felt_to_hex(&id), tick_lower, tick_upper, "position opened");
            let _ = self.events.send(SyncEvent::Position(position.clone()));
            self.persist()?;
        }
        Ok(position)
    }

    pub fn apply_position_update(&self, id: Felt, update: PositionUpdate) -> Result<LpPosition, ClientError> {
        let slot = read_map(&self.positions)
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::Validation(format!("unknown position {}", felt_to_hex(&id))))?;

        let (merged, changed) = {
            let mut position = lock(&slot);
            if update.observed_at < position.last_updated {
                warn!(
                    position = %felt_to_hex(&id),
                    observed_at = update.observed_at,
                    last_updated = position.last_updated,
                    "stale position update ignored"
                );
                return Ok(position.clone());
            }
            let mut merged = position.clone();
            if let Some(liquidity) = update.liquidity {
                merged.liquidity = liquidity;
            }
            if let Some(value) = update.fee_growth_inside0_last {
                merged.fee_growth_inside0_last = value;
            }
            if let Some(value) = update.fee_growth_inside1_last {
                merged.fee_growth_inside1_last = value;
            }
            if let Some(value) = update.tokens_owed0 {
                merged.tokens_owed0 = value;
            }
            if let Some(value) = update.tokens_owed1 {
                merged.tokens_owed1 = value;
            }
            merged.last_updated = merged.last_updated.max(update.observed_at);
            let changed = merged != *position;
            *position = merged.clone();
            (merged, changed)
        };

        if changed {
            debug!(position = %felt_to_hex(&id), liquidity = merged.liquidity, "position merged");
            let _ = self.events.send(SyncEvent::Position(merged.clone()));
            self.persist()?;
        }
        Ok(merged)
    }

    /// Owed fees plus what accrued since the stored inside-growth snapshots.
    pub fn accrued_fees(
        &self,
        id: &Felt,
        fee_growth_inside0: U256Words,
        fee_growth_inside1: U256Words,
    ) -> Result<(u128, u128), ClientError> {
        let position = self
            .position(id)
            .ok_or_else(|| ClientError::Validation(format!("unknown position {}", felt_to_hex(id))))?;
        let fees0 = fees_since(position.fee_growth_inside0_last, fee_growth_inside0, position.liquidity);
        let fees1 = fees_since(position.fee_growth_inside1_last, fee_growth_inside1, position.liquidity);
        Ok((
            position.tokens_owed0.saturating_add(fees0),
            position.tokens_owed1.saturating_add(fees1),
        ))
    }

    fn persist(&self) -> Result<(), ClientError> {
        let _guard = lock(&self.save_lock);
        let pool_slots: Vec<_> = read_map(&self.pools).values().cloned().collect();
        let mut pools: Vec<PoolState> = pool_slots.iter().map(|slot| lock(slot).clone()).collect();
        pools.sort_by_key(|p| felt_to_hex(&p.pool_id));
        let snapshot = SyncSnapshot {
            pools,
            positions: self.positions(),
        };
        self.persistence.save(&snapshot)
    }
}

fn merge_pool(state: &PoolState, update: &PoolUpdate) -> Result<PoolState, ClientError> {
    let mut merged = state.clone();
    match (update.sqrt_price_x128, update.tick) {
        (Some(price), Some(tick)) => {
            if !tick_matches_price(tick, &price.to_biguint())? {
                return Err(ClientError::Validation(format!(
                    "tick {tick} is inconsistent with sqrt price {price}"
                )));
            }
            merged.sqrt_price_x128 = price;
            merged.tick = tick;
        }
        (Some(price), None) => {
            merged.tick = tick_at_sqrt_ratio(&price.to_biguint())?;
            merged.sqrt_price_x128 = price;
        }
        (None, Some(tick)) => {
            check_tick(tick)?;
            if state.is_initialized() && !tick_matches_price(tick, &state.sqrt_price_x128.to_biguint())? {
                return Err(ClientError::Validation(format!(
                    "tick {tick} is inconsistent with stored sqrt price {}",
                    state.sqrt_price_x128
                )));
            }
            merged.tick = tick;
        }
        (None, None) => {}
    }
    if let Some(liquidity) = update.liquidity {
        merged.liquidity = liquidity;
    }
    merged.fee_growth_global0 = monotonic(state.fee_growth_global0, update.fee_growth_global0, "fee_growth_global0");
    merged.fee_growth_global1 = monotonic(state.fee_growth_global1, update.fee_growth_global1, "fee_growth_global1");
    merged.last_update_block = state.last_update_block.max(update.block);
    Ok(merged)
}

fn monotonic(stored: U256Words, observed: Option<U256Words>, field: &str) -> U256Words {
    match observed {
        Some(value) if value < stored => {
            warn!(field, stored = %stored, observed = %value, "regressing fee growth ignored");
            stored
        }
        Some(value) => value,
        None => stored,
    }
}

fn fees_since(last: U256Words, now: U256Words, liquidity: u128) -> u128 {
    let modulus = BigUint::one() << 256u32;
    let delta = (now.to_biguint() + &modulus - last.to_biguint()) % &modulus;
    let fees = (delta * BigUint::from(liquidity)) >> 128u32;
    fees.to_u128().unwrap_or(u128::MAX)
}

fn read_map<K, V>(map: &RwLock<HashMap<K, V>>) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
    map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Q128.128 fee growth for a raw integer, used by callers that track growth per unit liquidity.
pub fn growth_from_u128(value: u128) -> Result<U256Words, ClientError> {
    split(&(BigUint::from(value) << 128u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::q128;
    use crate::curve::sqrt_ratio_at_tick;
    use crate::persist::MemoryStore;
    use proptest::prelude::*;

    fn sync() -> StateSync {
        StateSync::new(SyncSnapshot::default(), MemoryStore::<SyncSnapshot>::new())
    }

    fn price_at(tick: i32) -> U256Words {
        split(&sqrt_ratio_at_tick(tick).expect("ratio")).expect("split")
    }

    #[test]
    fn absent_fields_keep_prior_values() {
        let sync = sync();
        let pool = Felt::ONE;
        sync.apply_pool_update(
            pool,
            PoolUpdate {
                block: 10,
                sqrt_price_x128: Some(price_at(0)),
                liquidity: Some(5_000),
                ..PoolUpdate::default()
            },
        )
        .expect("first");
        let state = sync
            .apply_pool_update(
                pool,
                PoolUpdate {
                    block: 11,
                    liquidity: Some(7_000),
                    ..PoolUpdate::default()
                },
            )
            .expect("second");
        assert_eq!(state.sqrt_price_x128, price_at(0));
        assert_eq!(state.tick, 0);
        assert_eq!(state.liquidity, 7_000);
        assert_eq!(state.last_update_block, 11);
    }

    #[test]
    fn tick_is_derived_from_price() {
        let sync = sync();
        let state = sync
            .apply_pool_update(
                Felt::ONE,
                PoolUpdate {
                    block: 1,
                    sqrt_price_x128: Some(price_at(-120)),
                    ..PoolUpdate::default()
                },
            )
            .expect("update");
        assert_eq!(state.tick, -120);
    }

    #[test]
    fn inconsistent_tick_is_rejected() {
        let sync = sync();
        let err = sync
            .apply_pool_update(
                Felt::ONE,
                PoolUpdate {
                    block: 1,
                    sqrt_price_x128: Some(split(&q128()).expect("split")),
                    tick: Some(60),
                    ..PoolUpdate::default()
                },
            )
            .expect_err("inconsistent");
        assert_eq!(err.kind(), "validation");
        assert!(sync.pool(&Felt::ONE).is_none());
    }

    #[test]
    fn rejected_first_update_leaves_no_pool_behind() {
        let backend = Arc::new(MemoryStore::<SyncSnapshot>::new());
        let sync = StateSync::load(backend.clone()).expect("load");
        sync.apply_pool_update(
            Felt::ONE,
            PoolUpdate {
                block: 1,
                sqrt_price_x128: Some(price_at(0)),
                tick: Some(60),
                ..PoolUpdate::default()
            },
        )
        .expect_err("inconsistent");
        sync.apply_pool_update(
            Felt::TWO,
            PoolUpdate {
                block: 1,
                sqrt_price_x128: Some(price_at(60)),
                ..PoolUpdate::default()
            },
        )
        .expect("valid pool");

        let saved = backend.load().expect("load").expect("snapshot");
        let ids: Vec<Felt> = saved.pools.iter().map(|pool| pool.pool_id).collect();
        assert_eq!(ids, vec![Felt::TWO]);

        let err = sync
            .apply_pool_update(
                Felt::TWO,
                PoolUpdate {
                    block: 2,
                    tick: Some(-600),
                    ..PoolUpdate::default()
                },
            )
            .expect_err("contradicts stored price");
        assert_eq!(err.kind(), "validation");
        let kept = sync.pool(&Felt::TWO).expect("pool");
        assert_eq!((kept.tick, kept.last_update_block), (60, 1));
    }

    #[test]
    fn stale_updates_are_ignored() {
        let sync = sync();
        sync.apply_pool_update(
            Felt::ONE,
            PoolUpdate {
                block: 20,
                liquidity: Some(1),
                ..PoolUpdate::default()
            },
        )
        .expect("new");
        let state = sync
            .apply_pool_update(
                Felt::ONE,
                PoolUpdate {
                    block: 19,
                    liquidity: Some(99),
                    ..PoolUpdate::default()
                },
            )
            .expect("stale");
        assert_eq!(state.liquidity, 1);
        assert_eq!(state.last_update_block, 20);
    }

    #[test]
    fn fee_growth_never_decreases() {
        let sync = sync();
        sync.apply_pool_update(
            Felt::ONE,
            PoolUpdate {
                block: 1,
                fee_growth_global0: Some(U256Words::new(0, 5)),
                ..PoolUpdate::default()
            },
        )
        .expect("first");
        let state = sync
            .apply_pool_update(
                Felt::ONE,
                PoolUpdate {
                    block: 2,
                    fee_growth_global0: Some(U256Words::new(u128::MAX, 4)),
                    fee_growth_global1: Some(U256Words::new(3, 0)),
                    ..PoolUpdate::default()
                },
            )
            .expect("second");
        assert_eq!(state.fee_growth_global0, U256Words::new(0, 5));
        assert_eq!(state.fee_growth_global1, U256Words::new(3, 0));
    }

    #[test]
    fn positions_merge_and_accrue() {
        let sync = sync();
        let opened = sync
            .open_position(Felt::from(44u8), -60, 60, 1_000, 100)
            .expect("open");
        assert_eq!(opened.id, position_id(Felt::from(44u8)));
        let again = sync
            .open_position(Felt::from(44u8), -60, 60, 9, 200)
            .expect("reopen");
        assert_eq!(again.liquidity, 1_000);

        let merged = sync
            .apply_position_update(
                opened.id,
                PositionUpdate {
                    observed_at: 150,
                    tokens_owed0: Some(7),
                    fee_growth_inside0_last: Some(growth_from_u128(1).expect("growth")),
                    ..PositionUpdate::default()
                },
            )
            .expect("merge");
        assert_eq!(merged.tokens_owed0, 7);
        assert_eq!(merged.last_updated, 150);
        assert_eq!(merged.created_at, 100);

        let stale = sync
            .apply_position_update(
                opened.id,
                PositionUpdate {
                    observed_at: 120,
                    tokens_owed0: Some(1),
                    ..PositionUpdate::default()
                },
            )
            .expect("stale");
        assert_eq!(stale.tokens_owed0, 7);

        let (fees0, fees1) = sync
            .accrued_fees(&opened.id, growth_from_u128(3).expect("growth"), U256Words::ZERO)
            .expect("fees");
        assert_eq!(fees0, 7 + 2 * 1_000);
        assert_eq!(fees1, 0);
    }

    #[test]
    fn unknown_position_is_rejected() {
        assert!(sync()
            .apply_position_update(Felt::ONE, PositionUpdate::default())
            .is_err());
    }

    #[test]
    fn disjoint_pools_merge_in_parallel() {
        let sync = Arc::new(sync());
        let handles: Vec<_> = (1..=8u64)
            .map(|pool| {
                let sync = sync.clone();
                std::thread::spawn(move || {
                    for block in 1..=50u64 {
                        sync.apply_pool_update(
                            Felt::from(pool),
                            PoolUpdate {
                                block,
                                liquidity: Some(u128::from(block * pool)),
                                ..PoolUpdate::default()
                            },
                        )
                        .expect("merge");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        for pool in 1..=8u64 {
            let state = sync.pool(&Felt::from(pool)).expect("pool");
            assert_eq!(state.liquidity, u128::from(50 * pool));
            assert_eq!(state.last_update_block, 50);
        }
    }

    #[test]
    fn snapshot_reloads() {
        let backend = Arc::new(MemoryStore::<SyncSnapshot>::new());
        let sync = StateSync::load(backend.clone()).expect("load");
        sync.apply_pool_update(
            Felt::TWO,
            PoolUpdate {
                block: 3,
                liquidity: Some(8),
                ..PoolUpdate::default()
            },
        )
        .expect("update");
        sync.open_position(Felt::from(5u8), -10, 10, 1, 3).expect("open");
        let reloaded = StateSync::load(backend).expect("reload");
        assert_eq!(reloaded.pool(&Felt::TWO).expect("pool").liquidity, 8);
        assert_eq!(reloaded.positions().len(), 1);
    }

    fn update_strategy() -> impl Strategy<Value = PoolUpdate> {
        (
            0u64..100,
            proptest::option::of(-2_000i32..2_000),
            proptest::option::of(any::<u128>()),
            proptest::option::of((any::<u128>(), 0u128..4)),
        )
            .prop_map(|(block, tick, liquidity, growth)| PoolUpdate {
                block,
                sqrt_price_x128: tick.map(price_at),
                tick: None,
                liquidity,
                fee_growth_global0: growth.map(|(low, high)| U256Words::new(low, high)),
                fee_growth_global1: None,
            })
    }

    proptest! {
        #[test]
        fn applying_twice_equals_applying_once(
            history in proptest::collection::vec(update_strategy(), 0..6),
            update in update_strategy(),
        ) {
            let once = sync();
            let twice = sync();
            for prior in &history {
                once.apply_pool_update(Felt::ONE, prior.clone()).expect("prior");
                twice.apply_pool_update(Felt::ONE, prior.clone()).expect("prior");
            }
            let a = once.apply_pool_update(Felt::ONE, update.clone()).expect("once");
            twice.apply_pool_update(Felt::ONE, update.clone()).expect("twice");
            let b = twice.apply_pool_update(Felt::ONE, update).expect("twice");
            prop_assert_eq!(a, b);
        }
    }
}
