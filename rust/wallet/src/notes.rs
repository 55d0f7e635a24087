//! Confidential notes and the store that tracks their lifecycle.
//!
//! A note moves `Unconfirmed -> Confirmed -> Spent`. Each note sits behind its own lock, so
//! spending one note never blocks work on another. The map of locks is only held long enough to
//! look a slot up or insert one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use light_poseidon::{Poseidon, PoseidonHasher};
use num_bigint::BigUint;
use num_traits::One;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use starknet::core::types::Felt;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::codec::{felt_from_biguint, felt_to_hex, u128_string};
use crate::error::ClientError;
use crate::persist::Persistence;

pub type Address = Felt;

const NOTE_TYPE_POSITION: u8 = 2;
const COMMITMENT_BITS: u32 = 250;
const MAX_NOTE_GEN_ATTEMPTS: usize = 64;
const MAX_LEASE_ATTEMPTS: usize = 8;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub tick_lower: i32,
    pub tick_upper: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub secret: Felt,
    pub nullifier: Felt,
    /// Token amount, or liquidity for position notes.
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub commitment: Felt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionRange>,
}

impl Note {
    pub fn new(secret: Felt, nullifier: Felt, amount: u128, token: Address) -> Result<Self, ClientError> {
        let commitment = compute_commitment(secret, nullifier, amount)?;
        Ok(Self {
            secret,
            nullifier,
            amount,
            commitment,
            token: Some(token),
            index: None,
            position: None,
        })
    }

    pub fn random(amount: u128, token: Address) -> Result<Self, ClientError> {
        for _ in 0..MAX_NOTE_GEN_ATTEMPTS {
            let (secret, nullifier) = (random_felt(), random_felt());
            if let Ok(note) = Self::new(secret, nullifier, amount, token) {
                return Ok(note);
            }
        }
        Err(ClientError::Crypto(
            "note generation failed after max attempts".to_string(),
        ))
    }

    pub fn random_position(tick_lower: i32, tick_upper: i32, liquidity: u128) -> Result<Self, ClientError> {
        let range = PositionRange {
            tick_lower,
            tick_upper,
        };
        for _ in 0..MAX_NOTE_GEN_ATTEMPTS {
            let (secret, nullifier) = (random_felt(), random_felt());
            if let Ok(commitment) = compute_position_commitment(secret, nullifier, range, liquidity) {
                return Ok(Self {
                    secret,
                    nullifier,
                    amount: liquidity,
                    commitment,
                    token: None,
                    index: None,
                    position: Some(range),
                });
            }
        }
        Err(ClientError::Crypto(
            "position note generation failed after max attempts".to_string(),
        ))
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn is_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn expected_commitment(&self) -> Result<Felt, ClientError> {
        match self.position {
            Some(range) => compute_position_commitment(self.secret, self.nullifier, range, self.amount),
            None => compute_commitment(self.secret, self.nullifier, self.amount),
        }
    }

    pub fn verify(&self) -> Result<(), ClientError> {
        if self.expected_commitment()? != self.commitment {
            return Err(ClientError::Validation(format!(
                "note commitment {} does not match its contents",
                felt_to_hex(&self.commitment)
            )));
        }
        Ok(())
    }
}

/// `Poseidon(Poseidon(secret, nullifier), amount)` with the circom parameters over BN254, masked
/// to 250 bits so the result is a valid felt252.
pub fn compute_commitment(secret: Felt, nullifier: Felt, amount: u128) -> Result<Felt, ClientError> {
    let inner = circom_poseidon(&[felt_to_fr(&secret), felt_to_fr(&nullifier)])?;
    mask_commitment(circom_poseidon(&[inner, Fr::from(amount)])?)
}

/// Position notes bind the range and liquidity in place of a token amount:
/// `Poseidon(Poseidon(secret, nullifier), Poseidon(2, tick_lower, tick_upper, liquidity))`.
/// Ticks enter offset by 2^31 so negative ticks stay small field elements.
pub fn compute_position_commitment(
    secret: Felt,
    nullifier: Felt,
    range: PositionRange,
    liquidity: u128,
) -> Result<Felt, ClientError> {
    if range.tick_lower >= range.tick_upper {
        return Err(ClientError::Validation(format!(
            "tick_lower {} must be below tick_upper {}",
            range.tick_lower, range.tick_upper
        )));
    }
    let inner = circom_poseidon(&[felt_to_fr(&secret), felt_to_fr(&nullifier)])?;
    let body = circom_poseidon(&[
        Fr::from(NOTE_TYPE_POSITION as u64),
        Fr::from(tick_offset(range.tick_lower)),
        Fr::from(tick_offset(range.tick_upper)),
        Fr::from(liquidity),
    ])?;
    mask_commitment(circom_poseidon(&[inner, body])?)
}

fn circom_poseidon(inputs: &[Fr]) -> Result<Fr, ClientError> {
    let mut hasher = Poseidon::<Fr>::new_circom(inputs.len())
        .map_err(|e| ClientError::Crypto(format!("poseidon setup: {e}")))?;
    hasher
        .hash(inputs)
        .map_err(|e| ClientError::Crypto(format!("poseidon: {e}")))
}

/// Felts above the BN254 modulus wrap, matching how the prover reads them.
fn felt_to_fr(value: &Felt) -> Fr {
    Fr::from_be_bytes_mod_order(&value.to_bytes_be())
}

fn tick_offset(tick: i32) -> u64 {
    (i64::from(tick) - i64::from(i32::MIN)) as u64
}

fn mask_commitment(hash: Fr) -> Result<Felt, ClientError> {
    let mask = (BigUint::one() << COMMITMENT_BITS) - BigUint::one();
    let value = BigUint::from_bytes_be(&hash.into_bigint().to_bytes_be());
    let masked = felt_from_biguint(&(value & mask))?;
    if masked == Felt::ZERO {
        return Err(ClientError::Crypto("zero commitment".to_string()));
    }
    Ok(masked)
}

/// 248 random bits, below both the Stark and BN254 moduli.
fn random_felt() -> Felt {
    let mut bytes = Zeroizing::new([0u8; 31]);
    OsRng.fill_bytes(&mut bytes[..]);
    Felt::from_bytes_be_slice(&bytes[..])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NoteStatus {
    Unconfirmed,
    Confirmed,
    Spent { tx_hash: Felt },
}

impl NoteStatus {
    pub fn is_spent(&self) -> bool {
        matches!(self, NoteStatus::Spent { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub note: Note,
    pub status: NoteStatus,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteEvent {
    Added { commitment: Felt },
    Confirmed { commitment: Felt, index: u64 },
    Leased { commitments: Vec<Felt> },
    Released { commitments: Vec<Felt> },
    Spent { commitment: Felt, tx_hash: Felt },
}

#[derive(Debug)]
struct NoteSlot {
    record: NoteRecord,
    lease: Option<u64>,
}

struct Inner {
    notes: RwLock<HashMap<Felt, Arc<Mutex<NoteSlot>>>>,
    next_seq: AtomicU64,
    next_lease: AtomicU64,
    events: broadcast::Sender<NoteEvent>,
    persistence: Box<dyn Persistence<Vec<NoteRecord>>>,
    save_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct NoteStore {
    inner: Arc<Inner>,
}

impl NoteStore {
    pub fn new(
        initial: Vec<NoteRecord>,
        persistence: impl Persistence<Vec<NoteRecord>> + 'static,
    ) -> Self {
        let next_seq = initial.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        let notes = initial
            .into_iter()
            .map(|record| {
                (
                    record.note.commitment,
                    Arc::new(Mutex::new(NoteSlot {
                        record,
                        lease: None,
                    })),
                )
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                notes: RwLock::new(notes),
                next_seq: AtomicU64::new(next_seq),
                next_lease: AtomicU64::new(1),
                events,
                persistence: Box::new(persistence),
                save_lock: Mutex::new(()),
            }),
        }
    }

    pub fn load(persistence: impl Persistence<Vec<NoteRecord>> + 'static) -> Result<Self, ClientError> {
        let initial = persistence.load()?.unwrap_or_default();
        info!(notes = initial.len(), "note store loaded");
        Ok(Self::new(initial, persistence))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoteEvent> {
        self.inner.events.subscribe()
    }

    /// Inserts a note the caller owns. Notes that already carry a tree index start out confirmed.
    pub fn add_note(&self, note: Note) -> Result<NoteRecord, ClientError> {
        match self.insert(note)? {
            Inserted::New(record) => Ok(record),
            Inserted::Existing(commitment) => {
                error!(commitment = %felt_to_hex(&commitment), "duplicate note commitment");
                Err(ClientError::DuplicateCommitment(felt_to_hex(&commitment)))
            }
        }
    }

    /// Records the output note of a submitted transaction. Returns `false` when the note was
    /// already known; the stored copy is left untouched.
    pub fn materialize_output(&self, note: Note) -> Result<bool, ClientError> {
        match self.insert(note)? {
            Inserted::New(_) => Ok(true),
            Inserted::Existing(commitment) => {
                debug!(commitment = %felt_to_hex(&commitment), "output note already materialized");
                Ok(false)
            }
        }
    }

    fn insert(&self, note: Note) -> Result<Inserted, ClientError> {
        note.verify()?;
        let commitment = note.commitment;
        let record = {
            let mut notes = self
                .inner
                .notes
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if notes.contains_key(&commitment) {
                return Ok(Inserted::Existing(commitment));
            }
            let status = if note.index.is_some() {
                NoteStatus::Confirmed
            } else {
                NoteStatus::Unconfirmed
            };
            let record = NoteRecord {
                note,
                status,
                seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
            };
            notes.insert(
                commitment,
                Arc::new(Mutex::new(NoteSlot {
                    record: record.clone(),
                    lease: None,
                })),
            );
            record
        };
        debug!(commitment = %felt_to_hex(&commitment), amount = record.note.amount, "note added");
        self.notify(NoteEvent::Added { commitment });
        self.persist()?;
        Ok(Inserted::New(record))
    }

    /// `Unconfirmed -> Confirmed` once the commitment is seen in the tree. Repeating it is a no-op.
    pub fn confirm(&self, commitment: Felt, index: u64) -> Result<(), ClientError> {
        let slot = self.slot(&commitment)?;
        {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.record.status {
                NoteStatus::Unconfirmed => {
                    guard.record.status = NoteStatus::Confirmed;
                    guard.record.note.index = Some(index);
                }
                NoteStatus::Confirmed | NoteStatus::Spent { .. } => {
                    return match guard.record.note.index {
                        Some(known) if known != index => Err(ClientError::Validation(format!(
                            "note {} is at index {known}, not {index}",
                            felt_to_hex(&commitment)
                        ))),
                        _ => Ok(()),
                    };
                }
            }
        }
        info!(commitment = %felt_to_hex(&commitment), index, "note confirmed");
        self.notify(NoteEvent::Confirmed { commitment, index });
        self.persist()
    }

    /// Picks the fewest confirmed, unleased token notes covering `min_amount` and leases them.
    pub fn select_spendable(&self, token: Address, min_amount: u128) -> Result<SpendLease, ClientError> {
        if min_amount == 0 {
            return Err(ClientError::Validation("amount must be > 0".to_string()));
        }
        for _ in 0..MAX_LEASE_ATTEMPTS {
            let mut candidates = self.spendable_candidates(token);
            candidates.sort_by(|a, b| {
                b.amount
                    .cmp(&a.amount)
                    .then_with(|| a.index.unwrap_or(u64::MAX).cmp(&b.index.unwrap_or(u64::MAX)))
                    .then_with(|| a.seq.cmp(&b.seq))
            });

            let mut chosen = Vec::new();
            let mut total = 0u128;
            for candidate in candidates.iter() {
                if total >= min_amount {
                    break;
                }
                total = total.saturating_add(candidate.amount);
                chosen.push(candidate.slot.clone());
            }
            if total < min_amount {
                let available = candidates
                    .iter()
                    .fold(0u128, |acc, c| acc.saturating_add(c.amount));
                return Err(ClientError::InsufficientBalance {
                    token: felt_to_hex(&token),
                    requested: min_amount,
                    available,
                });
            }
            if let Some(lease) = self.try_lease(&chosen) {
                return Ok(lease);
            }
            debug!("note selection raced with another lease, retrying");
        }
        Err(ClientError::Validation(
            "could not lease notes after repeated contention".to_string(),
        ))
    }

    /// Leases one specific confirmed note, typically a position note.
    pub fn lease_note(&self, commitment: Felt) -> Result<SpendLease, ClientError> {
        let slot = self.slot(&commitment)?;
        {
            let guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.record.status != NoteStatus::Confirmed {
                return Err(ClientError::Validation(format!(
                    "note {} is not spendable ({:?})",
                    felt_to_hex(&commitment),
                    guard.record.status
                )));
            }
        }
        self.try_lease(&[slot]).ok_or_else(|| {
            ClientError::Validation(format!(
                "note {} is leased by another operation",
                felt_to_hex(&commitment)
            ))
        })
    }

    fn try_lease(&self, slots: &[Arc<Mutex<NoteSlot>>]) -> Option<SpendLease> {
        let lease_id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        let mut notes = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.lease.is_some() || guard.record.status != NoteStatus::Confirmed {
                drop(guard);
                self.release(lease_id, &notes);
                return None;
            }
            guard.lease = Some(lease_id);
            notes.push(guard.record.note.clone());
        }
        let commitments: Vec<Felt> = notes.iter().map(|n| n.commitment).collect();
        self.notify(NoteEvent::Leased { commitments });
        Some(SpendLease {
            store: self.clone(),
            lease_id,
            notes,
        })
    }

    fn release(&self, lease_id: u64, notes: &[Note]) {
        let mut released = Vec::new();
        for note in notes {
            if let Ok(slot) = self.slot(&note.commitment) {
                let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if guard.lease == Some(lease_id) {
                    guard.lease = None;
                    released.push(note.commitment);
                }
            }
        }
        if !released.is_empty() {
            self.notify(NoteEvent::Released {
                commitments: released,
            });
        }
    }

    /// Spends a confirmed note. Repeating with the same transaction hash is a no-op; any other
    /// hash is a double spend.
    pub fn mark_spent(&self, commitment: Felt, tx_hash: Felt) -> Result<(), ClientError> {
        let slot = self.slot(&commitment)?;
        {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.record.status {
                NoteStatus::Spent { tx_hash: spent_in } if spent_in == tx_hash => return Ok(()),
                NoteStatus::Spent { tx_hash: spent_in } => {
                    error!(
                        commitment = %felt_to_hex(&commitment),
                        spent_in = %felt_to_hex(&spent_in),
                        attempted = %felt_to_hex(&tx_hash),
                        "double spend rejected"
                    );
                    return Err(ClientError::AlreadySpent {
                        commitment: felt_to_hex(&commitment),
                        spent_in: felt_to_hex(&spent_in),
                        attempted: felt_to_hex(&tx_hash),
                    });
                }
                NoteStatus::Unconfirmed => {
                    return Err(ClientError::Validation(format!(
                        "note {} is not confirmed in the tree",
                        felt_to_hex(&commitment)
                    )));
                }
                NoteStatus::Confirmed => {
                    guard.record.status = NoteStatus::Spent { tx_hash };
                    guard.lease = None;
                }
            }
        }
        info!(commitment = %felt_to_hex(&commitment), tx_hash = %felt_to_hex(&tx_hash), "note spent");
        self.notify(NoteEvent::Spent {
            commitment,
            tx_hash,
        });
        self.persist()
    }

    pub fn get(&self, commitment: &Felt) -> Option<NoteRecord> {
        let slot = self.slot(commitment).ok()?;
        let guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(guard.record.clone())
    }

    /// All notes in insertion order, spent ones included.
    pub fn list(&self) -> Vec<NoteRecord> {
        let mut records: Vec<NoteRecord> = self
            .slots()
            .iter()
            .map(|slot| {
                slot.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .record
                    .clone()
            })
            .collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn unspent(&self, token: Option<Address>) -> Vec<NoteRecord> {
        self.list()
            .into_iter()
            .filter(|r| !r.status.is_spent())
            .filter(|r| token.is_none() || r.note.token == token)
            .collect()
    }

    /// Sum over unspent token notes, confirmed or not.
    pub fn total_balance(&self, token: Address) -> Result<u128, ClientError> {
        sum_amounts(
            self.unspent(Some(token))
                .iter()
                .filter(|r| !r.note.is_position())
                .map(|r| r.note.amount),
        )
    }

    pub fn spendable_balance(&self, token: Address) -> Result<u128, ClientError> {
        sum_amounts(self.spendable_candidates(token).iter().map(|c| c.amount))
    }

    fn spendable_candidates(&self, token: Address) -> Vec<Candidate> {
        self.slots()
            .into_iter()
            .filter_map(|slot| {
                let (amount, index, seq) = {
                    let guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    let record = &guard.record;
                    if guard.lease.is_some()
                        || record.status != NoteStatus::Confirmed
                        || record.note.is_position()
                        || record.note.token != Some(token)
                    {
                        return None;
                    }
                    (record.note.amount, record.note.index, record.seq)
                };
                Some(Candidate {
                    slot,
                    amount,
                    index,
                    seq,
                })
            })
            .collect()
    }

    fn slot(&self, commitment: &Felt) -> Result<Arc<Mutex<NoteSlot>>, ClientError> {
        let notes = self
            .inner
            .notes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        notes
            .get(commitment)
            .cloned()
            .ok_or_else(|| ClientError::NoteNotFound(felt_to_hex(commitment)))
    }

    fn slots(&self) -> Vec<Arc<Mutex<NoteSlot>>> {
        let notes = self
            .inner
            .notes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        notes.values().cloned().collect()
    }

    fn notify(&self, event: NoteEvent) {
        let _ = self.inner.events.send(event);
    }

    fn persist(&self) -> Result<(), ClientError> {
        let _guard = self
            .inner
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = self.list();
        self.inner.persistence.save(&snapshot)
    }
}

enum Inserted {
    New(NoteRecord),
    Existing(Felt),
}

struct Candidate {
    slot: Arc<Mutex<NoteSlot>>,
    amount: u128,
    index: Option<u64>,
    seq: u64,
}

fn sum_amounts(mut amounts: impl Iterator<Item = u128>) -> Result<u128, ClientError> {
    amounts.try_fold(0u128, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| ClientError::Encoding("balance exceeds u128".to_string()))
    })
}

/// Notes reserved for one in-flight operation. Dropping the lease hands them back.
pub struct SpendLease {
    store: NoteStore,
    lease_id: u64,
    notes: Vec<Note>,
}

impl SpendLease {
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn total(&self) -> u128 {
        self.notes
            .iter()
            .fold(0u128, |acc, n| acc.saturating_add(n.amount))
    }

    pub fn commitments(&self) -> Vec<Felt> {
        self.notes.iter().map(|n| n.commitment).collect()
    }

    /// Marks every leased note spent in `tx_hash`. A failure leaves the lease held, and
    /// repeating with the same hash skips notes already spent.
    pub fn spend(&self, tx_hash: Felt) -> Result<(), ClientError> {
        for note in &self.notes {
            self.store.mark_spent(note.commitment, tx_hash)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SpendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpendLease")
            .field("lease_id", &self.lease_id)
            .field("notes", &self.commitments())
            .finish()
    }
}

impl Drop for SpendLease {
    fn drop(&mut self) {
        self.store.release(self.lease_id, &self.notes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;

    fn token() -> Address {
        Felt::from(0x70u32)
    }

    fn store() -> NoteStore {
        NoteStore::new(Vec::new(), MemoryStore::<Vec<NoteRecord>>::new())
    }

    fn confirmed(store: &NoteStore, amount: u128, index: u64) -> Note {
        let note = Note::random(amount, token()).expect("note").with_index(index);
        store.add_note(note.clone()).expect("add");
        note
    }

    #[test]
    fn commitment_matches_known_vector() {
        let commitment = compute_commitment(Felt::from(12345u32), Felt::from(67890u32), 1_000_000)
            .expect("commitment");
        let expected = crate::codec::parse_felt(
            "0x1c4dc57475789e584b168b4b0c678cdba0cd3ce2b64a505e9c30d71fc306900",
        )
        .expect("expected");
        assert_eq!(commitment, expected);
    }

    #[test]
    fn commitments_fit_in_250_bits() {
        for amount in [0u128, 1, u128::MAX] {
            let commitment =
                compute_commitment(Felt::from(7u8), Felt::from(9u8), amount).expect("commitment");
            assert!(crate::codec::felt_to_biguint(&commitment).bits() <= 250);
        }
    }

    #[test]
    fn random_notes_verify() {
        let note = Note::random(10, token()).expect("note");
        note.verify().expect("verify");
        assert_ne!(note.secret, note.nullifier);

        let position = Note::random_position(-60, 60, 5_000).expect("position");
        position.verify().expect("verify");
        let moved = compute_position_commitment(
            position.secret,
            position.nullifier,
            PositionRange {
                tick_lower: -120,
                tick_upper: 60,
            },
            5_000,
        )
        .expect("moved");
        assert_ne!(moved, position.commitment);
        assert!(Note::random_position(60, -60, 1).is_err());
    }

    #[test]
    fn tampered_note_is_rejected() {
        let store = store();
        let mut note = Note::random(10, token()).expect("note");
        note.amount = 11;
        assert!(matches!(store.add_note(note), Err(ClientError::Validation(_))));
    }

    #[test]
    fn duplicate_add_fails_but_materialize_is_idempotent() {
        let store = store();
        let note = Note::random(10, token()).expect("note");
        store.add_note(note.clone()).expect("add");
        assert!(matches!(
            store.add_note(note.clone()),
            Err(ClientError::DuplicateCommitment(_))
        ));
        assert!(!store.materialize_output(note.clone()).expect("materialize"));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn confirm_is_idempotent() {
        let store = store();
        let note = Note::random(10, token()).expect("note");
        store.add_note(note.clone()).expect("add");
        assert_eq!(
            store.get(&note.commitment).expect("get").status,
            NoteStatus::Unconfirmed
        );
        store.confirm(note.commitment, 4).expect("confirm");
        store.confirm(note.commitment, 4).expect("confirm again");
        assert!(store.confirm(note.commitment, 5).is_err());
        let record = store.get(&note.commitment).expect("get");
        assert_eq!(record.status, NoteStatus::Confirmed);
        assert_eq!(record.note.index, Some(4));
    }

    #[test]
    fn second_spend_with_other_hash_fails() {
        let store = store();
        let note = confirmed(&store, 10, 0);
        store.mark_spent(note.commitment, Felt::from(1u8)).expect("spend");
        store
            .mark_spent(note.commitment, Felt::from(1u8))
            .expect("same hash is a no-op");
        let err = store
            .mark_spent(note.commitment, Felt::from(2u8))
            .expect_err("double spend");
        assert_eq!(err.kind(), "already_spent");
    }

    #[test]
    fn unconfirmed_notes_cannot_be_spent() {
        let store = store();
        let note = Note::random(10, token()).expect("note");
        store.add_note(note.clone()).expect("add");
        assert!(store.mark_spent(note.commitment, Felt::ONE).is_err());
    }

    #[test]
    fn selection_prefers_fewest_notes() {
        let store = store();
        confirmed(&store, 100, 0);
        let big = confirmed(&store, 700, 1);
        let mid = confirmed(&store, 400, 2);
        let lease = store.select_spendable(token(), 1_000).expect("select");
        assert_eq!(lease.commitments(), vec![big.commitment, mid.commitment]);
        assert_eq!(lease.total(), 1_100);
    }

    #[test]
    fn equal_amounts_pick_earliest_index() {
        let store = store();
        let late = Note::random(50, token()).expect("note").with_index(9);
        let early = Note::random(50, token()).expect("note").with_index(3);
        store.add_note(late).expect("add");
        store.add_note(early.clone()).expect("add");
        let lease = store.select_spendable(token(), 50).expect("select");
        assert_eq!(lease.commitments(), vec![early.commitment]);
    }

    #[test]
    fn leased_notes_are_invisible_until_dropped() {
        let store = store();
        let note = confirmed(&store, 100, 0);
        let lease = store.select_spendable(token(), 100).expect("select");
        let err = store.select_spendable(token(), 1).expect_err("leased");
        assert!(matches!(
            err,
            ClientError::InsufficientBalance { available: 0, .. }
        ));
        drop(lease);
        let again = store.select_spendable(token(), 1).expect("released");
        assert_eq!(again.commitments(), vec![note.commitment]);
        assert_eq!(
            store.get(&note.commitment).expect("get").status,
            NoteStatus::Confirmed
        );
    }

    #[test]
    fn spent_notes_are_never_selected() {
        let store = store();
        let spent = confirmed(&store, 500, 0);
        let fresh = confirmed(&store, 100, 1);
        store.mark_spent(spent.commitment, Felt::ONE).expect("spend");
        let lease = store.select_spendable(token(), 50).expect("select");
        assert_eq!(lease.commitments(), vec![fresh.commitment]);
        assert!(store.select_spendable(token(), 200).is_err());
    }

    #[test]
    fn insufficient_balance_reports_available() {
        let store = store();
        confirmed(&store, 30, 0);
        confirmed(&store, 20, 1);
        match store.select_spendable(token(), 100) {
            Err(ClientError::InsufficientBalance {
                requested,
                available,
                ..
            }) => {
                assert_eq!(requested, 100);
                assert_eq!(available, 50);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lease_spend_marks_every_note() {
        let store = store();
        confirmed(&store, 30, 0);
        confirmed(&store, 20, 1);
        let lease = store.select_spendable(token(), 50).expect("select");
        let commitments = lease.commitments();
        lease.spend(Felt::from(99u8)).expect("spend");
        for commitment in commitments {
            assert!(store.get(&commitment).expect("get").status.is_spent());
        }
        assert_eq!(store.total_balance(token()).expect("balance"), 0);
    }

    #[test]
    fn balance_counts_unconfirmed_but_not_spent() {
        let store = store();
        store
            .add_note(Note::random(40, token()).expect("note"))
            .expect("add");
        let spent = confirmed(&store, 60, 0);
        assert_eq!(store.total_balance(token()).expect("balance"), 100);
        assert_eq!(store.spendable_balance(token()).expect("spendable"), 60);
        store.mark_spent(spent.commitment, Felt::ONE).expect("spend");
        assert_eq!(store.total_balance(token()).expect("balance"), 40);
    }

    #[test]
    fn state_survives_reload() {
        let backend = Arc::new(MemoryStore::<Vec<NoteRecord>>::new());
        let store = NoteStore::load(backend.clone()).expect("load");
        let note = confirmed(&store, 10, 0);
        store.mark_spent(note.commitment, Felt::TWO).expect("spend");

        let reloaded = NoteStore::load(backend).expect("reload");
        let record = reloaded.get(&note.commitment).expect("get");
        assert_eq!(record.status, NoteStatus::Spent { tx_hash: Felt::TWO });
        let next = Note::random(5, token()).expect("note");
        let added = reloaded.add_note(next).expect("add");
        assert!(added.seq > record.seq);
    }

    #[test]
    fn concurrent_selection_never_shares_notes() {
        let store = store();
        for i in 0..8 {
            confirmed(&store, 10, i);
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .select_spendable(token(), 10)
                        .map(|lease| {
                            let picked = lease.commitments();
                            std::mem::forget(lease);
                            picked
                        })
                        .expect("select")
                })
            })
            .collect();
        let mut picked: Vec<Felt> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect();
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 8);
    }

    #[tokio::test]
    async fn subscribers_see_lifecycle_events() {
        let store = store();
        let mut events = store.subscribe();
        let note = confirmed(&store, 10, 0);
        store.mark_spent(note.commitment, Felt::ONE).expect("spend");
        assert_eq!(
            events.recv().await.expect("added"),
            NoteEvent::Added {
                commitment: note.commitment
            }
        );
        assert_eq!(
            events.recv().await.expect("spent"),
            NoteEvent::Spent {
                commitment: note.commitment,
                tx_hash: Felt::ONE
            }
        );
    }
}
