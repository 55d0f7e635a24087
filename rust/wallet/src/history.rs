//! Submitted transactions, deduplicated by hash.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use starknet::core::types::Felt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::codec::felt_to_hex;
use crate::error::ClientError;
use crate::persist::Persistence;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Deposit,
    Swap,
    Withdraw,
    Mint,
    Burn,
    Initialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: Felt,
    pub kind: TxKind,
    pub status: TxStatus,
    /// Unix seconds at first sighting.
    pub timestamp: u64,
}

impl TransactionRecord {
    pub fn pending(hash: Felt, kind: TxKind) -> Self {
        Self {
            hash,
            kind,
            status: TxStatus::Pending,
            timestamp: unix_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    Recorded(TransactionRecord),
    StatusChanged { hash: Felt, status: TxStatus },
}

#[derive(Default)]
struct Rows {
    rows: Vec<TransactionRecord>,
    by_hash: HashMap<Felt, usize>,
}

pub struct HistoryLedger {
    state: Mutex<Rows>,
    events: broadcast::Sender<HistoryEvent>,
    persistence: Box<dyn Persistence<Vec<TransactionRecord>>>,
}

impl HistoryLedger {
    pub fn new(
        initial: Vec<TransactionRecord>,
        persistence: impl Persistence<Vec<TransactionRecord>> + 'static,
    ) -> Self {
        let mut state = Rows::default();
        for record in initial {
            if !state.by_hash.contains_key(&record.hash) {
                state.by_hash.insert(record.hash, state.rows.len());
                state.rows.push(record);
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(state),
            events,
            persistence: Box::new(persistence),
        }
    }

    pub fn load(
        persistence: impl Persistence<Vec<TransactionRecord>> + 'static,
    ) -> Result<Self, ClientError> {
        let initial = persistence.load()?.unwrap_or_default();
        info!(transactions = initial.len(), "history loaded");
        Ok(Self::new(initial, persistence))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// Appends a new hash. A hash already on record is treated as a status update for that row
    /// and `false` is returned.
    pub fn record(&self, tx: TransactionRecord) -> Result<bool, ClientError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(position) = state.by_hash.get(&tx.hash).copied() {
            if transition(&mut state.rows[position], tx.status) {
                self.persistence.save(&state.rows)?;
                self.notify(HistoryEvent::StatusChanged {
                    hash: tx.hash,
                    status: tx.status,
                });
            }
            return Ok(false);
        }
        let position = state.rows.len();
        state.by_hash.insert(tx.hash, position);
        state.rows.push(tx.clone());
        if let Err(err) = self.persistence.save(&state.rows) {
            state.rows.pop();
            state.by_hash.remove(&tx.hash);
            return Err(err);
        }
        info!(hash = %felt_to_hex(&tx.hash), kind = ?tx.kind, "transaction recorded");
        self.notify(HistoryEvent::Recorded(tx));
        Ok(true)
    }

    /// `pending -> success | failed`. From a terminal state this is a no-op.
    pub fn update_status(&self, hash: Felt, status: TxStatus) -> Result<bool, ClientError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let position = state.by_hash.get(&hash).copied().ok_or_else(|| {
            ClientError::Validation(format!("unknown transaction {}", felt_to_hex(&hash)))
        })?;
        if !transition(&mut state.rows[position], status) {
            return Ok(false);
        }
        self.persistence.save(&state.rows)?;
        info!(hash = %felt_to_hex(&hash), ?status, "transaction status updated");
        self.notify(HistoryEvent::StatusChanged { hash, status });
        Ok(true)
    }

    pub fn get(&self, hash: &Felt) -> Option<TransactionRecord> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .by_hash
            .get(hash)
            .and_then(|position| state.rows.get(*position))
            .cloned()
    }

    /// Rows in first-seen order.
    pub fn list(&self) -> Vec<TransactionRecord> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .rows
            .clone()
    }

    pub fn pending(&self) -> Vec<TransactionRecord> {
        self.list()
            .into_iter()
            .filter(|tx| tx.status == TxStatus::Pending)
            .collect()
    }

    fn notify(&self, event: HistoryEvent) {
        let _ = self.events.send(event);
    }
}

fn transition(row: &mut TransactionRecord, next: TxStatus) -> bool {
    if row.status == next {
        return false;
    }
    if row.status.is_terminal() {
        if next.is_terminal() {
            warn!(
                hash = %felt_to_hex(&row.hash),
                current = ?row.status,
                ignored = ?next,
                "conflicting terminal status ignored"
            );
        } else {
            debug!(hash = %felt_to_hex(&row.hash), "status regression ignored");
        }
        return false;
    }
    row.status = next;
    true
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
