//! Zylith client SDK.

pub mod asp;
pub mod builder;
pub mod chain;
pub mod codec;
pub mod config;
pub mod curve;
mod error;
pub mod history;
pub mod merkle;
pub mod notes;
pub mod orchestrator;
pub mod persist;
pub mod session;
pub mod sync;

pub use asp::{AspClient, TreeInfo};
pub use builder::{CallSequence, EntryPointCall, LedgerCall, PreparedTransaction, TransactionBuilder};
pub use chain::ChainClient;
pub use codec::{felt_to_hex, parse_felt, U256Words};
pub use config::{with_retry, RetryConfig, WalletConfig};
pub use curve::SwapQuote;
pub use error::ClientError;
pub use history::{HistoryEvent, HistoryLedger, TransactionRecord, TxKind, TxStatus};
pub use merkle::MerkleProof;
pub use notes::{Address, Note, NoteEvent, NoteRecord, NoteStatus, NoteStore, PositionRange, SpendLease};
pub use orchestrator::{Operation, ProofOrchestrator};
pub use persist::{JsonFileStore, MemoryStore, NoteVault, Persistence};
pub use session::{
    AccountSubmitter, CommitError, MintIntent, PendingTransaction, Session, Stores, Submitter, SwapIntent,
};
pub use sync::{LpPosition, PoolState, PoolUpdate, PositionUpdate, StateSync, SyncEvent};
