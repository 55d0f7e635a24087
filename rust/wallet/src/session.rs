//! End-to-end flows: select notes, fetch membership proofs, prove, build calls, and commit the
//! local effects once the transaction hash is known.
//!
//! Signing stays outside. A flow returns a [`PendingTransaction`]; the caller signs and sends
//! its calls (or hands them to a [`Submitter`]) and then calls [`Session::commit`].

use std::sync::Arc;

use async_trait::async_trait;
use starknet::accounts::ConnectedAccount;
use starknet::core::types::Felt;
use starknet::providers::Provider;
use tracing::{debug, info, warn};
use zylith_prover::{InputValue, ProofInputs, ProverService};

use crate::asp::AspClient;
use crate::builder::{CallSequence, EntryPointCall, TransactionBuilder};
use crate::chain::ChainClient;
use crate::codec::{felt_to_hex, q128, split, U256Words};
use crate::config::WalletConfig;
use crate::curve::{
    liquidity_amounts, max_sqrt_ratio, min_sqrt_ratio, quote_exact_input, SwapQuote,
};
use crate::error::ClientError;
use crate::history::{HistoryLedger, TransactionRecord, TxKind};
use crate::merkle::MerkleProof;
use crate::notes::{Address, Note, NoteRecord, NoteStatus, NoteStore, SpendLease};
use crate::orchestrator::{Operation, ProofOrchestrator};
use crate::persist::{JsonFileStore, MemoryStore, NoteVault};
use crate::sync::{
    position_id, PoolState, PositionUpdate, StateSync, SyncSnapshot,
};

const DEFAULT_TICK_SPACING: u32 = 60;

/// Signs and sends a call sequence, returning the transaction hash.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, calls: &CallSequence) -> Result<Felt, ClientError>;
}

/// Submits through a starknet account as one multicall.
pub struct AccountSubmitter<A> {
    account: A,
}

impl<A> AccountSubmitter<A> {
    pub fn new(account: A) -> Self {
        Self { account }
    }
}

#[async_trait]
impl<A: ConnectedAccount + Sync + Send> Submitter for AccountSubmitter<A> {
    async fn submit(&self, calls: &CallSequence) -> Result<Felt, ClientError> {
        let calls = calls.to_calls()?;
        self.account
            .execute_v3(calls)
            .send()
            .await
            .map(|result| result.transaction_hash)
            .map_err(|err| ClientError::Rpc(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapIntent {
    pub zero_for_one: bool,
    pub amount_specified: u128,
    pub sqrt_price_limit: Option<U256Words>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintIntent {
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionEffect {
    Open {
        commitment: Felt,
        tick_lower: i32,
        tick_upper: i32,
        liquidity: u128,
    },
    Close {
        commitment: Felt,
    },
}

/// A submit or commit that did not finish. The input notes stay leased to `pending` until it
/// is committed again or dropped.
#[derive(Debug, thiserror::Error)]
#[error("transaction not committed: {source}")]
pub struct CommitError {
    pub pending: Box<PendingTransaction>,
    pub source: ClientError,
}

impl CommitError {
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

impl From<CommitError> for ClientError {
    fn from(err: CommitError) -> Self {
        err.source
    }
}

/// Calls ready for signing plus the local effects to apply once they are sent.
/// Dropping it without committing releases the input notes.
#[derive(Debug)]
pub struct PendingTransaction {
    pub kind: TxKind,
    pub calls: CallSequence,
    pub outputs: Vec<Note>,
    pub quote: Option<SwapQuote>,
    lease: Option<SpendLease>,
    effect: Option<PositionEffect>,
}

impl PendingTransaction {
    fn new(kind: TxKind, calls: CallSequence) -> Self {
        Self {
            kind,
            calls,
            outputs: Vec::new(),
            quote: None,
            lease: None,
            effect: None,
        }
    }

    pub fn inputs(&self) -> Vec<Felt> {
        self.lease
            .as_ref()
            .map(SpendLease::commitments)
            .unwrap_or_default()
    }
}

/// The three stateful components, each backed by its own persistence.
pub struct Stores {
    pub notes: NoteStore,
    pub history: Arc<HistoryLedger>,
    pub sync: Arc<StateSync>,
}

impl Stores {
    /// Encrypted notes (key from `ZYLITH_VAULT_KEY`) and plain JSON for history and pool state.
    pub fn open(config: &WalletConfig) -> Result<Self, ClientError> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            notes: NoteStore::load(NoteVault::from_env(config.notes_path())?)?,
            history: Arc::new(HistoryLedger::load(JsonFileStore::new(config.history_path()))?),
            sync: Arc::new(StateSync::load(JsonFileStore::new(config.sync_path()))?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            notes: NoteStore::new(Vec::new(), MemoryStore::<Vec<NoteRecord>>::new()),
            history: Arc::new(HistoryLedger::new(
                Vec::new(),
                MemoryStore::<Vec<TransactionRecord>>::new(),
            )),
            sync: Arc::new(StateSync::new(
                SyncSnapshot::default(),
                MemoryStore::<SyncSnapshot>::new(),
            )),
        }
    }
}

pub struct Session<P> {
    notes: NoteStore,
    history: Arc<HistoryLedger>,
    sync: Arc<StateSync>,
    orchestrator: ProofOrchestrator<P>,
    builder: TransactionBuilder,
    asp: AspClient,
    pool_address: Address,
    token0: Address,
    token1: Address,
    pool_fee: u128,
}

impl<P: ProverService> Session<P> {
    pub fn new(config: &WalletConfig, prover: P, stores: Stores, asp: AspClient) -> Self {
        let orchestrator = ProofOrchestrator::new(prover, config.tree_depth)
            .with_strict_validation(config.strict_validation)
            .with_max_price_impact_bps(config.max_price_impact_bps);
        Self {
            notes: stores.notes,
            history: stores.history,
            sync: stores.sync,
            orchestrator,
            builder: TransactionBuilder::new(config.pool_address),
            asp,
            pool_address: config.pool_address,
            token0: config.token0,
            token1: config.token1,
            pool_fee: config.pool_fee,
        }
    }

    pub fn open(config: &WalletConfig, prover: P) -> Result<Self, ClientError> {
        let stores = Stores::open(config)?;
        let asp = AspClient::with_timeout(config.asp_url.clone(), config.asp_timeout)?
            .with_retry(config.retry.clone());
        Ok(Self::new(config, prover, stores, asp))
    }

    pub fn notes(&self) -> &NoteStore {
        &self.notes
    }

    pub fn history(&self) -> &HistoryLedger {
        &self.history
    }

    pub fn state(&self) -> &StateSync {
        &self.sync
    }

    pub fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    pub fn balance(&self, token: Address) -> Result<u128, ClientError> {
        self.notes.total_balance(token)
    }

    /// `approve` plus `private_deposit` for a fresh note. The note is stored on commit.
    pub fn deposit(&self, token: Address, amount: u128) -> Result<PendingTransaction, ClientError> {
        self.check_token(token)?;
        if amount == 0 {
            return Err(ClientError::Validation("deposit amount must be > 0".to_string()));
        }
        let note = Note::random(amount, token)?;
        let inputs = ProofInputs::new()
            .with("secret", InputValue::Felt(note.secret))
            .with("nullifier", InputValue::Felt(note.nullifier))
            .with("amount", InputValue::U128(amount))
            .with("token", InputValue::Felt(token));
        self.orchestrator.validate(Operation::Deposit, &inputs)?;

        let calls = self.builder.build_deposit(token, amount, note.commitment)?;
        info!(token = %felt_to_hex(&token), amount, commitment = %felt_to_hex(&note.commitment), "deposit prepared");
        let mut pending = PendingTransaction::new(TxKind::Deposit, calls);
        pending.outputs.push(note);
        Ok(pending)
    }

    /// Exact-input quote against the synced pool state.
    pub fn quote_swap(&self, zero_for_one: bool, amount_in: u128) -> Result<SwapQuote, ClientError> {
        let pool = self.synced_pool()?;
        quote_exact_input(
            &pool.sqrt_price_x128.to_biguint(),
            pool.liquidity,
            amount_in,
            zero_for_one,
            self.pool_fee,
        )
    }

    /// Swaps `amount_specified` out of one note. The single output commitment holds the unswapped
    /// remainder of the input token, or the output leg when the note is swapped in full.
    /// With a remainder the `amount_out` leg is settled by the pool contract against the proof
    /// and is not tracked as a local note; swap a whole note to keep the output shielded.
    pub async fn swap(&self, intent: SwapIntent) -> Result<PendingTransaction, ClientError> {
        let (token_in, token_out) = if intent.zero_for_one {
            (self.token0, self.token1)
        } else {
            (self.token1, self.token0)
        };
        let pool = self.synced_pool()?;
        let quote = quote_exact_input(
            &pool.sqrt_price_x128.to_biguint(),
            pool.liquidity,
            intent.amount_specified,
            intent.zero_for_one,
            self.pool_fee,
        )?;
        self.orchestrator.guard_price_impact(&quote)?;

        let lease = self.notes.select_spendable(token_in, intent.amount_specified)?;
        let input = single_note(&lease, Operation::Swap)?;
        let membership = self.membership(&input).await?;
        let remainder = input.amount - intent.amount_specified;
        let output = if remainder > 0 {
            Note::random(remainder, token_in)?
        } else {
            Note::random(quote.amount_out, token_out)?
        };

        let mut inputs = ProofInputs::new()
            .with("nullifier", InputValue::Felt(input.nullifier))
            .with("secret_in", InputValue::Felt(input.secret))
            .with("amount_in", InputValue::U128(input.amount))
            .with("new_commitment", InputValue::Felt(output.commitment))
            .with("secret_out", InputValue::Felt(output.secret))
            .with("nullifier_out", InputValue::Felt(output.nullifier))
            .with("amount_out", InputValue::U128(output.amount))
            .with("amount_specified", InputValue::U128(intent.amount_specified))
            .with("zero_for_one", InputValue::Bool(intent.zero_for_one))
            .with("amount0_delta", InputValue::I128(quote.amount0_delta))
            .with("amount1_delta", InputValue::I128(quote.amount1_delta))
            .with("new_sqrt_price_x128", InputValue::U256(quote.sqrt_price_after.to_u256()))
            .with("new_tick", InputValue::I32(quote.tick_after))
            .with("sqrt_price_old", InputValue::U256(pool.sqrt_price_x128.to_u256()))
            .with("liquidity", InputValue::U128(pool.liquidity));
        membership.apply_to(&mut inputs);
        let response = self.orchestrator.prove(Operation::Swap, inputs).await?;

        let sqrt_price_limit = match intent.sqrt_price_limit {
            Some(limit) => limit,
            None => default_price_limit(intent.zero_for_one)?,
        };
        let prepared = self.builder.prepare(&EntryPointCall::Swap {
            zero_for_one: intent.zero_for_one,
            amount_specified: intent.amount_specified,
            sqrt_price_limit,
            new_commitment: output.commitment,
        });
        let calls = self.builder.build(&prepared, &response)?;
        info!(
            amount_specified = intent.amount_specified,
            zero_for_one = intent.zero_for_one,
            amount_out = quote.amount_out,
            "swap prepared"
        );
        let mut pending = PendingTransaction::new(TxKind::Swap, calls);
        pending.outputs.push(output);
        pending.quote = Some(quote);
        pending.lease = Some(lease);
        Ok(pending)
    }

    /// One withdraw proof per selected note, each releasing its whole note. When the last note
    /// holds more than is still owed it is paid to `change_to` (the signing account), which
    /// forwards the owed part to the recipient and re-shields the excess in the same sequence.
    pub async fn withdraw(
        &self,
        token: Address,
        amount: u128,
        recipient: Address,
        change_to: Option<Address>,
    ) -> Result<PendingTransaction, ClientError> {
        self.check_token(token)?;
        if recipient == Felt::ZERO || change_to == Some(Felt::ZERO) {
            return Err(ClientError::Validation("recipient cannot be zero".to_string()));
        }
        let lease = self.notes.select_spendable(token, amount)?;
        let excess = lease.total().saturating_sub(amount);
        if excess > 0 && change_to.is_none() {
            return Err(ClientError::Validation(format!(
                "selected notes exceed the withdraw by {excess}; a change address is required"
            )));
        }

        let mut calls = CallSequence::default();
        let mut outputs = Vec::new();
        let mut remaining = amount;
        for note in lease.notes() {
            let owed = note.amount.min(remaining);
            remaining -= owed;
            let change = note.amount - owed;
            let payee = match change_to {
                Some(address) if change > 0 => address,
                _ => recipient,
            };
            let membership = self.membership(note).await?;
            let mut inputs = ProofInputs::new()
                .with("nullifier", InputValue::Felt(note.nullifier))
                .with("secret", InputValue::Felt(note.secret))
                .with("recipient", InputValue::Felt(payee))
                .with("amount", InputValue::U128(note.amount));
            membership.apply_to(&mut inputs);
            let response = self.orchestrator.prove(Operation::Withdraw, inputs).await?;
            let prepared = self.builder.prepare(&EntryPointCall::Withdraw {
                token,
                recipient: payee,
                amount: note.amount,
            });
            calls.calls.extend(self.builder.build(&prepared, &response)?.calls);

            if change == 0 {
                continue;
            }
            if payee != recipient {
                let transfer = self.builder.prepare(&EntryPointCall::Transfer {
                    token,
                    recipient,
                    amount: U256Words::from_u128(owed),
                });
                calls.calls.extend(self.builder.build_plain(&transfer)?.calls);
            }
            let change_note = Note::random(change, token)?;
            calls
                .calls
                .extend(self.builder.build_deposit(token, change, change_note.commitment)?.calls);
            outputs.push(change_note);
        }
        info!(
            token = %felt_to_hex(&token),
            amount,
            notes = lease.notes().len(),
            change = excess,
            "withdraw prepared"
        );
        let mut pending = PendingTransaction::new(TxKind::Withdraw, calls);
        pending.outputs = outputs;
        pending.lease = Some(lease);
        Ok(pending)
    }

    /// Single-sided mint: the range must sit entirely above or below the current price.
    pub async fn mint(&self, intent: MintIntent) -> Result<PendingTransaction, ClientError> {
        let pool = self.synced_pool()?;
        let (amount0, amount1) = liquidity_amounts(
            &pool.sqrt_price_x128.to_biguint(),
            intent.tick_lower,
            intent.tick_upper,
            intent.liquidity,
            true,
        )?;
        let (token, needed) = single_leg(self.token0, amount0, self.token1, amount1, "mint")?;

        let lease = self.notes.select_spendable(token, needed)?;
        let input = single_note(&lease, Operation::Mint)?;
        let membership = self.membership(&input).await?;
        let position = Note::random_position(intent.tick_lower, intent.tick_upper, intent.liquidity)?;
        let change = Note::random(input.amount - needed, token)?;

        let mut inputs = ProofInputs::new()
            .with("nullifier", InputValue::Felt(input.nullifier))
            .with("tick_lower", InputValue::I32(intent.tick_lower))
            .with("tick_upper", InputValue::I32(intent.tick_upper))
            .with("liquidity", InputValue::U128(intent.liquidity))
            .with("new_commitment", InputValue::Felt(change.commitment))
            .with("position_commitment", InputValue::Felt(position.commitment))
            .with("secret_in", InputValue::Felt(input.secret))
            .with("amount_in", InputValue::U128(input.amount))
            .with("secret_out", InputValue::Felt(change.secret))
            .with("nullifier_out", InputValue::Felt(change.nullifier))
            .with("amount_out", InputValue::U128(change.amount));
        membership.apply_to(&mut inputs);
        let response = self.orchestrator.prove(Operation::Mint, inputs).await?;

        let prepared = self.builder.prepare(&EntryPointCall::MintLiquidity {
            tick_lower: intent.tick_lower,
            tick_upper: intent.tick_upper,
            liquidity: intent.liquidity,
            new_commitment: change.commitment,
        });
        let calls = self.builder.build(&prepared, &response)?;
        info!(
            tick_lower = intent.tick_lower,
            tick_upper = intent.tick_upper,
            liquidity = intent.liquidity,
            token = %felt_to_hex(&token),
            needed,
            "mint prepared"
        );
        let mut pending = PendingTransaction::new(TxKind::Mint, calls);
        pending.effect = Some(PositionEffect::Open {
            commitment: position.commitment,
            tick_lower: intent.tick_lower,
            tick_upper: intent.tick_upper,
            liquidity: intent.liquidity,
        });
        pending.outputs = vec![position, change];
        pending.lease = Some(lease);
        Ok(pending)
    }

    /// Burns a whole position note into one token note. Only fields the burn needs are sent.
    pub async fn burn(&self, position_commitment: Felt) -> Result<PendingTransaction, ClientError> {
        let record = self
            .notes
            .get(&position_commitment)
            .ok_or_else(|| ClientError::NoteNotFound(felt_to_hex(&position_commitment)))?;
        let range = record.note.position.ok_or_else(|| {
            ClientError::Validation(format!(
                "note {} is not a position note",
                felt_to_hex(&position_commitment)
            ))
        })?;
        let pool = self.synced_pool()?;
        let lease = self.notes.lease_note(position_commitment)?;
        let position = single_note(&lease, Operation::Burn)?;
        let (amount0, amount1) = liquidity_amounts(
            &pool.sqrt_price_x128.to_biguint(),
            range.tick_lower,
            range.tick_upper,
            position.amount,
            false,
        )?;
        let (token, amount_out) = single_leg(self.token0, amount0, self.token1, amount1, "burn")?;
        let membership = self.membership(&position).await?;
        let output = Note::random(amount_out, token)?;

        let mut inputs = ProofInputs::new()
            .with("nullifier", InputValue::Felt(position.nullifier))
            .with("secret", InputValue::Felt(position.secret))
            .with("tick_lower", InputValue::I32(range.tick_lower))
            .with("tick_upper", InputValue::I32(range.tick_upper))
            .with("liquidity", InputValue::U128(position.amount))
            .with("new_commitment", InputValue::Felt(output.commitment))
            .with("position_commitment", InputValue::Felt(position.commitment))
            .with("secret_out", InputValue::Felt(output.secret))
            .with("nullifier_out", InputValue::Felt(output.nullifier))
            .with("amount_out", InputValue::U128(output.amount));
        membership.apply_to(&mut inputs);
        let response = self.orchestrator.prove(Operation::Burn, inputs).await?;

        let prepared = self.builder.prepare(&EntryPointCall::BurnLiquidity {
            tick_lower: range.tick_lower,
            tick_upper: range.tick_upper,
            liquidity: position.amount,
            new_commitment: output.commitment,
        });
        let calls = self.builder.build(&prepared, &response)?;
        info!(position = %felt_to_hex(&position_commitment), amount_out, "burn prepared");
        let mut pending = PendingTransaction::new(TxKind::Burn, calls);
        pending.outputs.push(output);
        pending.lease = Some(lease);
        pending.effect = Some(PositionEffect::Close {
            commitment: position_commitment,
        });
        Ok(pending)
    }

    /// Pool initialization; defaults to a 0.3% fee, tick spacing 60 and price 1.
    pub fn initialize(
        &self,
        fee: Option<u128>,
        tick_spacing: Option<u32>,
        sqrt_price: Option<U256Words>,
    ) -> Result<PendingTransaction, ClientError> {
        let tick_spacing = tick_spacing.unwrap_or(DEFAULT_TICK_SPACING);
        if tick_spacing == 0 {
            return Err(ClientError::Validation("tick_spacing must be > 0".to_string()));
        }
        let sqrt_price = match sqrt_price {
            Some(price) => price,
            None => split(&q128())?,
        };
        let price = sqrt_price.to_biguint();
        if price < min_sqrt_ratio()? || price > max_sqrt_ratio()? {
            return Err(ClientError::Validation(format!(
                "sqrt price {sqrt_price} is outside the tick range"
            )));
        }
        let prepared = self.builder.prepare(&EntryPointCall::Initialize {
            token0: self.token0,
            token1: self.token1,
            fee: fee.unwrap_or(self.pool_fee),
            tick_spacing,
            sqrt_price,
        });
        let calls = self.builder.build_plain(&prepared)?;
        Ok(PendingTransaction::new(TxKind::Initialize, calls))
    }

    /// Applies the local effects of a sent transaction: records the hash as pending, stores
    /// outputs, tracks positions and spends the inputs last. Every step is idempotent for a
    /// given hash, so a failed commit hands the pending transaction back for another attempt.
    pub fn commit(
        &self,
        pending: PendingTransaction,
        tx_hash: Felt,
    ) -> Result<TransactionRecord, CommitError> {
        match self.apply_commit(&pending, tx_hash) {
            Ok(record) => Ok(record),
            Err(source) => {
                warn!(hash = %felt_to_hex(&tx_hash), error = %source, "commit incomplete");
                Err(CommitError {
                    pending: Box::new(pending),
                    source,
                })
            }
        }
    }

    fn apply_commit(
        &self,
        pending: &PendingTransaction,
        tx_hash: Felt,
    ) -> Result<TransactionRecord, ClientError> {
        let record = TransactionRecord::pending(tx_hash, pending.kind);
        self.history.record(record.clone())?;
        for note in &pending.outputs {
            self.notes.materialize_output(note.clone())?;
        }
        let observed_at = self
            .sync
            .pool(&self.pool_address)
            .map(|pool| pool.last_update_block)
            .unwrap_or(0);
        match pending.effect {
            Some(PositionEffect::Open {
                commitment,
                tick_lower,
                tick_upper,
                liquidity,
            }) => {
                self.sync
                    .open_position(commitment, tick_lower, tick_upper, liquidity, observed_at)?;
            }
            Some(PositionEffect::Close { commitment }) => {
                let id = position_id(commitment);
                if self.sync.position(&id).is_some() {
                    self.sync.apply_position_update(
                        id,
                        PositionUpdate {
                            observed_at,
                            liquidity: Some(0),
                            ..PositionUpdate::default()
                        },
                    )?;
                }
            }
            None => {}
        }
        if let Some(lease) = &pending.lease {
            lease.spend(tx_hash)?;
        }
        info!(hash = %felt_to_hex(&tx_hash), kind = ?pending.kind, "transaction committed");
        Ok(record)
    }

    /// Sends through `submitter` and commits. If sending fails the calls never left, and the
    /// pending transaction comes back untouched with the error.
    pub async fn submit<S: Submitter>(
        &self,
        pending: PendingTransaction,
        submitter: &S,
    ) -> Result<TransactionRecord, CommitError> {
        let tx_hash = match submitter.submit(&pending.calls).await {
            Ok(hash) => hash,
            Err(source) => {
                return Err(CommitError {
                    pending: Box::new(pending),
                    source,
                })
            }
        };
        self.commit(pending, tx_hash)
    }

    /// Confirms unconfirmed notes the ASP has indexed. Returns how many were confirmed.
    pub async fn refresh_notes(&self) -> Result<usize, ClientError> {
        let mut confirmed = 0;
        for record in self.notes.list() {
            if record.status != NoteStatus::Unconfirmed {
                continue;
            }
            if let Some(index) = self.asp.deposit_index(record.note.commitment).await? {
                self.notes.confirm(record.note.commitment, index)?;
                confirmed += 1;
            }
        }
        debug!(confirmed, "notes refreshed");
        Ok(confirmed)
    }

    pub async fn sync_pool<R: Provider + Send + Sync>(
        &self,
        chain: &ChainClient<R>,
    ) -> Result<PoolState, ClientError> {
        let update = chain.fetch_pool_state().await?;
        self.sync.apply_pool_update(self.pool_address, update)
    }

    /// Moves pending history rows to their on-chain outcome. Returns the rows that changed.
    pub async fn poll_status<R: Provider + Send + Sync>(
        &self,
        chain: &ChainClient<R>,
    ) -> Result<Vec<TransactionRecord>, ClientError> {
        let mut changed = Vec::new();
        for record in self.history.pending() {
            let status = chain.transaction_status(record.hash).await?;
            if status.is_terminal() && self.history.update_status(record.hash, status)? {
                if let Some(updated) = self.history.get(&record.hash) {
                    changed.push(updated);
                }
            }
        }
        Ok(changed)
    }

    /// Proves `commitment` sits at `index` in the ASP's associated set and that the proof is
    /// against the set's current root.
    pub async fn association_membership(
        &self,
        commitment: Felt,
        index: u64,
    ) -> Result<MerkleProof, ClientError> {
        let proof = self.asp.associated_proof(index).await?;
        if proof.leaf != commitment {
            return Err(ClientError::Validation(format!(
                "associated leaf {index} is {}, expected {}",
                felt_to_hex(&proof.leaf),
                felt_to_hex(&commitment)
            )));
        }
        proof.verify(self.orchestrator.tree_depth())?;
        let root = self.asp.associated_root().await?;
        if proof.root != root {
            warn!(index, root = %felt_to_hex(&root), "associated proof is behind the current root");
            return Err(ClientError::Validation(format!(
                "associated proof root {} is not the current root {}",
                felt_to_hex(&proof.root),
                felt_to_hex(&root)
            )));
        }
        debug!(index, commitment = %felt_to_hex(&commitment), "association membership verified");
        Ok(proof)
    }

    async fn membership(&self, note: &Note) -> Result<MerkleProof, ClientError> {
        let index = note.index.ok_or_else(|| {
            ClientError::Validation(format!(
                "note {} has no tree index yet",
                felt_to_hex(&note.commitment)
            ))
        })?;
        let proof = self.asp.merkle_proof(index).await?;
        if proof.leaf != note.commitment {
            warn!(index, leaf = %felt_to_hex(&proof.leaf), "asp leaf does not match note");
            return Err(ClientError::Validation(format!(
                "leaf {index} is {}, expected {}",
                felt_to_hex(&proof.leaf),
                felt_to_hex(&note.commitment)
            )));
        }
        proof.verify(self.orchestrator.tree_depth())?;
        Ok(proof)
    }

    fn synced_pool(&self) -> Result<PoolState, ClientError> {
        self.sync
            .pool(&self.pool_address)
            .filter(PoolState::is_initialized)
            .ok_or_else(|| ClientError::Validation("pool state has not been synced".to_string()))
    }

    fn check_token(&self, token: Address) -> Result<(), ClientError> {
        if token == self.token0 || token == self.token1 {
            Ok(())
        } else {
            Err(ClientError::Validation(format!(
                "token {} is not in this pool",
                felt_to_hex(&token)
            )))
        }
    }
}

/// The circuits consume exactly one input note.
fn single_note(lease: &SpendLease, operation: Operation) -> Result<Note, ClientError> {
    match lease.notes() {
        [note] => Ok(note.clone()),
        notes => Err(ClientError::Validation(format!(
            "{operation} needs one note covering the amount, selection has {}",
            notes.len()
        ))),
    }
}

fn single_leg(
    token0: Address,
    amount0: u128,
    token1: Address,
    amount1: u128,
    operation: &str,
) -> Result<(Address, u128), ClientError> {
    match (amount0, amount1) {
        (0, 0) => Err(ClientError::Validation(format!(
            "{operation} amounts round to zero"
        ))),
        (amount, 0) => Ok((token0, amount)),
        (0, amount) => Ok((token1, amount)),
        _ => Err(ClientError::Validation(format!(
            "{operation} range contains the current price; only single-sided ranges are supported"
        ))),
    }
}

fn default_price_limit(zero_for_one: bool) -> Result<U256Words, ClientError> {
    if zero_for_one {
        split(&(min_sqrt_ratio()? + 1u32))
    } else {
        split(&(max_sqrt_ratio()? - 1u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leg_rejects_straddling_ranges() {
        let (a, b) = (Felt::ONE, Felt::TWO);
        assert_eq!(single_leg(a, 5, b, 0, "mint").expect("token0"), (a, 5));
        assert_eq!(single_leg(a, 0, b, 7, "mint").expect("token1"), (b, 7));
        assert!(single_leg(a, 1, b, 1, "mint").is_err());
        assert!(single_leg(a, 0, b, 0, "mint").is_err());
    }

    #[test]
    fn default_limits_sit_inside_the_range() {
        let low = default_price_limit(true).expect("low").to_biguint();
        let high = default_price_limit(false).expect("high").to_biguint();
        assert!(low > min_sqrt_ratio().expect("min"));
        assert!(high < max_sqrt_ratio().expect("max"));
    }
}
