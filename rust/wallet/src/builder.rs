//! Ledger calls from prepared descriptors and proof responses.
//!
//! Proven calls lay their calldata out as
//! `[len(proof), ...proof, len(public_inputs), ...public_inputs, ...trailing]`. The prepared
//! descriptor only carries the trailing fields; the proof arrays are prepended at build time.

use serde::{Deserialize, Serialize};
use starknet::core::types::{Call, Felt};
use starknet::core::utils::get_selector_from_name;
use tracing::debug;
use zylith_prover::{Circuit, ProofResponse};

use crate::codec::{
    bool_to_felt, felt_to_bool, felt_to_hex, felt_to_i32, felt_to_u128, i32_to_felt, parse_felt,
    U256Words,
};
use crate::error::ClientError;
use crate::notes::Address;

pub const APPROVE: &str = "approve";
pub const TRANSFER: &str = "transfer";
pub const PRIVATE_DEPOSIT: &str = "private_deposit";
pub const PRIVATE_SWAP: &str = "private_swap";
pub const PRIVATE_WITHDRAW: &str = "private_withdraw";
pub const PRIVATE_MINT_LIQUIDITY: &str = "private_mint_liquidity";
pub const PRIVATE_BURN_LIQUIDITY: &str = "private_burn_liquidity";
pub const INITIALIZE: &str = "initialize";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub contract_address: Felt,
    pub entry_point: String,
    /// Hex field elements.
    pub calldata: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPointCall {
    /// ERC-20 allowance for the pool; sent to the token contract.
    Approve {
        token: Address,
        spender: Address,
        amount: U256Words,
    },
    /// ERC-20 transfer out of the signing account; sent to the token contract.
    Transfer {
        token: Address,
        recipient: Address,
        amount: U256Words,
    },
    Deposit {
        token: Address,
        amount: U256Words,
        commitment: Felt,
    },
    Swap {
        zero_for_one: bool,
        amount_specified: u128,
        sqrt_price_limit: U256Words,
        new_commitment: Felt,
    },
    Withdraw {
        token: Address,
        recipient: Address,
        amount: u128,
    },
    MintLiquidity {
        tick_lower: i32,
        tick_upper: i32,
        liquidity: u128,
        new_commitment: Felt,
    },
    BurnLiquidity {
        tick_lower: i32,
        tick_upper: i32,
        liquidity: u128,
        new_commitment: Felt,
    },
    Initialize {
        token0: Address,
        token1: Address,
        fee: u128,
        tick_spacing: u32,
        sqrt_price: U256Words,
    },
}

impl EntryPointCall {
    pub fn entry_point(&self) -> &'static str {
        match self {
            EntryPointCall::Approve { .. } => APPROVE,
            EntryPointCall::Transfer { .. } => TRANSFER,
            EntryPointCall::Deposit { .. } => PRIVATE_DEPOSIT,
            EntryPointCall::Swap { .. } => PRIVATE_SWAP,
            EntryPointCall::Withdraw { .. } => PRIVATE_WITHDRAW,
            EntryPointCall::MintLiquidity { .. } => PRIVATE_MINT_LIQUIDITY,
            EntryPointCall::BurnLiquidity { .. } => PRIVATE_BURN_LIQUIDITY,
            EntryPointCall::Initialize { .. } => INITIALIZE,
        }
    }

    pub fn proof_circuit(&self) -> Option<Circuit> {
        circuit_for(self.entry_point())
    }

    pub fn expected_public_inputs(&self) -> usize {
        self.proof_circuit()
            .map(|circuit| circuit.public_input_len())
            .unwrap_or(0)
    }

    /// Target contract: the token for approvals and transfers, the pool otherwise.
    pub fn contract(&self, pool_address: Address) -> Address {
        match self {
            EntryPointCall::Approve { token, .. } | EntryPointCall::Transfer { token, .. } => *token,
            _ => pool_address,
        }
    }

    pub fn trailing_calldata(&self) -> Vec<Felt> {
        match self {
            EntryPointCall::Approve {
                spender, amount, ..
            } => vec![*spender, Felt::from(amount.low), Felt::from(amount.high)],
            EntryPointCall::Transfer {
                recipient, amount, ..
            } => vec![*recipient, Felt::from(amount.low), Felt::from(amount.high)],
            EntryPointCall::Deposit {
                token,
                amount,
                commitment,
            } => vec![
                *token,
                Felt::from(amount.low),
                Felt::from(amount.high),
                *commitment,
            ],
            EntryPointCall::Swap {
                zero_for_one,
                amount_specified,
                sqrt_price_limit,
                new_commitment,
            } => vec![
                bool_to_felt(*zero_for_one),
                Felt::from(*amount_specified),
                Felt::from(sqrt_price_limit.low),
                Felt::from(sqrt_price_limit.high),
                *new_commitment,
            ],
            EntryPointCall::Withdraw {
                token,
                recipient,
                amount,
            } => vec![*token, *recipient, Felt::from(*amount)],
            EntryPointCall::MintLiquidity {
                tick_lower,
                tick_upper,
                liquidity,
                new_commitment,
            }
            | EntryPointCall::BurnLiquidity {
                tick_lower,
                tick_upper,
                liquidity,
                new_commitment,
            } => vec![
                i32_to_felt(*tick_lower),
                i32_to_felt(*tick_upper),
                Felt::from(*liquidity),
                *new_commitment,
            ],
            EntryPointCall::Initialize {
                token0,
                token1,
                fee,
                tick_spacing,
                sqrt_price,
            } => vec![
                *token0,
                *token1,
                Felt::from(*fee),
                Felt::from(*tick_spacing),
                Felt::from(sqrt_price.low),
                Felt::from(sqrt_price.high),
            ],
        }
    }

    /// Parses a prepared descriptor back into its entry point. Unknown entry points and missing
    /// or extra calldata fields are rejected.
    pub fn from_prepared(prepared: &PreparedTransaction) -> Result<Self, ClientError> {
        let expected = trailing_len(&prepared.entry_point).ok_or_else(|| {
            ClientError::Validation(format!("unknown entry point {}", prepared.entry_point))
        })?;
        if prepared.calldata.len() != expected {
            return Err(ClientError::Validation(format!(
                "{} expects {expected} calldata fields, got {}",
                prepared.entry_point,
                prepared.calldata.len()
            )));
        }
        let f = prepared
            .calldata
            .iter()
            .map(|value| parse_felt(value))
            .collect::<Result<Vec<Felt>, ClientError>>()?;
        let words = |low: &Felt, high: &Felt| -> Result<U256Words, ClientError> {
            Ok(U256Words::new(felt_to_u128(low)?, felt_to_u128(high)?))
        };
        let call = match prepared.entry_point.as_str() {
            APPROVE => EntryPointCall::Approve {
                token: prepared.contract_address,
                spender: f[0],
                amount: words(&f[1], &f[2])?,
            },
            TRANSFER => EntryPointCall::Transfer {
                token: prepared.contract_address,
                recipient: f[0],
                amount: words(&f[1], &f[2])?,
            },
            PRIVATE_DEPOSIT => EntryPointCall::Deposit {
                token: f[0],
                amount: words(&f[1], &f[2])?,
                commitment: f[3],
            },
            PRIVATE_SWAP => EntryPointCall::Swap {
                zero_for_one: felt_to_bool(&f[0])?,
                amount_specified: felt_to_u128(&f[1])?,
                sqrt_price_limit: words(&f[2], &f[3])?,
                new_commitment: f[4],
            },
            PRIVATE_WITHDRAW => EntryPointCall::Withdraw {
                token: f[0],
                recipient: f[1],
                amount: felt_to_u128(&f[2])?,
            },
            PRIVATE_MINT_LIQUIDITY => EntryPointCall::MintLiquidity {
                tick_lower: felt_to_i32(&f[0])?,
                tick_upper: felt_to_i32(&f[1])?,
                liquidity: felt_to_u128(&f[2])?,
                new_commitment: f[3],
            },
            PRIVATE_BURN_LIQUIDITY => EntryPointCall::BurnLiquidity {
                tick_lower: felt_to_i32(&f[0])?,
                tick_upper: felt_to_i32(&f[1])?,
                liquidity: felt_to_u128(&f[2])?,
                new_commitment: f[3],
            },
            INITIALIZE => EntryPointCall::Initialize {
                token0: f[0],
                token1: f[1],
                fee: felt_to_u128(&f[2])?,
                tick_spacing: u32::try_from(felt_to_u128(&f[3])?).map_err(|_| {
                    ClientError::Validation("tick_spacing exceeds u32".to_string())
                })?,
                sqrt_price: words(&f[4], &f[5])?,
            },
            other => {
                return Err(ClientError::Validation(format!("unknown entry point {other}")));
            }
        };
        match &call {
            EntryPointCall::MintLiquidity {
                tick_lower,
                tick_upper,
                ..
            }
            | EntryPointCall::BurnLiquidity {
                tick_lower,
                tick_upper,
                ..
            } if tick_lower >= tick_upper => {
                return Err(ClientError::Validation(format!(
                    "tick_lower {tick_lower} must be below tick_upper {tick_upper}"
                )));
            }
            _ => {}
        }
        Ok(call)
    }
}

fn trailing_len(entry_point: &str) -> Option<usize> {
    Some(match entry_point {
        APPROVE | TRANSFER => 3,
        PRIVATE_DEPOSIT => 4,
        PRIVATE_SWAP => 5,
        PRIVATE_WITHDRAW => 3,
        PRIVATE_MINT_LIQUIDITY | PRIVATE_BURN_LIQUIDITY => 4,
        INITIALIZE => 6,
        _ => return None,
    })
}

fn circuit_for(entry_point: &str) -> Option<Circuit> {
    match entry_point {
        PRIVATE_SWAP => Some(Circuit::Swap),
        PRIVATE_WITHDRAW => Some(Circuit::Withdraw),
        PRIVATE_MINT_LIQUIDITY | PRIVATE_BURN_LIQUIDITY => Some(Circuit::Lp),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub contract_address: Felt,
    pub entry_point: String,
    pub calldata: Vec<Felt>,
}

impl LedgerCall {
    pub fn to_call(&self) -> Result<Call, ClientError> {
        let selector = get_selector_from_name(&self.entry_point)
            .map_err(|err| ClientError::Validation(err.to_string()))?;
        Ok(Call {
            to: self.contract_address,
            selector,
            calldata: self.calldata.clone(),
        })
    }

    pub fn to_prepared(&self) -> PreparedTransaction {
        PreparedTransaction {
            contract_address: self.contract_address,
            entry_point: self.entry_point.clone(),
            calldata: self.calldata.iter().map(felt_to_hex).collect(),
        }
    }
}

/// Calls in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSequence {
    pub calls: Vec<LedgerCall>,
}

impl CallSequence {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn to_calls(&self) -> Result<Vec<Call>, ClientError> {
        self.calls.iter().map(LedgerCall::to_call).collect()
    }

    pub fn to_prepared(&self) -> Vec<PreparedTransaction> {
        self.calls.iter().map(LedgerCall::to_prepared).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    pool_address: Address,
}

impl TransactionBuilder {
    pub fn new(pool_address: Address) -> Self {
        Self { pool_address }
    }

    pub fn pool_address(&self) -> Address {
        self.pool_address
    }

    pub fn prepare(&self, call: &EntryPointCall) -> PreparedTransaction {
        PreparedTransaction {
            contract_address: call.contract(self.pool_address),
            entry_point: call.entry_point().to_string(),
            calldata: call.trailing_calldata().iter().map(felt_to_hex).collect(),
        }
    }

    pub fn build(
        &self,
        prepared: &PreparedTransaction,
        proof: &ProofResponse,
    ) -> Result<CallSequence, ClientError> {
        let call = EntryPointCall::from_prepared(prepared)?;
        let expected = call.expected_public_inputs();
        if call.proof_circuit().is_none() || proof.public_inputs.len() != expected {
            return Err(ClientError::IncompatibleProof {
                entry_point: prepared.entry_point.clone(),
                expected,
                actual: proof.public_inputs.len(),
            });
        }
        let mut calldata = Vec::with_capacity(proof.proof.len() + expected + 8);
        for value in proof.proof_calldata().iter().chain(proof.public_inputs_calldata().iter()) {
            calldata.push(parse_felt(value).map_err(|_| {
                ClientError::MalformedProofResponse(format!("{value} is not a field element"))
            })?);
        }
        calldata.extend(call.trailing_calldata());
        debug!(
            entry_point = %prepared.entry_point,
            calldata_len = calldata.len(),
            "built proven call"
        );
        Ok(CallSequence {
            calls: vec![LedgerCall {
                contract_address: prepared.contract_address,
                entry_point: prepared.entry_point.clone(),
                calldata,
            }],
        })
    }

    /// Calls that take no proof.
    pub fn build_plain(&self, prepared: &PreparedTransaction) -> Result<CallSequence, ClientError> {
        let call = EntryPointCall::from_prepared(prepared)?;
        if call.proof_circuit().is_some() {
            return Err(ClientError::IncompatibleProof {
                entry_point: prepared.entry_point.clone(),
                expected: call.expected_public_inputs(),
                actual: 0,
            });
        }
        Ok(CallSequence {
            calls: vec![LedgerCall {
                contract_address: prepared.contract_address,
                entry_point: prepared.entry_point.clone(),
                calldata: call.trailing_calldata(),
            }],
        })
    }

    /// `approve(pool, amount)` on the token followed by `private_deposit`.
    pub fn build_deposit(
        &self,
        token: Address,
        amount: u128,
        commitment: Felt,
    ) -> Result<CallSequence, ClientError> {
        let amount = U256Words::from_u128(amount);
        let approve = self.prepare(&EntryPointCall::Approve {
            token,
            spender: self.pool_address,
            amount,
        });
        let deposit = self.prepare(&EntryPointCall::Deposit {
            token,
            amount,
            commitment,
        });
        let mut sequence = self.build_plain(&approve)?;
        sequence.calls.extend(self.build_plain(&deposit)?.calls);
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Address {
        Felt::from(0x9001u32)
    }

    fn proof(public_inputs: usize) -> ProofResponse {
        ProofResponse::new(
            (1..=8).map(|i| i.to_string()).collect(),
            (0..public_inputs).map(|i| format!("0x{:x}", 100 + i)).collect(),
        )
    }

    #[test]
    fn withdraw_calldata_layout() {
        let builder = TransactionBuilder::new(pool());
        let prepared = builder.prepare(&EntryPointCall::Withdraw {
            token: Felt::from(0x70u32),
            recipient: Felt::from(0x80u32),
            amount: 1_000,
        });
        assert_eq!(prepared.calldata, vec!["0x70", "0x80", "0x3e8"]);
        let sequence = builder.build(&prepared, &proof(4)).expect("build");
        let calldata = &sequence.calls[0].calldata;
        assert_eq!(calldata.len(), 1 + 8 + 1 + 4 + 3);
        assert_eq!(calldata[0], Felt::from(8u8));
        assert_eq!(calldata[1], Felt::ONE);
        assert_eq!(calldata[9], Felt::from(4u8));
        assert_eq!(calldata[10], Felt::from(100u8));
        assert_eq!(&calldata[14..], &[Felt::from(0x70u32), Felt::from(0x80u32), Felt::from(1_000u32)]);
        assert_eq!(sequence.calls[0].contract_address, pool());
    }

    #[test]
    fn build_is_reproducible() {
        let builder = TransactionBuilder::new(pool());
        let prepared = builder.prepare(&EntryPointCall::Swap {
            zero_for_one: true,
            amount_specified: 500_000,
            sqrt_price_limit: U256Words::new(0, 1),
            new_commitment: Felt::from(77u8),
        });
        let a = builder.build(&prepared, &proof(9)).expect("a");
        let b = builder.build(&prepared, &proof(9)).expect("b");
        assert_eq!(a, b);
        assert_eq!(
            a.calls[0].calldata[a.calls[0].calldata.len() - 5..],
            [Felt::ONE, Felt::from(500_000u32), Felt::ZERO, Felt::ONE, Felt::from(77u8)]
        );
    }

    #[test]
    fn public_input_count_must_match_entry_point() {
        let builder = TransactionBuilder::new(pool());
        let prepared = builder.prepare(&EntryPointCall::MintLiquidity {
            tick_lower: -60,
            tick_upper: 60,
            liquidity: 10,
            new_commitment: Felt::ONE,
        });
        match builder.build(&prepared, &proof(9)) {
            Err(ClientError::IncompatibleProof {
                entry_point,
                expected,
                actual,
            }) => {
                assert_eq!(entry_point, PRIVATE_MINT_LIQUIDITY);
                assert_eq!(expected, 7);
                assert_eq!(actual, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
        builder.build(&prepared, &proof(7)).expect("lp");
    }

    #[test]
    fn proofs_are_refused_for_plain_entry_points() {
        let builder = TransactionBuilder::new(pool());
        let prepared = builder.prepare(&EntryPointCall::Initialize {
            token0: Felt::ONE,
            token1: Felt::TWO,
            fee: 3000,
            tick_spacing: 60,
            sqrt_price: U256Words::new(0, 1),
        });
        assert!(matches!(
            builder.build(&prepared, &proof(0)),
            Err(ClientError::IncompatibleProof { .. })
        ));
        let plain = builder.build_plain(&prepared).expect("plain");
        assert_eq!(plain.calls[0].calldata.len(), 6);
    }

    #[test]
    fn deposit_approves_before_depositing() {
        let builder = TransactionBuilder::new(pool());
        let token = Felt::from(0x70u32);
        let sequence = builder
            .build_deposit(token, 1_000_000, Felt::from(5u8))
            .expect("deposit");
        assert_eq!(sequence.len(), 2);
        assert_eq!(sequence.calls[0].entry_point, APPROVE);
        assert_eq!(sequence.calls[0].contract_address, token);
        assert_eq!(sequence.calls[0].calldata, vec![pool(), Felt::from(1_000_000u32), Felt::ZERO]);
        assert_eq!(sequence.calls[1].entry_point, PRIVATE_DEPOSIT);
        assert_eq!(
            sequence.calls[1].calldata,
            vec![token, Felt::from(1_000_000u32), Felt::ZERO, Felt::from(5u8)]
        );
        let calls = sequence.to_calls().expect("calls");
        assert_eq!(
            calls[1].selector,
            get_selector_from_name(PRIVATE_DEPOSIT).expect("selector")
        );
    }

    #[test]
    fn transfer_targets_the_token() {
        let builder = TransactionBuilder::new(pool());
        let call = EntryPointCall::Transfer {
            token: Felt::from(0x70u32),
            recipient: Felt::from(0x80u32),
            amount: U256Words::from_u128(200),
        };
        let prepared = builder.prepare(&call);
        assert_eq!(prepared.contract_address, Felt::from(0x70u32));
        assert_eq!(prepared.calldata, vec!["0x80", "0xc8", "0x0"]);
        assert_eq!(EntryPointCall::from_prepared(&prepared).expect("parse"), call);
        let sequence = builder.build_plain(&prepared).expect("plain");
        assert_eq!(sequence.calls[0].entry_point, TRANSFER);
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        let unknown = PreparedTransaction {
            contract_address: pool(),
            entry_point: "private_teleport".to_string(),
            calldata: Vec::new(),
        };
        assert!(EntryPointCall::from_prepared(&unknown).is_err());

        let extra = PreparedTransaction {
            contract_address: pool(),
            entry_point: PRIVATE_WITHDRAW.to_string(),
            calldata: vec!["0x1".into(), "0x2".into(), "0x3".into(), "0x4".into()],
        };
        assert!(matches!(
            EntryPointCall::from_prepared(&extra),
            Err(ClientError::Validation(_))
        ));

        let inverted = PreparedTransaction {
            contract_address: pool(),
            entry_point: PRIVATE_BURN_LIQUIDITY.to_string(),
            calldata: vec![
                felt_to_hex(&i32_to_felt(60)),
                felt_to_hex(&i32_to_felt(-60)),
                "0x1".into(),
                "0x2".into(),
            ],
        };
        assert!(EntryPointCall::from_prepared(&inverted).is_err());
    }

    #[test]
    fn prepared_descriptor_parses_back() {
        let builder = TransactionBuilder::new(pool());
        let call = EntryPointCall::BurnLiquidity {
            tick_lower: -120,
            tick_upper: 60,
            liquidity: 42,
            new_commitment: Felt::from(3u8),
        };
        let prepared = builder.prepare(&call);
        assert_eq!(EntryPointCall::from_prepared(&prepared).expect("parse"), call);
    }
}
