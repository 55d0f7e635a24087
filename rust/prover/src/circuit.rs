//! Circuit identifiers understood by the proving service.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProverError;

/// Groth16 proofs carry A, B and C; the verifier needs at least eight limbs to rebuild them.
pub const MIN_PROOF_ELEMENTS: usize = 8;

pub const SWAP_PUBLIC_INPUTS: [&str; 9] = [
    "nullifier",
    "root",
    "new_commitment",
    "amount_specified",
    "zero_for_one",
    "amount0_delta",
    "amount1_delta",
    "new_sqrt_price_x128",
    "new_tick",
];

pub const WITHDRAW_PUBLIC_INPUTS: [&str; 4] = ["nullifier", "root", "recipient", "amount"];

pub const LP_PUBLIC_INPUTS: [&str; 7] = [
    "nullifier",
    "root",
    "tick_lower",
    "tick_upper",
    "liquidity",
    "new_commitment",
    "position_commitment",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Circuit {
    Swap,
    Withdraw,
    /// Shared by liquidity mint and burn.
    Lp,
}

impl Circuit {
    pub fn id(&self) -> &'static str {
        match self {
            Circuit::Swap => "swap",
            Circuit::Withdraw => "withdraw",
            Circuit::Lp => "lp",
        }
    }

    /// Names of the public inputs in the order the verifier reads them.
    pub fn public_inputs(&self) -> &'static [&'static str] {
        match self {
            Circuit::Swap => &SWAP_PUBLIC_INPUTS,
            Circuit::Withdraw => &WITHDRAW_PUBLIC_INPUTS,
            Circuit::Lp => &LP_PUBLIC_INPUTS,
        }
    }

    pub fn public_input_len(&self) -> usize {
        self.public_inputs().len()
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Circuit {
    type Err = ProverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "swap" => Ok(Circuit::Swap),
            "withdraw" => Ok(Circuit::Withdraw),
            "lp" => Ok(Circuit::Lp),
            other => Err(ProverError::InvalidInput(format!("unknown circuit {other}"))),
        }
    }
}
