//! Proof requests per operation: presence and format checks, dispatch, response validation.

use serde_json::Value;
use starknet::core::types::Felt;
use tracing::{debug, info, warn};
use zylith_prover::{Circuit, ProofInputs, ProofRequest, ProofResponse, ProverService, MIN_PROOF_ELEMENTS};

use crate::codec::{felt_to_hex, parse_felt, parse_signed, parse_u128, parse_u256, signed_to_felt};
use crate::curve::{check_tick, SwapQuote};
use crate::error::ClientError;
use crate::history::TxKind;

const DEPOSIT_FIELDS: &[&str] = &["secret", "nullifier", "amount", "token"];
const SWAP_FIELDS: &[&str] = &[
    "nullifier",
    "root",
    "new_commitment",
    "amount_specified",
    "zero_for_one",
    "amount0_delta",
    "amount1_delta",
    "new_sqrt_price_x128",
    "new_tick",
    "secret_in",
    "amount_in",
    "secret_out",
    "nullifier_out",
    "amount_out",
    "pathElements",
    "pathIndices",
    "sqrt_price_old",
    "liquidity",
];
const WITHDRAW_FIELDS: &[&str] = &[
    "nullifier",
    "root",
    "recipient",
    "amount",
    "pathElements",
    "pathIndices",
];
const MINT_FIELDS: &[&str] = &[
    "nullifier",
    "root",
    "tick_lower",
    "tick_upper",
    "liquidity",
    "new_commitment",
    "position_commitment",
    "secret_in",
    "amount_in",
    "secret_out",
    "nullifier_out",
    "amount_out",
    "pathElements",
    "pathIndices",
];
const BURN_FIELDS: &[&str] = &[
    "nullifier",
    "root",
    "tick_lower",
    "tick_upper",
    "liquidity",
    "new_commitment",
    "position_commitment",
    "secret_out",
    "nullifier_out",
    "amount_out",
    "pathElements",
    "pathIndices",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Deposit,
    Swap,
    Withdraw,
    Mint,
    Burn,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Deposit => "deposit",
            Operation::Swap => "swap",
            Operation::Withdraw => "withdraw",
            Operation::Mint => "mint",
            Operation::Burn => "burn",
        }
    }

    /// Deposits are not proven: the commitment is computed locally.
    pub fn circuit(&self) -> Option<Circuit> {
        match self {
            Operation::Deposit => None,
            Operation::Swap => Some(Circuit::Swap),
            Operation::Withdraw => Some(Circuit::Withdraw),
            Operation::Mint | Operation::Burn => Some(Circuit::Lp),
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Operation::Deposit => DEPOSIT_FIELDS,
            Operation::Swap => SWAP_FIELDS,
            Operation::Withdraw => WITHDRAW_FIELDS,
            Operation::Mint => MINT_FIELDS,
            Operation::Burn => BURN_FIELDS,
        }
    }

    pub fn tx_kind(&self) -> TxKind {
        match self {
            Operation::Deposit => TxKind::Deposit,
            Operation::Swap => TxKind::Swap,
            Operation::Withdraw => TxKind::Withdraw,
            Operation::Mint => TxKind::Mint,
            Operation::Burn => TxKind::Burn,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Felt,
    Unsigned,
    Unsigned256,
    Signed,
    Tick,
    Bool,
    PathElements,
    PathIndices,
}

fn field_kind(name: &str) -> Option<FieldKind> {
    Some(match name {
        "nullifier" | "root" | "new_commitment" | "position_commitment" | "secret" | "secret_in"
        | "secret_out" | "nullifier_out" | "recipient" | "token" | "commitment" => FieldKind::Felt,
        "amount" | "amount_in" | "amount_out" | "liquidity" | "amount_specified" => {
            FieldKind::Unsigned
        }
        "new_sqrt_price_x128" | "sqrt_price_old" | "sqrt_price_limit" => FieldKind::Unsigned256,
        "amount0_delta" | "amount1_delta" => FieldKind::Signed,
        "tick_lower" | "tick_upper" | "new_tick" => FieldKind::Tick,
        "zero_for_one" => FieldKind::Bool,
        "pathElements" => FieldKind::PathElements,
        "pathIndices" => FieldKind::PathIndices,
        _ => return None,
    })
}

/// Fails with every absent field, in required-list order.
pub fn check_required(operation: Operation, inputs: &ProofInputs) -> Result<(), ClientError> {
    let missing: Vec<String> = operation
        .required_fields()
        .iter()
        .filter(|field| !inputs.is_populated(field))
        .map(|field| field.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ClientError::MissingFields {
            operation: operation.name().to_string(),
            fields: missing,
        })
    }
}

pub fn validate_formats(inputs: &ProofInputs, tree_depth: usize) -> Result<(), ClientError> {
    let mut keys: Vec<&str> = inputs.keys().collect();
    keys.sort_unstable();
    for key in keys {
        let (Some(kind), Some(value)) = (field_kind(key), inputs.encoded(key)) else {
            continue;
        };
        validate_field(key, kind, &value, tree_depth)
            .map_err(|err| ClientError::Validation(format!("{key}: {err}")))?;
    }
    if let (Some(lower), Some(upper)) = (
        scalar(inputs, "tick_lower").map(|v| parse_signed(&v)).transpose()?,
        scalar(inputs, "tick_upper").map(|v| parse_signed(&v)).transpose()?,
    ) {
        if lower >= upper {
            return Err(ClientError::Validation(format!(
                "tick_lower {lower} must be below tick_upper {upper}"
            )));
        }
    }
    Ok(())
}

fn validate_field(key: &str, kind: FieldKind, value: &Value, depth: usize) -> Result<(), ClientError> {
    match kind {
        FieldKind::PathElements | FieldKind::PathIndices => {
            let items = value
                .as_array()
                .ok_or_else(|| ClientError::Validation("expected an array".to_string()))?;
            if items.len() != depth {
                return Err(ClientError::Validation(format!(
                    "has {} levels, tree depth is {depth}",
                    items.len()
                )));
            }
            for item in items {
                match (kind, item) {
                    (FieldKind::PathIndices, Value::Number(bit)) => {
                        check_bit(&bit.to_string())?
                    }
                    (FieldKind::PathIndices, Value::String(text)) => check_bit(text)?,
                    (FieldKind::PathElements, Value::String(text)) => {
                        parse_felt(text)?;
                    }
                    _ => {
                        return Err(ClientError::Validation(format!(
                            "unexpected path entry {item}"
                        )))
                    }
                }
            }
            Ok(())
        }
        _ => {
            let text = value
                .as_str()
                .ok_or_else(|| ClientError::Validation(format!("{key} must be a string")))?;
            match kind {
                FieldKind::Felt => parse_felt(text).map(|_| ()),
                FieldKind::Unsigned => parse_u128(text).map(|_| ()),
                FieldKind::Unsigned256 => parse_u256(text).map(|_| ()),
                FieldKind::Signed => parse_signed(text).map(|_| ()),
                FieldKind::Tick => {
                    let tick = i32::try_from(parse_signed(text)?)
                        .map_err(|_| ClientError::Validation(format!("{text} is not an i32")))?;
                    check_tick(tick)
                }
                FieldKind::Bool => check_bit(text),
                FieldKind::PathElements | FieldKind::PathIndices => Ok(()),
            }
        }
    }
}

fn check_bit(text: &str) -> Result<(), ClientError> {
    match text {
        "0" | "1" => Ok(()),
        other => Err(ClientError::Validation(format!("{other} is not 0 or 1"))),
    }
}

fn scalar(inputs: &ProofInputs, key: &str) -> Option<String> {
    inputs
        .encoded(key)
        .and_then(|value| value.as_str().map(str::to_string))
}

pub struct ProofOrchestrator<P> {
    prover: P,
    tree_depth: usize,
    strict: bool,
    max_price_impact_bps: u128,
}

impl<P: ProverService> ProofOrchestrator<P> {
    pub fn new(prover: P, tree_depth: usize) -> Self {
        Self {
            prover,
            tree_depth,
            strict: true,
            max_price_impact_bps: 500,
        }
    }

    /// Turns local format validation on or off. Presence checks always run.
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_max_price_impact_bps(mut self, bps: u128) -> Self {
        self.max_price_impact_bps = bps;
        self
    }

    pub fn tree_depth(&self) -> usize {
        self.tree_depth
    }

    pub fn validate(&self, operation: Operation, inputs: &ProofInputs) -> Result<(), ClientError> {
        check_required(operation, inputs)?;
        if self.strict {
            validate_formats(inputs, self.tree_depth)?;
        }
        Ok(())
    }

    /// Builds the request for a proven operation. Unpopulated fields are dropped, never defaulted.
    pub fn prepare(&self, operation: Operation, mut inputs: ProofInputs) -> Result<ProofRequest, ClientError> {
        let circuit = operation.circuit().ok_or_else(|| {
            ClientError::Validation(format!("{operation} has no proof circuit"))
        })?;
        self.validate(operation, &inputs)?;
        let empty: Vec<String> = inputs
            .keys()
            .filter(|key| !inputs.is_populated(key))
            .map(str::to_string)
            .collect();
        for key in empty {
            inputs.remove(&key);
        }
        Ok(ProofRequest::new(circuit, inputs))
    }

    /// Rejects swaps whose quote moves the sqrt price more than the configured bound.
    pub fn guard_price_impact(&self, quote: &SwapQuote) -> Result<(), ClientError> {
        if quote.price_impact_bps > self.max_price_impact_bps {
            warn!(
                impact_bps = quote.price_impact_bps as u64,
                max_bps = self.max_price_impact_bps as u64,
                "swap rejected by price guard"
            );
            return Err(ClientError::Validation(format!(
                "price impact {} bps exceeds {} bps",
                quote.price_impact_bps, self.max_price_impact_bps
            )));
        }
        Ok(())
    }

    /// One request, one response. Failures are surfaced, never retried here.
    pub async fn prove(&self, operation: Operation, inputs: ProofInputs) -> Result<ProofResponse, ClientError> {
        let request = self.prepare(operation, inputs)?;
        debug!(%operation, circuit = %request.circuit, fields = request.inputs.len(), "requesting proof");
        let response = self.prover.prove(&request).await?;
        validate_response(operation, &request, &response)?;
        info!(%operation, proof_len = response.proof.len(), "proof validated");
        Ok(response)
    }
}

pub fn validate_response(
    operation: Operation,
    request: &ProofRequest,
    response: &ProofResponse,
) -> Result<(), ClientError> {
    let malformed = |msg: String| {
        warn!(%operation, "{msg}");
        ClientError::MalformedProofResponse(msg)
    };
    if response.proof.len() < MIN_PROOF_ELEMENTS {
        return Err(malformed(format!(
            "proof has {} elements, need at least {MIN_PROOF_ELEMENTS}",
            response.proof.len()
        )));
    }
    for (i, element) in response.proof.iter().enumerate() {
        parse_felt(element).map_err(|_| malformed(format!("proof[{i}] is not a field element")))?;
    }
    let schema = request.circuit.public_inputs();
    if response.public_inputs.len() != schema.len() {
        return Err(malformed(format!(
            "{} public inputs, {} expects {}",
            response.public_inputs.len(),
            request.circuit,
            schema.len()
        )));
    }
    let mut public = Vec::with_capacity(schema.len());
    for (name, value) in schema.iter().zip(response.public_inputs.iter()) {
        public.push(
            parse_felt(value)
                .map_err(|_| malformed(format!("public input {name} is not a field element")))?,
        );
    }
    for (name, value) in schema.iter().zip(public.iter()) {
        let Some(expected) = echoed_request_value(&request.inputs, name)? else {
            continue;
        };
        if expected != *value {
            return Err(malformed(format!(
                "public input {name} is {}, request had {}",
                felt_to_hex(value),
                felt_to_hex(&expected)
            )));
        }
    }
    Ok(())
}

/// Request value a public input must echo, when the request carries one.
fn echoed_request_value(inputs: &ProofInputs, name: &str) -> Result<Option<Felt>, ClientError> {
    let Some(text) = scalar(inputs, name) else {
        return Ok(None);
    };
    let value = match field_kind(name) {
        Some(FieldKind::Felt) | Some(FieldKind::Unsigned) | Some(FieldKind::Bool) => {
            parse_felt(&text)?
        }
        Some(FieldKind::Tick) => signed_to_felt(parse_signed(&text)?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}
