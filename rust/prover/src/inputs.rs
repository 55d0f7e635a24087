//! Input formatting for proof requests.
//!
//! The proving service takes a flat JSON object of decimal strings. Signed values keep a
//! leading `-`, booleans become `"0"`/`"1"` and Merkle paths are arrays. Path index bits are
//! plain numbers, which is how the service decodes them.

use std::collections::HashMap;

use num_bigint::BigUint;
use serde_json::Value;
use starknet::core::types::{Felt, U256};

use crate::circuit::Circuit;

#[derive(Debug, Clone)]
pub enum InputValue {
    Scalar(String),
    Felt(Felt),
    U128(u128),
    U256(U256),
    I32(i32),
    I128(i128),
    Bool(bool),
    VecFelt(Vec<Felt>),
    VecBool(Vec<bool>),
    Raw(Value),
}

impl InputValue {
    /// Empty strings and empty arrays count as absent.
    pub fn is_populated(&self) -> bool {
        match self {
            InputValue::Scalar(value) => !value.trim().is_empty(),
            InputValue::VecFelt(values) => !values.is_empty(),
            InputValue::VecBool(values) => !values.is_empty(),
            InputValue::Raw(Value::Null) => false,
            InputValue::Raw(Value::String(value)) => !value.trim().is_empty(),
            InputValue::Raw(Value::Array(values)) => !values.is_empty(),
            _ => true,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            InputValue::Scalar(value) => Value::String(value.clone()),
            InputValue::Felt(value) => Value::String(felt_to_decimal(value)),
            InputValue::U128(value) => Value::String(value.to_string()),
            InputValue::U256(value) => Value::String(u256_to_decimal(value)),
            InputValue::I32(value) => Value::String(value.to_string()),
            InputValue::I128(value) => Value::String(value.to_string()),
            InputValue::Bool(value) => Value::String(bool_to_string(*value)),
            InputValue::VecFelt(values) => Value::Array(
                values
                    .iter()
                    .map(|v| Value::String(felt_to_decimal(v)))
                    .collect(),
            ),
            InputValue::VecBool(values) => Value::Array(
                values.iter().map(|v| Value::from(u8::from(*v))).collect(),
            ),
            InputValue::Raw(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProofInputs {
    values: HashMap<String, InputValue>,
}

impl ProofInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: InputValue) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: InputValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&InputValue> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<InputValue> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_populated(&self, key: &str) -> bool {
        self.values.get(key).map(InputValue::is_populated).unwrap_or(false)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encoded form of a single field, as it would appear on the wire.
    pub fn encoded(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(InputValue::to_json)
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.values {
            map.insert(key.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct ProofRequest {
    pub circuit: Circuit,
    pub inputs: ProofInputs,
}

impl ProofRequest {
    pub fn new(circuit: Circuit, inputs: ProofInputs) -> Self {
        Self { circuit, inputs }
    }
}

pub fn felt_to_decimal(value: &Felt) -> String {
    BigUint::from_bytes_be(&value.to_bytes_be()).to_str_radix(10)
}

fn u256_to_decimal(value: &U256) -> String {
    let high = BigUint::from(value.high()) << 128u32;
    (high + BigUint::from(value.low())).to_str_radix(10)
}

fn bool_to_string(value: bool) -> String {
    if value { "1".to_string() } else { "0".to_string() }
}
