//! Numeric codec.
//!
//! Every amount, price and tick that ends up in a proof request or in calldata goes through
//! here. 256-bit values travel as two 128-bit words (`low`, `high`); signed values are encoded
//! in the Stark field as `P - |v|`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use starknet::core::types::{Felt, U256};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "WireWords", into = "WireWords")]
pub struct U256Words {
    pub low: u128,
    pub high: u128,
}

#[derive(Serialize, Deserialize)]
struct WireWords {
    low: String,
    high: String,
}

impl TryFrom<WireWords> for U256Words {
    type Error = ClientError;

    fn try_from(wire: WireWords) -> Result<Self, Self::Error> {
        Ok(Self {
            low: parse_u128(&wire.low)?,
            high: parse_u128(&wire.high)?,
        })
    }
}

impl From<U256Words> for WireWords {
    fn from(words: U256Words) -> Self {
        Self {
            low: words.low.to_string(),
            high: words.high.to_string(),
        }
    }
}

impl U256Words {
    pub const ZERO: U256Words = U256Words { low: 0, high: 0 };

    pub fn new(low: u128, high: u128) -> Self {
        Self { low, high }
    }

    pub fn from_u128(value: u128) -> Self {
        Self { low: value, high: 0 }
    }

    pub fn to_u256(self) -> U256 {
        U256::from_words(self.low, self.high)
    }

    pub fn from_u256(value: U256) -> Self {
        Self {
            low: value.low(),
            high: value.high(),
        }
    }

    pub fn to_biguint(self) -> BigUint {
        join(self)
    }

    pub fn is_zero(self) -> bool {
        self.low == 0 && self.high == 0
    }

    pub fn to_felts(self) -> [Felt; 2] {
        [Felt::from(self.low), Felt::from(self.high)]
    }
}

impl Ord for U256Words {
    fn cmp(&self, other: &Self) -> Ordering {
        self.high
            .cmp(&other.high)
            .then_with(|| self.low.cmp(&other.low))
    }
}

impl PartialOrd for U256Words {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for U256Words {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", join(*self))
    }
}

impl FromStr for U256Words {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_u256(value)
    }
}

impl From<u128> for U256Words {
    fn from(value: u128) -> Self {
        Self::from_u128(value)
    }
}

pub fn stark_modulus() -> BigUint {
    (BigUint::one() << 251u32) + (BigUint::from(17u32) << 192u32) + BigUint::one()
}

/// 2^128, the Q128.128 unit.
pub fn q128() -> BigUint {
    BigUint::one() << 128u32
}

pub fn split(value: &BigUint) -> Result<U256Words, ClientError> {
    if value.bits() > 256 {
        return Err(ClientError::Encoding(format!(
            "value {value} does not fit in 256 bits"
        )));
    }
    let mask = (BigUint::one() << 128u32) - BigUint::one();
    let low = (value & &mask)
        .to_u128()
        .ok_or_else(|| ClientError::Encoding("low word overflow".to_string()))?;
    let high = (value >> 128u32)
        .to_u128()
        .ok_or_else(|| ClientError::Encoding("high word overflow".to_string()))?;
    Ok(U256Words { low, high })
}

pub fn join(words: U256Words) -> BigUint {
    (BigUint::from(words.high) << 128u32) + BigUint::from(words.low)
}

/// Unsigned decimal or `0x` hex. Signs, separators and whitespace inside the digits are rejected.
pub fn parse_biguint(value: &str) -> Result<BigUint, ClientError> {
    let trimmed = value.trim();
    let (digits, radix) = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16u32),
        None => (trimmed, 10u32),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(ClientError::Encoding(format!(
            "not an unsigned integer: {value:?}"
        )));
    }
    BigUint::parse_bytes(digits.as_bytes(), radix)
        .ok_or_else(|| ClientError::Encoding(format!("not an unsigned integer: {value:?}")))
}

pub fn parse_u256(value: &str) -> Result<U256Words, ClientError> {
    split(&parse_biguint(value)?)
}

pub fn parse_u128(value: &str) -> Result<u128, ClientError> {
    parse_biguint(value)?
        .to_u128()
        .ok_or_else(|| ClientError::Encoding(format!("{value} exceeds u128")))
}

pub fn parse_signed(value: &str) -> Result<i128, ClientError> {
    let trimmed = value.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let magnitude = parse_u128(digits)?;
    signed_from_parts(negative, magnitude)
        .ok_or_else(|| ClientError::Encoding(format!("{value} exceeds i128")))
}

fn signed_from_parts(negative: bool, magnitude: u128) -> Option<i128> {
    if !negative {
        return i128::try_from(magnitude).ok();
    }
    if magnitude == 1u128 << 127 {
        return Some(i128::MIN);
    }
    i128::try_from(magnitude).ok().map(|m| -m)
}

pub fn parse_felt(value: &str) -> Result<Felt, ClientError> {
    felt_from_biguint(&parse_biguint(value)?)
}

pub fn felt_from_biguint(value: &BigUint) -> Result<Felt, ClientError> {
    if *value >= stark_modulus() {
        return Err(ClientError::Encoding(format!(
            "{value} is not below the field modulus"
        )));
    }
    Ok(Felt::from_bytes_be_slice(&value.to_bytes_be()))
}

pub fn felt_to_biguint(value: &Felt) -> BigUint {
    BigUint::from_bytes_be(&value.to_bytes_be())
}

pub fn felt_to_u128(value: &Felt) -> Result<u128, ClientError> {
    let bytes = value.to_bytes_be();
    if bytes[..16].iter().any(|b| *b != 0) {
        return Err(ClientError::Encoding(format!(
            "{} exceeds u128",
            felt_to_hex(value)
        )));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[16..32]);
    Ok(u128::from_be_bytes(buf))
}

pub fn felt_to_hex(value: &Felt) -> String {
    format!("0x{:x}", value)
}

pub fn felt_to_dec(value: &Felt) -> String {
    felt_to_biguint(value).to_str_radix(10)
}

pub fn bool_to_felt(value: bool) -> Felt {
    if value {
        Felt::ONE
    } else {
        Felt::ZERO
    }
}

pub fn felt_to_bool(value: &Felt) -> Result<bool, ClientError> {
    if *value == Felt::ZERO {
        Ok(false)
    } else if *value == Felt::ONE {
        Ok(true)
    } else {
        Err(ClientError::Encoding(format!(
            "{} is not a boolean",
            felt_to_hex(value)
        )))
    }
}

pub fn u256_to_felts(value: U256Words) -> [Felt; 2] {
    value.to_felts()
}

pub fn i32_to_felt(value: i32) -> Felt {
    signed_to_felt(i128::from(value))
}

pub fn signed_to_felt(value: i128) -> Felt {
    let magnitude = BigUint::from(value.unsigned_abs());
    if value >= 0 {
        Felt::from_bytes_be_slice(&magnitude.to_bytes_be())
    } else {
        let encoded = stark_modulus() - magnitude;
        Felt::from_bytes_be_slice(&encoded.to_bytes_be())
    }
}

pub fn felt_to_i32(value: &Felt) -> Result<i32, ClientError> {
    let signed = felt_to_signed(value)?;
    i32::try_from(signed)
        .map_err(|_| ClientError::Encoding(format!("{} out of i32 range", felt_to_hex(value))))
}

/// Inverse of [`signed_to_felt`]: values in the top half of the i128 range below the modulus
/// are negative.
pub fn felt_to_signed(value: &Felt) -> Result<i128, ClientError> {
    let modulus = stark_modulus();
    let as_big = felt_to_biguint(value);
    let max = BigUint::from(i128::MAX as u128);
    if as_big <= max {
        return as_big
            .to_i128()
            .ok_or_else(|| ClientError::Encoding("felt out of i128 range".to_string()));
    }
    let min_abs = BigUint::one() << 127u32;
    if as_big < &modulus - &min_abs {
        return Err(ClientError::Encoding(format!(
            "{} out of i128 range",
            felt_to_hex(value)
        )));
    }
    let magnitude = (&modulus - &as_big)
        .to_u128()
        .ok_or_else(|| ClientError::Encoding("felt out of i128 range".to_string()))?;
    if magnitude.is_zero() {
        return Err(ClientError::Encoding("felt out of i128 range".to_string()));
    }
    signed_from_parts(true, magnitude)
        .ok_or_else(|| ClientError::Encoding("felt out of i128 range".to_string()))
}

/// Decimal string form for a signed value (leading `-` kept).
pub fn signed_to_dec(value: i128) -> String {
    value.to_string()
}

pub mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_u128(&raw).map_err(serde::de::Error::custom)
    }
}
