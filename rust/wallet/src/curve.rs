//! Concentrated-liquidity curve math on Q128.128 square-root prices.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

use crate::codec::{q128, split, U256Words};
use crate::error::ClientError;

pub const MIN_TICK: i32 = -887272;
pub const MAX_TICK: i32 = 887272;
/// Pool fees are expressed in parts per million.
pub const FEE_DENOMINATOR: u128 = 1_000_000;
pub const BPS_DENOMINATOR: u128 = 10_000;

const TICK_FACTORS: [u128; 19] = [
    0xfff97272373d413259a46990580e213a,
    0xfff2e50f5f656932ef12357cf3c7fdcc,
    0xffe5caca7e10e4e61c3624eaa0941cd0,
    0xffcb9843d60f6159c9db58835c926644,
    0xff973b41fa98c081472e6896dfb254c0,
    0xff2ea16466c96a3843ec78b326b52861,
    0xfe5dee046a99a2a811c461f1969c3053,
    0xfcbe86c7900a88aedcffc83b479aa3a4,
    0xf987a7253ac413176f2b074cf7815e54,
    0xf3392b0822b70005940c7a398e4b70f3,
    0xe7159475a2c29b7443b29c7fa6e889d9,
    0xd097f3bdfd2022b8845ad8f792aa5825,
    0xa9f746462d870fdf8a65dc1f90e061e5,
    0x70d869a156d2a1b890bb3df62baf32f7,
    0x31be135f97d08fd981231505542fcfa6,
    0x9aa508b5b7a84e1c677de54f3e99bc9,
    0x5d6af8dedb81196699c329225ee604,
    0x2216e584f5fa1ea926041bedfe98,
    0x48a170391f7dc42444e8fa2,
];
const TICK_FACTOR_ODD: u128 = 0xfffcb933bd6fad37aa2d162d1a594001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapQuote {
    /// Signed from the trader's side: what leaves the note is negative.
    pub amount0_delta: i128,
    pub amount1_delta: i128,
    pub amount_out: u128,
    pub fee_amount: u128,
    pub sqrt_price_before: U256Words,
    pub sqrt_price_after: U256Words,
    pub tick_after: i32,
    pub price_impact_bps: u128,
}

pub fn check_tick(tick: i32) -> Result<(), ClientError> {
    if !(MIN_TICK..=MAX_TICK).contains(&tick) {
        return Err(ClientError::Validation(format!(
            "tick {tick} outside [{MIN_TICK}, {MAX_TICK}]"
        )));
    }
    Ok(())
}

/// `sqrt(1.0001^tick) * 2^128`.
pub fn sqrt_ratio_at_tick(tick: i32) -> Result<BigUint, ClientError> {
    check_tick(tick)?;
    let abs_tick = tick.unsigned_abs();
    let mut ratio = if abs_tick & 1 != 0 {
        BigUint::from(TICK_FACTOR_ODD)
    } else {
        q128()
    };
    for (bit, factor) in TICK_FACTORS.iter().enumerate() {
        if abs_tick & (2u32 << bit) != 0 {
            ratio = (ratio * BigUint::from(*factor)) >> 128u32;
        }
    }
    if tick > 0 {
        let max_u256 = (BigUint::one() << 256u32) - BigUint::one();
        ratio = max_u256 / ratio;
    }
    Ok(ratio)
}

pub fn min_sqrt_ratio() -> Result<BigUint, ClientError> {
    sqrt_ratio_at_tick(MIN_TICK)
}

pub fn max_sqrt_ratio() -> Result<BigUint, ClientError> {
    sqrt_ratio_at_tick(MAX_TICK)
}

/// Greatest tick whose sqrt ratio is at or below `sqrt_price`.
pub fn tick_at_sqrt_ratio(sqrt_price: &BigUint) -> Result<i32, ClientError> {
    if *sqrt_price < min_sqrt_ratio()? || *sqrt_price > max_sqrt_ratio()? {
        return Err(ClientError::Validation(format!(
            "sqrt price {sqrt_price} outside the tick range"
        )));
    }
    let (mut lo, mut hi) = (MIN_TICK, MAX_TICK);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if sqrt_ratio_at_tick(mid)? <= *sqrt_price {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

/// Holds when `sqrt_ratio_at_tick(tick) <= sqrt_price < sqrt_ratio_at_tick(tick + 1)`.
pub fn tick_matches_price(tick: i32, sqrt_price: &BigUint) -> Result<bool, ClientError> {
    let lower = sqrt_ratio_at_tick(tick)?;
    if *sqrt_price < lower {
        return Ok(false);
    }
    if tick == MAX_TICK {
        return Ok(true);
    }
    Ok(*sqrt_price < sqrt_ratio_at_tick(tick + 1)?)
}

pub fn compute_fee(amount: u128, fee: u128) -> u128 {
    let product = BigUint::from(amount) * BigUint::from(fee);
    div_ceil(&product, &BigUint::from(FEE_DENOMINATOR))
        .to_u128()
        .unwrap_or(u128::MAX)
}

pub fn next_sqrt_ratio_from_amount0(
    sqrt_ratio: &BigUint,
    liquidity: u128,
    amount: u128,
) -> BigUint {
    if amount == 0 {
        return sqrt_ratio.clone();
    }
    let numerator1 = BigUint::from(liquidity) << 128u32;
    let denom = &numerator1 / sqrt_ratio + BigUint::from(amount);
    div_ceil(&numerator1, &denom)
}

pub fn next_sqrt_ratio_from_amount1(
    sqrt_ratio: &BigUint,
    liquidity: u128,
    amount: u128,
) -> BigUint {
    let numerator = BigUint::from(amount) << 128u32;
    let safe_liq = if liquidity == 0 { 1u128 } else { liquidity };
    sqrt_ratio + numerator / BigUint::from(safe_liq)
}

pub fn amount0_delta(
    sqrt_a: &BigUint,
    sqrt_b: &BigUint,
    liquidity: u128,
    round_up: bool,
) -> Result<u128, ClientError> {
    let (lower, upper) = ordered(sqrt_a, sqrt_b);
    if lower.is_zero() {
        return Err(ClientError::Validation("sqrt ratio is zero".to_string()));
    }
    let numerator1 = BigUint::from(liquidity) << 128u32;
    let mul = &numerator1 * (upper - lower);
    let amount = if round_up {
        div_ceil(&div_ceil(&mul, upper), lower)
    } else {
        (&mul / upper) / lower
    };
    amount
        .to_u128()
        .ok_or_else(|| ClientError::Validation("amount0 overflow".to_string()))
}

pub fn amount1_delta(
    sqrt_a: &BigUint,
    sqrt_b: &BigUint,
    liquidity: u128,
    round_up: bool,
) -> Result<u128, ClientError> {
    let (lower, upper) = ordered(sqrt_a, sqrt_b);
    let product = (upper - lower) * BigUint::from(liquidity);
    let mut amount = &product >> 128u32;
    let low_mask = (BigUint::one() << 128u32) - BigUint::one();
    if round_up && !(&product & &low_mask).is_zero() {
        amount += BigUint::one();
    }
    amount
        .to_u128()
        .ok_or_else(|| ClientError::Validation("amount1 overflow".to_string()))
}

/// Token amounts backing `liquidity` in `[tick_lower, tick_upper)` at `sqrt_price`.
pub fn liquidity_amounts(
    sqrt_price: &BigUint,
    tick_lower: i32,
    tick_upper: i32,
    liquidity: u128,
    round_up: bool,
) -> Result<(u128, u128), ClientError> {
    if tick_lower >= tick_upper {
        return Err(ClientError::Validation(format!(
            "tick_lower {tick_lower} must be below tick_upper {tick_upper}"
        )));
    }
    let sqrt_lower = sqrt_ratio_at_tick(tick_lower)?;
    let sqrt_upper = sqrt_ratio_at_tick(tick_upper)?;
    if *sqrt_price <= sqrt_lower {
        Ok((amount0_delta(&sqrt_lower, &sqrt_upper, liquidity, round_up)?, 0))
    } else if *sqrt_price < sqrt_upper {
        Ok((
            amount0_delta(sqrt_price, &sqrt_upper, liquidity, round_up)?,
            amount1_delta(&sqrt_lower, sqrt_price, liquidity, round_up)?,
        ))
    } else {
        Ok((0, amount1_delta(&sqrt_lower, &sqrt_upper, liquidity, round_up)?))
    }
}

/// Exact-input quote within the current liquidity range.
pub fn quote_exact_input(
    sqrt_price: &BigUint,
    liquidity: u128,
    amount_in: u128,
    zero_for_one: bool,
    fee: u128,
) -> Result<SwapQuote, ClientError> {
    if liquidity == 0 {
        return Err(ClientError::Validation("pool has no active liquidity".to_string()));
    }
    if amount_in == 0 {
        return Err(ClientError::Validation("swap amount must be > 0".to_string()));
    }
    if fee >= FEE_DENOMINATOR {
        return Err(ClientError::Validation(format!("fee {fee} is not below 100%")));
    }
    let amount_in_i = i128::try_from(amount_in)
        .map_err(|_| ClientError::Validation("swap amount exceeds i128".to_string()))?;
    let fee_amount = compute_fee(amount_in, fee);
    let after_fee = amount_in.saturating_sub(fee_amount);

    let (next, amount_out) = if zero_for_one {
        let next = next_sqrt_ratio_from_amount0(sqrt_price, liquidity, after_fee);
        let out = amount1_delta(&next, sqrt_price, liquidity, false)?;
        (next, out)
    } else {
        let next = next_sqrt_ratio_from_amount1(sqrt_price, liquidity, after_fee);
        let out = amount0_delta(sqrt_price, &next, liquidity, false)?;
        (next, out)
    };
    if next < min_sqrt_ratio()? || next > max_sqrt_ratio()? {
        return Err(ClientError::Validation(
            "swap moves the price outside the tick range".to_string(),
        ));
    }
    let out_i = i128::try_from(amount_out)
        .map_err(|_| ClientError::Validation("swap output exceeds i128".to_string()))?;
    let (amount0_delta, amount1_delta) = if zero_for_one {
        (-amount_in_i, out_i)
    } else {
        (out_i, -amount_in_i)
    };

    Ok(SwapQuote {
        amount0_delta,
        amount1_delta,
        amount_out,
        fee_amount,
        sqrt_price_before: split(sqrt_price)?,
        sqrt_price_after: split(&next)?,
        tick_after: tick_at_sqrt_ratio(&next)?,
        price_impact_bps: price_impact_bps(sqrt_price, &next),
    })
}

/// Relative sqrt-price move in basis points, rounded up.
pub fn price_impact_bps(before: &BigUint, after: &BigUint) -> u128 {
    if before.is_zero() {
        return u128::MAX;
    }
    let (lower, upper) = ordered(before, after);
    let moved = (upper - lower) * BigUint::from(BPS_DENOMINATOR);
    div_ceil(&moved, before).to_u128().unwrap_or(u128::MAX)
}

fn ordered<'a>(a: &'a BigUint, b: &'a BigUint) -> (&'a BigUint, &'a BigUint) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn div_ceil(numerator: &BigUint, denominator: &BigUint) -> BigUint {
    let q = numerator / denominator;
    if (&q * denominator) == *numerator {
        q
    } else {
        q + BigUint::one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_zero_is_unit_price() {
        assert_eq!(sqrt_ratio_at_tick(0).expect("ratio"), q128());
        assert_eq!(tick_at_sqrt_ratio(&q128()).expect("tick"), 0);
    }

    #[test]
    fn ratio_grows_with_tick() {
        let ticks = [MIN_TICK, -60_000, -60, -1, 0, 1, 60, 60_000, MAX_TICK];
        let ratios: Vec<BigUint> = ticks
            .iter()
            .map(|t| sqrt_ratio_at_tick(*t).expect("ratio"))
            .collect();
        assert!(ratios.windows(2).all(|w| w[0] < w[1]));
        assert!(sqrt_ratio_at_tick(MAX_TICK + 1).is_err());
    }

    #[test]
    fn tick_lookup_inverts_ratio() {
        for tick in [-887_000, -12_345, -61, -1, 1, 59, 200_000] {
            let ratio = sqrt_ratio_at_tick(tick).expect("ratio");
            assert_eq!(tick_at_sqrt_ratio(&ratio).expect("tick"), tick);
            let inside = &ratio + BigUint::one();
            assert!(tick_matches_price(tick, &inside).expect("match"));
            assert!(!tick_matches_price(tick + 1, &inside).expect("match"));
        }
    }

    #[test]
    fn fee_rounds_up() {
        assert_eq!(compute_fee(500_000, 3000), 1500);
        assert_eq!(compute_fee(1, 3000), 1);
        assert_eq!(compute_fee(0, 3000), 0);
    }

    #[test]
    fn zero_for_one_quote_pays_token0() {
        let liquidity = 1_000_000_000_000u128;
        let quote = quote_exact_input(&q128(), liquidity, 500_000, true, 3000).expect("quote");
        assert_eq!(quote.amount0_delta, -500_000);
        assert!(quote.amount1_delta > 0);
        assert!(quote.amount1_delta < 500_000);
        assert!(quote.sqrt_price_after < quote.sqrt_price_before);
        assert!(quote.tick_after < 0);
        assert_eq!(quote.fee_amount, 1500);
    }

    #[test]
    fn one_for_zero_quote_raises_price() {
        let quote = quote_exact_input(&q128(), 1_000_000_000, 10_000, false, 0).expect("quote");
        assert_eq!(quote.amount1_delta, -10_000);
        assert!(quote.amount0_delta > 0);
        assert!(quote.sqrt_price_after > quote.sqrt_price_before);
        assert!(quote.tick_after >= 0);
    }

    #[test]
    fn empty_pool_cannot_quote() {
        assert!(quote_exact_input(&q128(), 0, 10, true, 3000).is_err());
    }

    #[test]
    fn large_swaps_show_large_impact() {
        let small = quote_exact_input(&q128(), 1_000_000_000, 1_000, true, 3000).expect("small");
        let large = quote_exact_input(&q128(), 1_000_000_000, 200_000_000, true, 3000).expect("large");
        assert!(small.price_impact_bps <= 1);
        assert!(large.price_impact_bps > 500);
    }

    #[test]
    fn liquidity_amounts_follow_price_position() {
        let price = q128();
        let (a0, a1) = liquidity_amounts(&price, 60, 120, 1_000_000, true).expect("above");
        assert!(a0 > 0);
        assert_eq!(a1, 0);
        let (a0, a1) = liquidity_amounts(&price, -120, -60, 1_000_000, true).expect("below");
        assert_eq!(a0, 0);
        assert!(a1 > 0);
        let (a0, a1) = liquidity_amounts(&price, -60, 60, 1_000_000, true).expect("inside");
        assert!(a0 > 0 && a1 > 0);
    }
}
