// Lossless XLM <-> stroops conversion.
//
// 1 XLM = 10^7 stroops. Every amount that crosses the settlement boundary is an
// integer number of stroops; decimal strings only exist at the API edge.

use std::fmt;
use std::ops::Neg;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, AppResult};

pub const STROOPS_PER_XLM: i64 = 10_000_000;
pub const DECIMALS: u32 = 7;

/// Integer amount of base units on the settlement chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Stroops(pub i64);

impl Stroops {
    pub const ZERO: Stroops = Stroops(0);

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Stroops) -> Option<Stroops> {
        self.0.checked_add(other.0).map(Stroops)
    }

    pub fn checked_sub(self, other: Stroops) -> Option<Stroops> {
        self.0.checked_sub(other.0).map(Stroops)
    }

    /// Sum that fails with `Validation` instead of wrapping.
    pub fn checked_sum<I: IntoIterator<Item = Stroops>>(amounts: I) -> AppResult<Stroops> {
        amounts.into_iter().try_fold(Stroops::ZERO, |acc, amount| {
            acc.checked_add(amount)
                .ok_or_else(|| AppError::Validation("Amount total out of range".into()))
        })
    }

    /// Parse a non-negative decimal string with at most 7 fractional digits.
    pub fn parse(input: &str) -> AppResult<Self> {
        xlm_to_stroops(input)
    }
}

/// Decimal string -> stroops. Missing fractional digits are zero-padded, never rounded.
pub fn xlm_to_stroops(input: &str) -> AppResult<Stroops> {
    let invalid = || {
        AppError::Validation(format!(
            "Invalid amount '{}': use digits with up to {} decimal places",
            input, DECIMALS
        ))
    };

    let (whole, frac) = match input.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (input, ""),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > DECIMALS as usize || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let mut padded = String::with_capacity(DECIMALS as usize);
    padded.push_str(frac);
    while padded.len() < DECIMALS as usize {
        padded.push('0');
    }

    let out_of_range = || AppError::Validation(format!("Amount '{}' out of range", input));
    let whole: i64 = whole.parse().map_err(|_| out_of_range())?;
    let frac: i64 = padded.parse().map_err(|_| invalid())?;

    whole
        .checked_mul(STROOPS_PER_XLM)
        .and_then(|w| w.checked_add(frac))
        .map(Stroops)
        .ok_or_else(out_of_range)
}

/// Stroops -> decimal string. With `trim`, trailing fractional zeros (and a bare dot) are dropped.
pub fn stroops_to_xlm_string(amount: Stroops, trim: bool) -> String {
    let negative = amount.0 < 0;
    let abs = amount.0.unsigned_abs();
    let per = STROOPS_PER_XLM as u64;
    let whole = abs / per;
    let mut frac = format!("{:07}", abs % per);

    if trim {
        while frac.ends_with('0') {
            frac.pop();
        }
    }

    let base = if frac.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, frac)
    };

    if negative {
        format!("-{}", base)
    } else {
        base
    }
}

impl fmt::Display for Stroops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&stroops_to_xlm_string(*self, true))
    }
}

impl Neg for Stroops {
    type Output = Stroops;

    fn neg(self) -> Stroops {
        Stroops(self.0.saturating_neg())
    }
}

impl Serialize for Stroops {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&stroops_to_xlm_string(*self, true))
    }
}

struct StroopsVisitor;

impl<'de> Visitor<'de> for StroopsVisitor {
    type Value = Stroops;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative XLM amount with at most 7 decimal places")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Stroops, E> {
        xlm_to_stroops(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Stroops, E> {
        xlm_to_stroops(&v.to_string()).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Stroops, E> {
        xlm_to_stroops(&v.to_string()).map_err(E::custom)
    }

    // A JSON fraction has already been through f64 here; only strings keep every digit.
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Stroops, E> {
        Err(E::custom(format!(
            "fractional amount {} must be sent as a decimal string",
            v
        )))
    }
}

impl<'de> Deserialize<'de> for Stroops {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Stroops, D::Error> {
        deserializer.deserialize_any(StroopsVisitor)
    }
}
