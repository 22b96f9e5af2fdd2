//! # units
//!
//! Fixed-point conversions used at every boundary.
//!
//! | Quantity         | Representation                     | Where            |
//! |------------------|------------------------------------|------------------|
//! | token amounts    | [`Stroops`] (`i128`, 7 decimals)   | API, ledger      |
//! | prices           | `f64` ratio (quote per base unit)  | ledger, reports  |
//! | oracle prices    | `i64` micro-units (6 decimals)     | contract only    |
//!
//! Nothing else in the crate multiplies or divides by a power of ten.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 1 token = 10^7 stroops.
pub const STROOPS_PER_UNIT: i128 = 10_000_000;

/// 1 price unit = 10^6 micro-units (on-chain oracle convention).
pub const MICROS_PER_PRICE_UNIT: f64 = 1_000_000.0;

/// Largest magnitude an f64 carries without dropping integer digits (2^53).
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

// ─── Stroops ──────────────────────────────────────────────────────────────────

/// Canonical fixed-point token quantity.
///
/// Serialized as a decimal string, which is what the aggregator API sends and
/// expects; deserialization also accepts plain JSON integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Stroops(pub i128);

impl Stroops {
    pub const ZERO: Stroops = Stroops(0);

    /// Converts a whole-unit decimal amount, rounding to the nearest stroop.
    pub fn from_units(units: f64) -> Self {
        Stroops((units * STROOPS_PER_UNIT as f64).round() as i128)
    }

    /// Whole-unit view, for price and PnL arithmetic.
    pub fn to_units(self) -> f64 {
        self.0 as f64 / STROOPS_PER_UNIT as f64
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Stroops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Stroops {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Stroops {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Uint(u64),
            Float(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s
                .trim()
                .parse::<i128>()
                .map(Stroops)
                .map_err(|e| serde::de::Error::custom(format!("invalid stroop amount {s:?}: {e}"))),
            Raw::Int(i) => Ok(Stroops(i as i128)),
            Raw::Uint(u) => Ok(Stroops(u as i128)),
            Raw::Float(f) if f.abs() > MAX_EXACT_FLOAT => Err(serde::de::Error::custom(format!(
                "stroop amount {f} is too large for a JSON number, send it as a string"
            ))),
            Raw::Float(f) if f.fract() == 0.0 => Ok(Stroops(f as i128)),
            Raw::Float(f) => Err(serde::de::Error::custom(format!(
                "fractional stroop amount {f}"
            ))),
        }
    }
}

// ─── Prices ───────────────────────────────────────────────────────────────────

/// Execution price of a swap: `amount_out / amount_in` in whole units.
///
/// Both legs are Stellar assets with the same precision, so the ratio of the
/// raw stroop counts equals the ratio of whole units.
pub fn execution_price(amount_in: Stroops, amount_out: Stroops) -> Option<f64> {
    if !amount_in.is_positive() || !amount_out.is_positive() {
        return None;
    }
    Some(amount_out.0 as f64 / amount_in.0 as f64)
}

/// Converts a price to oracle micro-units, as the contract's
/// `update_price_from_oracle` expects.
pub fn price_to_micros(price: f64) -> i64 {
    (price * MICROS_PER_PRICE_UNIT).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_units_convert_to_stroops() {
        assert_eq!(Stroops::from_units(10.0), Stroops(100_000_000));
        assert_eq!(Stroops::from_units(0.0000001), Stroops(1));
        assert!((Stroops(15_000_000).to_units() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn price_converts_to_micro_units() {
        assert_eq!(price_to_micros(0.15), 150_000);
        assert_eq!(price_to_micros(45_000.0), 45_000_000_000);
    }

    #[test]
    fn execution_price_rejects_empty_legs() {
        assert_eq!(execution_price(Stroops::ZERO, Stroops(5)), None);
        assert_eq!(execution_price(Stroops(5), Stroops(-1)), None);
        let p = execution_price(Stroops::from_units(1000.0), Stroops::from_units(150.0)).unwrap();
        assert!((p - 0.15).abs() < 1e-12);
    }

    #[test]
    fn stroops_accept_string_and_number_json() {
        let a: Stroops = serde_json::from_str("\"1234567\"").unwrap();
        let b: Stroops = serde_json::from_str("1234567").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<Stroops>("\"12.5\"").is_err());
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"1234567\"");
    }

    #[test]
    fn large_json_integers_stay_exact() {
        let max: Stroops = serde_json::from_str("18446744073709551615").unwrap();
        assert_eq!(max, Stroops(u64::MAX as i128));

        let past_u64 = serde_json::from_str::<Stroops>("100000000000000000000");
        assert!(past_u64.is_err());
        let big: Stroops = serde_json::from_str("\"100000000000000000000\"").unwrap();
        assert_eq!(big, Stroops(100_000_000_000_000_000_000));
    }
}
