//! Exact decimal probabilities.
//!
//! The backend stores chances as decimals and compares them exactly, so the
//! client cannot use floating point without disagreeing on boundaries. A
//! [`Probability`] is a fixed-point value with nine decimal places.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Number of decimal places carried by a [`Probability`].
pub const DECIMALS: u32 = 9;

/// Units per whole (1.0).
pub const SCALE: u64 = 10u64.pow(DECIMALS);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbabilityError {
    #[error("empty probability")]
    Empty,
    #[error("malformed probability: {0}")]
    Malformed(String),
    #[error("probability {0} has more than {DECIMALS} significant decimal places")]
    TooPrecise(String),
    #[error("probability {0} is outside [0, 1]")]
    OutOfRange(String),
}

/// A probability in `[0, 1]`, stored as billionths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Probability(u64);

impl Probability {
    pub const ZERO: Probability = Probability(0);
    pub const ONE: Probability = Probability(SCALE);

    /// Build from raw billionths. Values above one are clamped.
    pub const fn from_units(units: u64) -> Self {
        if units > SCALE {
            Probability(SCALE)
        } else {
            Probability(units)
        }
    }

    pub const fn units(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Probability) -> Probability {
        Probability::from_units(self.0.saturating_add(other.0))
    }

    pub fn saturating_mul(self, factor: u64) -> Probability {
        Probability::from_units(self.0.saturating_mul(factor))
    }

    /// Product of two probabilities, truncated to nine places.
    pub fn compose(self, other: Probability) -> Probability {
        let product = (self.0 as u128 * other.0 as u128) / SCALE as u128;
        Probability(product as u64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }
}

impl FromStr for Probability {
    type Err = ProbabilityError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProbabilityError::Empty);
        }
        if trimmed.starts_with('-') {
            return Err(ProbabilityError::OutOfRange(trimmed.to_string()));
        }
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);

        // Scientific notation shows up when small floats are formatted.
        if let Some((mantissa, exponent)) = trimmed.split_once(['e', 'E']) {
            let exponent: i32 = exponent
                .parse()
                .map_err(|_| ProbabilityError::Malformed(raw.to_string()))?;
            return parse_scientific(raw, mantissa, exponent);
        }

        let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(ProbabilityError::Malformed(raw.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ProbabilityError::Malformed(raw.to_string()));
        }

        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > DECIMALS as usize {
            return Err(ProbabilityError::TooPrecise(raw.to_string()));
        }
        let whole = whole.trim_start_matches('0');
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| ProbabilityError::OutOfRange(raw.to_string()))?
        };
        if whole > 1 {
            return Err(ProbabilityError::OutOfRange(raw.to_string()));
        }
        let mut fraction_units: u64 = 0;
        for (position, digit) in fraction.bytes().enumerate() {
            let digit = (digit - b'0') as u64;
            fraction_units += digit * 10u64.pow(DECIMALS - 1 - position as u32);
        }
        let units = whole * SCALE + fraction_units;
        if units > SCALE {
            return Err(ProbabilityError::OutOfRange(raw.to_string()));
        }
        Ok(Probability(units))
    }
}

fn parse_scientific(
    raw: &str,
    mantissa: &str,
    exponent: i32,
) -> Result<Probability, ProbabilityError> {
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = format!("{whole}{fraction}");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ProbabilityError::Malformed(raw.to_string()));
    }
    // Drop leading zeros so the point position reflects the first
    // significant digit.
    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(Probability::ZERO);
    }
    let skipped = (digits.len() - significant.len()) as i64;
    // Position of the decimal point after shifting by the exponent.
    let point = whole.len() as i64 + exponent as i64 - skipped;
    if point > 1 {
        return Err(ProbabilityError::OutOfRange(raw.to_string()));
    }
    if point < -(DECIMALS as i64) {
        return Err(ProbabilityError::TooPrecise(raw.to_string()));
    }
    let digits = significant;
    let plain = if point <= 0 {
        format!("0.{}{}", "0".repeat((-point) as usize), digits)
    } else {
        let (head, tail) = digits.split_at(point as usize);
        format!("{head}.{tail}")
    };
    plain.parse().map_err(|err| match err {
        ProbabilityError::Malformed(_) => ProbabilityError::Malformed(raw.to_string()),
        ProbabilityError::TooPrecise(_) => ProbabilityError::TooPrecise(raw.to_string()),
        ProbabilityError::OutOfRange(_) => ProbabilityError::OutOfRange(raw.to_string()),
        ProbabilityError::Empty => ProbabilityError::Empty,
    })
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let fraction = self.0 % SCALE;
        if fraction == 0 {
            return write!(f, "{whole}");
        }
        let fraction = format!("{:0width$}", fraction, width = DECIMALS as usize);
        write!(f, "{}.{}", whole, fraction.trim_end_matches('0'))
    }
}

impl Serialize for Probability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Probability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = Probability;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal probability as a string or number")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Probability, E> {
                value.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Probability, E> {
                value.to_string().parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Probability, E> {
                value.to_string().parse().map_err(E::custom)
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Probability, E> {
                // `Display` for f64 yields the shortest representation that
                // round-trips, which is the decimal the server wrote.
                value.to_string().parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
